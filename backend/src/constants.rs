// =============================================================================
// Matchmaker Backend Constants
// =============================================================================
// Tunable defaults for the matching engine. Every value here can be
// overridden from the environment through `Config::from_env`.

// =============================================================================
// SERVER CONFIGURATION
// =============================================================================

/// Default server port if not specified in environment
pub const DEFAULT_SERVER_PORT: u16 = 3000;

/// Default Postgres pool size
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Header carrying the caller's user id (authentication happens upstream)
pub const USER_ID_HEADER: &str = "x-user-id";

// =============================================================================
// PROPOSALS
// =============================================================================

/// How long both sides have to answer a proposal
pub const DEFAULT_PROPOSAL_TIMEOUT_SECS: i64 = 45;

/// Attempts at a proposal check-and-set before giving up on a respond call
pub const MAX_RESPOND_ATTEMPTS: usize = 3;

// =============================================================================
// SEARCH QUEUE
// =============================================================================

/// Minimum compatibility score for a pair to be eligible
pub const DEFAULT_MIN_COMPATIBILITY_SCORE: u8 = 5;

/// Maximum candidates returned by a single lookup
pub const DEFAULT_MAX_CANDIDATES: usize = 20;

/// Candidate rows pulled from the store per lookup before filtering
pub const CANDIDATE_SCAN_LIMIT: usize = 500;

/// Size of a geospatial bucket in degrees (roughly 11km of latitude)
pub const DEFAULT_GRID_CELL_DEGREES: f64 = 0.1;

/// Radius used when the criteria omit one
pub const DEFAULT_SEARCH_RADIUS_KM: f64 = 50.0;

/// Largest radius a searcher may declare
pub const MAX_SEARCH_RADIUS_KM: f64 = 500.0;

/// Searchers handled per matching round
pub const MATCHING_ROUND_BATCH: usize = 200;

/// Profiles with no activity for this many days never surface as candidates
pub const DEFAULT_INACTIVE_DAYS: i64 = 45;

// =============================================================================
// CRITERIA VALIDATION
// =============================================================================

pub const MIN_AGE: u8 = 18;
pub const MAX_AGE: u8 = 120;
pub const MAX_CRITERIA_TAGS: usize = 20;
pub const MAX_TAG_LENGTH: usize = 64;

// =============================================================================
// SCORING POLICY
// =============================================================================

/// Points for identical ages, falling to zero at `AGE_ZERO_SCORE_GAP`
pub const AGE_MAX_POINTS: f64 = 20.0;
pub const AGE_ZERO_SCORE_GAP: f64 = 20.0;

/// Full points per shared interest up to the cap, a quarter beyond it
pub const INTEREST_POINTS_EACH: f64 = 10.0;
pub const INTEREST_FULL_VALUE_CAP: usize = 3;
pub const INTEREST_MAX_POINTS: f64 = 35.0;

/// Full points per shared need up to the cap, a quarter beyond it
pub const NEED_POINTS_EACH: f64 = 12.0;
pub const NEED_FULL_VALUE_CAP: usize = 2;
pub const NEED_MAX_POINTS: f64 = 30.0;

/// Points for zero distance, falling to zero at the radius
pub const DISTANCE_MAX_POINTS: f64 = 15.0;

/// Points for identical bios (word-overlap similarity)
pub const BIO_MAX_POINTS: f64 = 5.0;

/// Mean earth radius used by the haversine distance
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// =============================================================================
// BLIND DATES
// =============================================================================

/// Replaces every character of a masked name except the first
pub const MASK_CHAR: char = '*';

/// Default message count for the `messages:` reveal policy
pub const DEFAULT_REVEAL_MESSAGE_THRESHOLD: u32 = 20;

// =============================================================================
// BACKGROUND WORKERS
// =============================================================================

pub const EXPIRY_SWEEP_INTERVAL_SECS: u64 = 5;
pub const MATCHING_INTERVAL_SECS: u64 = 3;
pub const CHAT_RETRY_INTERVAL_SECS: u64 = 15;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const STALE_PROCESS_SECS: i64 = 60;
pub const DISCONNECTED_GRACE_SECS: i64 = 120;
pub const METRICS_REFRESH_INTERVAL_SECS: u64 = 10;
pub const REVEAL_TICK_INTERVAL_SECS: u64 = 30;

/// Matches picked up per chat retry iteration
pub const CHAT_RETRY_BATCH: usize = 50;

/// Blind dates re-checked per reveal tick
pub const REVEAL_TICK_BATCH: usize = 200;

// =============================================================================
// CHAT CREATION RETRIES
// =============================================================================

pub const CHAT_RETRY_ATTEMPTS: u32 = 4;
pub const CHAT_RETRY_BASE_DELAY_MS: u64 = 200;
pub const CHAT_RETRY_MAX_DELAY_MS: u64 = 5_000;

// =============================================================================
// REALTIME DELIVERY
// =============================================================================

/// Buffered events per live connection before the connection is treated as dead
pub const CONNECTION_BUFFER: usize = 64;

/// Postgres NOTIFY channel used to route events between processes
pub const RELAY_CHANNEL: &str = "matchmaker_events";

/// Timeout applied to calls against collaborator services
pub const COLLABORATOR_TIMEOUT_SECS: u64 = 10;
