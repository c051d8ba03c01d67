pub mod connection;
pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;

pub use connection::{get_db_pool, DatabaseConfig};
pub use memory::MemoryStore;
pub use migrations::run_migrations;
pub use postgres::PgMatchStore;
pub use store::{MatchStore, PruneReport, Resolution, ScanCursor, StoreCounts};
