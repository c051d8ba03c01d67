pub mod analytics;
pub mod chat;
pub mod push;
pub mod relay;

pub use analytics::{AnalyticsEvent, AnalyticsSink, HttpAnalyticsSink, LogAnalyticsSink, MemoryAnalyticsSink};
pub use chat::{ChatService, HttpChatService, InMemoryChatService};
pub use push::{HttpPushNotifier, LogPushNotifier, PushNotifier, RecordingPushNotifier};
pub use relay::{run_pg_listener, spawn_local_consumer, EventRelay, LocalRelay, PgRelay};
