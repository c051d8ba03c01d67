pub mod backoff;
pub mod config;
pub mod geo;
pub mod logging;

pub use config::{Config, StoreBackend};
pub use logging::init_logging;
