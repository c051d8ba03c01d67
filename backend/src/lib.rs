pub mod bootstrap;
pub mod constants;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

pub use db::connection::get_db_pool;
pub use engine::MatchEngine;
pub use error::{MatchError, MatchResult};
pub use utils::config::Config;
