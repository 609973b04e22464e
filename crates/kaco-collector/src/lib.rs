mod config;
mod output;

pub use config::CollectorConfig;
pub use output::{event_line, snapshot_line};
