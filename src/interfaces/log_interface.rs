use async_trait::async_trait;
use log::{info, warn};
use crate::interfaces::interface::{Interface, UsageRecord};

/// Writes each usage record to the service log as `USAGE: {json}`.
pub struct LogInterface;

#[async_trait]
impl Interface for LogInterface {
    async fn send_usage(&mut self, record: &UsageRecord) {
        match serde_json::to_string(record) {
            Ok(json) => info!("USAGE: {}", json),
            Err(e) => warn!("Could not serialize usage record: {}", e),
        }
    }
}
