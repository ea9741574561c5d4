use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::Mutex;
use crate::config::Config;
use crate::interfaces::file_interface::FileInterface;
use crate::interfaces::log_interface::LogInterface;


/// One line per API operation, for auditing and billing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    pub operation: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<usize>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsageRecord {
    pub fn new(client_key: &str, operation: &str, success: bool, execution_time_ms: u64) -> Self {
        UsageRecord {
            timestamp: Utc::now(),
            client: mask_key(client_key),
            operation: operation.to_string(),
            success,
            processed: None,
            execution_time_ms,
            error: None,
        }
    }
}

/// Keeps the first six characters of a client key.
pub fn mask_key(client_key: &str) -> String {
    let visible: String = client_key.chars().take(6).collect();
    if client_key.chars().count() > 6 {
        format!("{}***", visible)
    } else {
        visible
    }
}

#[async_trait]
pub trait Interface: Send {
    async fn send_usage(&mut self, record: &UsageRecord);
}


/// Fans a usage record out to every configured interface.
#[derive(Clone)]
pub struct UsageLog {
    interfaces: Arc<Mutex<Vec<Box<dyn Interface>>>>,
}

impl UsageLog {
    pub fn new(interfaces: Vec<Box<dyn Interface>>) -> Self {
        UsageLog { interfaces: Arc::new(Mutex::new(interfaces)) }
    }

    /// The log line is always written, the JSONL file only when `usage.path` is set.
    pub fn from_config(config: &Config) -> Self {
        let mut interfaces: Vec<Box<dyn Interface>> = vec![Box::new(LogInterface)];
        if let Some(path) = config.get_usage_path() {
            interfaces.push(Box::new(FileInterface::new(&path)));
        }
        Self::new(interfaces)
    }

    pub async fn record(&self, record: UsageRecord) {
        let mut interfaces = self.interfaces.lock().await;
        for interface in interfaces.iter_mut() {
            interface.send_usage(&record).await;
        }
    }
}
