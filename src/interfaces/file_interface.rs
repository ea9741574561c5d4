use std::fs::OpenOptions;
use std::io::Write;
use async_trait::async_trait;
use log::error;
use crate::interfaces::interface::{Interface, UsageRecord};

/// Appends usage records to a file, one JSON object per line (JSONL format)
pub struct FileInterface {
    path: String,
}

impl FileInterface {
    pub fn new(path: &str) -> Self {
        FileInterface { path: path.to_string() }
    }

    fn append(&self, record: &UsageRecord) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json_str = serde_json::to_string(record)?;
        writeln!(file, "{}", json_str)?;
        file.flush()
    }
}

#[async_trait]
impl Interface for FileInterface {
    async fn send_usage(&mut self, record: &UsageRecord) {
        if let Err(e) = self.append(record) {
            error!("Error in file interface: Could not write to path '{}': {}", self.path, e);
        }
    }
}
