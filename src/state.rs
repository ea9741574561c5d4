// Per-client sync state, one JSON file per client in the working directory.
// Files are named after a hash of the client key so API keys never appear in file names.

use std::fs;
use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use log::{debug, error};
use sha2::{Digest, Sha256};
use crate::data_structures::SyncSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSyncState {
    pub last_sync: DateTime<Utc>,
    pub success: bool,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub execution_time_ms: u64,
}

impl ClientSyncState {
    pub fn from_summary(summary: &SyncSummary) -> Self {
        Self {
            last_sync: Utc::now(),
            success: summary.success,
            processed: summary.processed,
            successful: summary.successful,
            failed: summary.failed,
            execution_time_ms: summary.execution_time_ms,
        }
    }
}

pub struct StateManager {
    working_dir: PathBuf,
}

impl StateManager {
    pub fn new(working_dir: &str) -> Self {
        let dir = PathBuf::from(working_dir);

        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Failed to create state directory {}: {}", dir.display(), e);
        }

        Self {
            working_dir: dir,
        }
    }

    fn get_state_file_path(&self, client_key: &str) -> PathBuf {
        self.working_dir.join(format!("fleetbridge-{}.json", client_file_id(client_key)))
    }

    pub fn load_state(&self, client_key: &str) -> Option<ClientSyncState> {
        let path = self.get_state_file_path(client_key);

        if !path.exists() {
            debug!("No state file found at {}", path.display());
            return None;
        }

        match fs::read_to_string(&path) {
            Ok(content) => {
                match serde_json::from_str::<ClientSyncState>(&content) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        error!("Failed to parse state file {}: {}", path.display(), e);
                        None
                    }
                }
            }
            Err(e) => {
                error!("Failed to read state file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save_state(&self, client_key: &str, state: &ClientSyncState) -> Result<(), String> {
        let path = self.get_state_file_path(client_key);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| format!("Failed to serialize state: {}", e))?;
        match fs::write(&path, content) {
            Ok(_) => {
                debug!("Saved state to {}: last_sync={}", path.display(), state.last_sync);
                Ok(())
            }
            Err(e) => {
                error!("Failed to write state file {}: {}", path.display(), e);
                Err(format!("Failed to write state: {}", e))
            }
        }
    }
}

/// First 16 hex characters of the SHA-256 of the client key.
pub fn client_file_id(client_key: &str) -> String {
    Sha256::digest(client_key.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}
