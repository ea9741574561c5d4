//! Read-only access to per-client secrets named `client-<apiKey>-<field>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use crate::config::SecretsSubConfig;


#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid secret name '{0}'")]
    InvalidName(String),
    #[error("Could not read secret '{name}': {source}")]
    Read { name: String, source: std::io::Error },
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `Ok(None)` when the secret does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError>;
}

pub fn secret_name(client_key: &str, field: &str) -> String {
    format!("client-{}-{}", client_key, field)
}

fn check_name(name: &str) -> Result<(), SecretError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid { Ok(()) } else { Err(SecretError::InvalidName(name.to_string())) }
}


/// Secrets mounted as files, one file per secret (e.g. a Kubernetes secret volume).
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: &str) -> Self {
        FileSecretStore { dir: PathBuf::from(dir) }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError> {
        check_name(name)?;
        let path = self.dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Secret file {} not found", path.display());
                Ok(None)
            },
            Err(source) => Err(SecretError::Read { name: name.to_string(), source }),
        }
    }
}


/// Secrets given inline in the config file.
#[derive(Default)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new(values: HashMap<String, String>) -> Self {
        StaticSecretStore { values }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError> {
        check_name(name)?;
        Ok(self.values.get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }
}


/// Asks each store in turn and returns the first hit.
pub struct LayeredSecretStore {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl LayeredSecretStore {
    pub fn new(stores: Vec<Arc<dyn SecretStore>>) -> Self {
        LayeredSecretStore { stores }
    }

    pub fn from_config(config: &SecretsSubConfig) -> Self {
        let mut stores: Vec<Arc<dyn SecretStore>> = vec![
            Arc::new(StaticSecretStore::new(config.values.clone()))
        ];
        if let Some(dir) = config.dir.as_deref().filter(|d| !d.is_empty()) {
            stores.push(Arc::new(FileSecretStore::new(dir)));
        }
        LayeredSecretStore::new(stores)
    }
}

#[async_trait]
impl SecretStore for LayeredSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError> {
        for store in self.stores.iter() {
            if let Some(value) = store.get_secret(name).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_reads_trimmed_value() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("client-abc-database"), "fleetdb\n").unwrap();
        let store = FileSecretStore::new(dir.path().to_str().unwrap());

        assert_eq!(store.get_secret("client-abc-database").await.unwrap().as_deref(), Some("fleetdb"));
        assert_eq!(store.get_secret("client-abc-username").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_names_cannot_escape_directory() {
        let store = FileSecretStore::new("/tmp");
        assert!(matches!(store.get_secret("../etc/passwd").await, Err(SecretError::InvalidName(_))));
        assert!(matches!(store.get_secret("").await, Err(SecretError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_layered_store_prefers_first_hit() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("client-abc-password"), "from-file").unwrap();
        std::fs::write(dir.path().join("client-abc-username"), "file-user").unwrap();

        let config = SecretsSubConfig {
            dir: Some(dir.path().to_str().unwrap().to_string()),
            values: HashMap::from([("client-abc-username".to_string(), "inline-user".to_string())]),
        };
        let store = LayeredSecretStore::from_config(&config);

        assert_eq!(store.get_secret("client-abc-username").await.unwrap().as_deref(), Some("inline-user"));
        assert_eq!(store.get_secret("client-abc-password").await.unwrap().as_deref(), Some("from-file"));
        assert_eq!(store.get_secret("client-abc-database").await.unwrap(), None);
    }

    #[test]
    fn test_secret_name() {
        assert_eq!(secret_name("abc", "equipment-domain"), "client-abc-equipment-domain");
    }
}
