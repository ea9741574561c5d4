use std::sync::Arc;
use log::{debug, warn};
use thiserror::Error;
use crate::config::Config;
use crate::data_structures::ClientRequest;
use crate::secrets::{secret_name, SecretError, SecretStore};

const API_KEY_LENGTH: usize = 32;


#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Missing apiKey or MyGeotab credentials")]
    Missing,
    #[error("Invalid API key format")]
    InvalidApiKey,
    #[error("Invalid API key")]
    UnknownApiKey,
    #[error("Client configuration is incomplete: missing {0}")]
    MissingField(&'static str),
    #[error("Equipment domain not configured for this client. Please contact support.")]
    MissingEquipmentDomain,
    #[error("Error retrieving client configuration: {0}")]
    Secret(#[from] SecretError),
}

impl CredentialError {
    /// The caller presented credentials we do not accept, as opposed to a configuration problem.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CredentialError::InvalidApiKey | CredentialError::UnknownApiKey)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FleetCredentials {
    pub server: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TenantCredentials {
    /// API key, or database name for direct credentials. Names state files and usage records.
    pub client_key: String,
    pub fleet: FleetCredentials,
    pub equipment_domain: String,
    pub exchange_tenant_id: Option<String>,
}


pub fn validate_api_key(api_key: &str) -> Result<(), CredentialError> {
    if api_key.len() == API_KEY_LENGTH && api_key.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(CredentialError::InvalidApiKey)
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_start_matches('@').to_lowercase();
    if domain.is_empty() { None } else { Some(domain) }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}


pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
    default_server: String,
    default_equipment_domain: Option<String>,
    default_exchange_tenant: Option<String>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn SecretStore>, config: &Config) -> Self {
        CredentialResolver {
            store,
            default_server: config.get_geotab_server(),
            default_equipment_domain: config.sync.equipment_domain.clone(),
            default_exchange_tenant: config.exchange.tenant_id.clone(),
        }
    }

    pub async fn resolve(&self, request: &ClientRequest) -> Result<TenantCredentials, CredentialError> {
        if let Some(api_key) = non_empty(&request.api_key) {
            return self.resolve_api_key(&api_key).await;
        }
        match (non_empty(&request.database), non_empty(&request.username), non_empty(&request.password)) {
            (Some(database), Some(username), Some(password)) => {
                self.resolve_direct(request, database, username, password).await
            },
            _ => Err(CredentialError::Missing),
        }
    }

    pub async fn resolve_api_key(&self, api_key: &str) -> Result<TenantCredentials, CredentialError> {
        validate_api_key(api_key)?;

        let database = self.lookup(api_key, "database").await?
            .ok_or(CredentialError::UnknownApiKey)?;
        let username = self.lookup(api_key, "username").await?
            .ok_or(CredentialError::MissingField("username"))?;
        let password = self.lookup(api_key, "password").await?
            .ok_or(CredentialError::MissingField("password"))?;
        let server = self.lookup(api_key, "server").await?
            .unwrap_or_else(|| self.default_server.clone());

        let equipment_domain = self.lookup(api_key, "equipment-domain").await?
            .as_deref()
            .and_then(normalize_domain)
            .or_else(|| self.default_equipment_domain.as_deref().and_then(normalize_domain))
            .ok_or(CredentialError::MissingEquipmentDomain)?;
        let exchange_tenant_id = self.lookup(api_key, "exchange-tenant-id").await?
            .or_else(|| self.default_exchange_tenant.clone());

        debug!("Resolved credentials for client {} (database {})", api_key, database);
        Ok(TenantCredentials {
            client_key: api_key.to_string(),
            fleet: FleetCredentials { server, database, username, password },
            equipment_domain,
            exchange_tenant_id,
        })
    }

    async fn resolve_direct(&self, request: &ClientRequest, database: String, username: String,
                            password: String) -> Result<TenantCredentials, CredentialError> {

        let equipment_domain = non_empty(&request.equipment_domain)
            .as_deref()
            .and_then(normalize_domain)
            .or_else(|| self.default_equipment_domain.as_deref().and_then(normalize_domain))
            .ok_or(CredentialError::MissingEquipmentDomain)?;

        let exchange_tenant_id = match non_empty(&request.exchange_tenant_id) {
            Some(tenant) => Some(tenant),
            None => match self.lookup(&database, "exchange-tenant-id").await {
                Ok(found) => found,
                Err(SecretError::InvalidName(name)) => {
                    warn!("Database name {} cannot be used as a secret name", name);
                    None
                },
                Err(e) => return Err(e.into()),
            }.or_else(|| self.default_exchange_tenant.clone()),
        };

        Ok(TenantCredentials {
            client_key: database.clone(),
            fleet: FleetCredentials {
                server: non_empty(&request.server).unwrap_or_else(|| self.default_server.clone()),
                database,
                username,
                password,
            },
            equipment_domain,
            exchange_tenant_id,
        })
    }

    async fn lookup(&self, client_key: &str, field: &str) -> Result<Option<String>, SecretError> {
        self.store.get_secret(&secret_name(client_key, field)).await
    }
}
