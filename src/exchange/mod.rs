//! Exchange Online management. Cmdlets go through a [`CmdletTransport`]; in production that is
//! the admin API ([`admin_api::AdminApiTransport`]) authenticated with a certificate
//! ([`auth::CertificateCredential`]).

pub mod admin_api;
pub mod auth;

use std::sync::Arc;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use crate::data_structures::ArbitraryJson;


#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{0}")]
    NotFound(String),
    #[error("Cmdlet {0} is not available")]
    CmdletUnavailable(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{cmdlet} failed: {message}")]
    Cmdlet { cmdlet: String, message: String },
    #[error("Exchange authorization failed: {0}")]
    Unauthorized(String),
    #[error("Exchange request failed: {0}")]
    Transport(String),
}

impl ExchangeError {
    /// Errors that make further calls in the same session pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Unauthorized(_) | ExchangeError::Transport(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(value: reqwest::Error) -> Self {
        ExchangeError::Transport(value.to_string())
    }
}

#[async_trait]
pub trait CmdletTransport: Send + Sync {
    /// Runs one cmdlet and returns its output objects.
    async fn invoke(&self, cmdlet: &str, parameters: ArbitraryJson) -> Result<Vec<Value>, ExchangeError>;
}

#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn connect(&self, tenant_id: &str) -> Result<ExchangeClient, ExchangeError>;
}

/// Builds cmdlet parameters from a `json!` object literal.
pub fn params(value: Value) -> ArbitraryJson {
    match value {
        Value::Object(map) => map,
        _ => ArbitraryJson::new(),
    }
}


#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Mailbox {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub external_directory_object_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub primary_smtp_address: String,
    #[serde(default)]
    pub email_addresses: Vec<String>,
    #[serde(default)]
    pub recipient_type_details: String,
}

impl Mailbox {
    pub fn primary_smtp(&self) -> String {
        self.primary_smtp_address.trim().to_lowercase()
    }

    /// Identity passed to the set-cmdlets.
    pub fn id(&self) -> String {
        self.external_directory_object_id.clone()
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.primary_smtp_address.clone()).filter(|s| !s.is_empty()))
            .or_else(|| self.identity.clone())
            .unwrap_or_default()
    }

    pub fn is_mailbox(&self) -> bool {
        self.recipient_type_details.ends_with("Mailbox")
    }

    pub fn local_part(&self) -> String {
        self.primary_smtp().split('@').next().unwrap_or_default().to_string()
    }
}


#[derive(Clone)]
pub struct ExchangeClient {
    transport: Arc<dyn CmdletTransport>,
}

impl ExchangeClient {
    pub fn new(transport: Arc<dyn CmdletTransport>) -> Self {
        ExchangeClient { transport }
    }

    pub async fn invoke(&self, cmdlet: &str, parameters: ArbitraryJson) -> Result<Vec<Value>, ExchangeError> {
        self.transport.invoke(cmdlet, parameters).await
    }

    /// Runs a read cmdlet and decodes its output. A not-found error is an empty result.
    pub async fn query_mailboxes(&self, cmdlet: &str, parameters: ArbitraryJson) -> Result<Vec<Mailbox>, ExchangeError> {
        let rows = match self.invoke(cmdlet, parameters).await {
            Ok(rows) => rows,
            Err(ExchangeError::NotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        rows.into_iter()
            .map(|row| serde_json::from_value::<Mailbox>(row)
                .map_err(|e| ExchangeError::Cmdlet { cmdlet: cmdlet.to_string(), message: e.to_string() }))
            .collect()
    }
}
