use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use serde_json::{json, Value};
use crate::config::Config;
use crate::data_structures::ArbitraryJson;
use crate::exchange::auth::CertificateCredential;
use crate::exchange::{CmdletTransport, ExchangeClient, ExchangeConnector, ExchangeError};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);


/// Runs cmdlets through `POST {admin}/adminapi/beta/{tenant}/InvokeCommand`.
pub struct AdminApiTransport {
    client: reqwest::Client,
    url: String,
    anchor: String,
    token: String,
    backoff: Duration,
}

impl AdminApiTransport {
    pub fn new(client: reqwest::Client, admin_url: &str, tenant_id: &str, token: String) -> Self {
        AdminApiTransport {
            client,
            url: format!("{}/adminapi/beta/{}/InvokeCommand", admin_url.trim_end_matches('/'), tenant_id),
            anchor: format!("APP:SystemMailbox{{bb558c35-97f1-4cb9-8ff7-d53741dc928c}}@{}", tenant_id),
            token,
            backoff: INITIAL_BACKOFF,
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn backoff_for(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        match retry_after {
            Some(seconds) => Duration::from_secs(seconds),
            None => self.backoff * 2u32.pow(attempt),
        }
    }
}

#[async_trait]
impl CmdletTransport for AdminApiTransport {
    async fn invoke(&self, cmdlet: &str, parameters: ArbitraryJson) -> Result<Vec<Value>, ExchangeError> {
        let body = json!({
            "CmdletInput": {
                "CmdletName": cmdlet,
                "Parameters": parameters,
            }
        });

        for attempt in 0..MAX_RETRIES {
            let last_attempt = attempt == MAX_RETRIES - 1;
            let response = self.client.post(&self.url)
                .bearer_auth(&self.token)
                .header("X-AnchorMailbox", &self.anchor)
                .header("X-ResponseFormat", "json")
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) if !last_attempt => {
                    let wait = self.backoff_for(attempt, None);
                    warn!("Connection error on {}: {}. Retrying in {:?}", cmdlet, e, wait);
                    tokio::time::sleep(wait).await;
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) && !last_attempt {
                let retry_after = response.headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let wait = self.backoff_for(attempt, retry_after);
                warn!("{} returned {}. Retrying in {:?} (attempt {}/{})", cmdlet, status, wait, attempt + 1, MAX_RETRIES);
                tokio::time::sleep(wait).await;
                continue;
            }

            let text = response.text().await?;
            if !status.is_success() {
                return Err(classify_error(cmdlet, status, &text));
            }
            debug!("{} succeeded", cmdlet);
            return Ok(parse_output(&text));
        }
        Err(ExchangeError::Transport(format!("{} gave up after {} attempts", cmdlet, MAX_RETRIES)))
    }
}

fn parse_output(text: &str) -> Vec<Value> {
    if text.trim().is_empty() {
        return vec![];
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut body)) => match body.remove("value") {
            Some(Value::Array(rows)) => rows,
            Some(Value::Null) | None => vec![],
            Some(other) => vec![other],
        },
        Ok(Value::Array(rows)) => rows,
        _ => vec![],
    }
}

fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text).ok()
        .and_then(|v| v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string))
        .unwrap_or_else(|| text.trim().to_string())
}

/// Maps an admin API failure onto the error kinds callers branch on.
pub(crate) fn classify_error(cmdlet: &str, status: StatusCode, text: &str) -> ExchangeError {
    let message = error_message(text);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ExchangeError::Unauthorized(message);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ExchangeError::Transport(format!("{} returned {}: {}", cmdlet, status, message));
    }

    let lower = message.to_lowercase();
    if lower.contains("is not recognized") || lower.contains("commandnotfound") || lower.contains("is not supported") {
        ExchangeError::CmdletUnavailable(cmdlet.to_string())
    } else if lower.contains("couldn't be found") || lower.contains("could not be found")
        || lower.contains("managementobjectnotfound") || status == StatusCode::NOT_FOUND {
        ExchangeError::NotFound(message)
    } else if lower.contains("already exists") || lower.contains("alreadyexists") {
        ExchangeError::AlreadyExists(message)
    } else {
        ExchangeError::Cmdlet { cmdlet: cmdlet.to_string(), message }
    }
}


pub struct AdminApiConnector {
    client: reqwest::Client,
    credential: Arc<CertificateCredential>,
    admin_url: String,
}

impl AdminApiConnector {
    pub fn new(client: reqwest::Client, credential: Arc<CertificateCredential>, admin_url: &str) -> Self {
        AdminApiConnector {
            client,
            credential,
            admin_url: admin_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let exchange = &config.exchange;
        let (login_url, admin_url) = exchange.get_endpoints()?;
        let (certificate_path, private_key_path) = match (&exchange.certificate_path, &exchange.private_key_path) {
            (Some(cert), Some(key)) => (cert.as_str(), key.as_str()),
            _ => anyhow::bail!("exchange.certificatePath and exchange.privateKeyPath must be configured"),
        };
        if exchange.client_id.is_empty() {
            anyhow::bail!("exchange.clientId must be configured");
        }
        let scope = format!("{}/.default", admin_url.trim_end_matches('/'));
        let credential = CertificateCredential::from_files(
            &exchange.client_id, &login_url, &scope, certificate_path, private_key_path)?;
        let client = reqwest::Client::builder()
            .timeout(config.get_request_timeout())
            .build()?;
        Ok(AdminApiConnector::new(client, Arc::new(credential), &admin_url))
    }
}

#[async_trait]
impl ExchangeConnector for AdminApiConnector {
    async fn connect(&self, tenant_id: &str) -> Result<ExchangeClient, ExchangeError> {
        let token = self.credential.acquire_token(&self.client, tenant_id).await?;
        debug!("Exchange token for {} valid for {}s", tenant_id, token.expires_in.as_secs());
        let transport = AdminApiTransport::new(self.client.clone(), &self.admin_url, tenant_id, token.token);
        Ok(ExchangeClient::new(Arc::new(transport)))
    }
}
