//! Client-credentials grant with a certificate-signed client assertion.

use std::time::Duration;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::{debug, info};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::exchange::ExchangeError;

const ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: i64 = 600;


#[derive(Serialize, Debug)]
struct AssertionClaims {
    aud: String,
    iss: String,
    sub: String,
    jti: String,
    nbf: i64,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}


pub struct CertificateCredential {
    client_id: String,
    login_url: String,
    scope: String,
    key: EncodingKey,
    thumbprint_s256: String,
}

impl CertificateCredential {

    pub fn new(client_id: &str, login_url: &str, scope: &str,
               certificate_pem: &str, private_key_pem: &str) -> Result<Self, ExchangeError> {
        let der = certificate_der(certificate_pem)?;
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| ExchangeError::Unauthorized(format!("Invalid private key: {}", e)))?;
        Ok(CertificateCredential {
            client_id: client_id.to_string(),
            login_url: login_url.trim_end_matches('/').to_string(),
            scope: scope.to_string(),
            key,
            thumbprint_s256: URL_SAFE_NO_PAD.encode(Sha256::digest(&der)),
        })
    }

    pub fn from_files(client_id: &str, login_url: &str, scope: &str,
                      certificate_path: &str, private_key_path: &str) -> Result<Self, ExchangeError> {
        let read = |path: &str| std::fs::read_to_string(path)
            .map_err(|e| ExchangeError::Unauthorized(format!("Could not read {}: {}", path, e)));
        Self::new(client_id, login_url, scope, &read(certificate_path)?, &read(private_key_path)?)
    }

    pub fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.login_url, tenant_id)
    }

    pub fn client_assertion(&self, tenant_id: &str) -> Result<String, ExchangeError> {
        let now = Utc::now();
        let jti_source = format!("{}:{}:{}", self.client_id, tenant_id,
                                 now.timestamp_nanos_opt().unwrap_or_default());
        let claims = AssertionClaims {
            aud: self.token_url(tenant_id),
            iss: self.client_id.clone(),
            sub: self.client_id.clone(),
            jti: format!("{:x}", Sha256::digest(jti_source.as_bytes())),
            nbf: now.timestamp(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECONDS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.x5t_s256 = Some(self.thumbprint_s256.clone());
        encode(&header, &claims, &self.key)
            .map_err(|e| ExchangeError::Unauthorized(format!("Could not sign client assertion: {}", e)))
    }

    pub async fn acquire_token(&self, client: &reqwest::Client, tenant_id: &str) -> Result<AccessToken, ExchangeError> {
        let assertion = self.client_assertion(tenant_id)?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
            ("client_assertion_type", ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
        ];
        debug!("Requesting Exchange token for tenant {}", tenant_id);
        let response = client.post(self.token_url(tenant_id))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(e) => e.error_description.unwrap_or(e.error),
                Err(_) => format!("HTTP {}", status),
            };
            return Err(ExchangeError::Unauthorized(message));
        }

        let token: TokenResponse = response.json().await?;
        info!("Acquired Exchange token for tenant {}", tenant_id);
        Ok(AccessToken {
            token: token.access_token,
            expires_in: Duration::from_secs(token.expires_in.unwrap_or(3600)),
        })
    }
}

/// DER bytes of the first certificate in a PEM file.
fn certificate_der(pem: &str) -> Result<Vec<u8>, ExchangeError> {
    let body: String = pem.lines()
        .skip_while(|l| !l.starts_with("-----BEGIN CERTIFICATE-----"))
        .skip(1)
        .take_while(|l| !l.starts_with("-----END CERTIFICATE-----"))
        .map(str::trim)
        .collect();
    if body.is_empty() {
        return Err(ExchangeError::Unauthorized("No certificate found in PEM".to_string()));
    }
    STANDARD.decode(body)
        .map_err(|e| ExchangeError::Unauthorized(format!("Invalid certificate: {}", e)))
}
