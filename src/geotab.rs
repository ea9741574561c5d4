//! MyGeotab JSON-RPC client (`POST {server}/apiv1`).

use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use thiserror::Error;
use crate::credentials::FleetCredentials;
use crate::data_structures::{ArbitraryJson, Device, EntityRef, PropertyDefinition};


#[derive(Debug, Error)]
pub enum FleetError {
    #[error("MyGeotab authentication failed: {0}")]
    Authentication(String),
    #[error("MyGeotab {method} failed: {name}: {message}")]
    Api { method: String, name: String, message: String },
    #[error("MyGeotab request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected MyGeotab response: {0}")]
    Decode(String),
}

/// An authenticated MyGeotab session.
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn get_devices(&self) -> Result<Vec<Device>, FleetError>;
    async fn get_property_catalog(&self) -> Result<Vec<PropertyDefinition>, FleetError>;
    async fn get_property_sets(&self) -> Result<Vec<EntityRef>, FleetError>;
    async fn set_device(&self, device: &Device) -> Result<(), FleetError>;
    /// Adds a catalog property and returns its new id.
    async fn add_property(&self, property: &PropertyDefinition) -> Result<String, FleetError>;
}

#[async_trait]
pub trait FleetConnector: Send + Sync {
    async fn connect(&self, credentials: &FleetCredentials) -> Result<Box<dyn FleetApi>, FleetError>;
}


pub struct GeotabConnector {
    client: reqwest::Client,
}

impl GeotabConnector {
    pub fn new(timeout: Duration) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(GeotabConnector { client })
    }
}

#[async_trait]
impl FleetConnector for GeotabConnector {
    async fn connect(&self, credentials: &FleetCredentials) -> Result<Box<dyn FleetApi>, FleetError> {
        let client = GeotabClient::authenticate(self.client.clone(), credentials).await?;
        Ok(Box::new(client))
    }
}


pub struct GeotabClient {
    client: reqwest::Client,
    base_url: String,
    session: Value,
}

fn base_url(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{}", server)
    }
}

impl GeotabClient {

    pub async fn authenticate(client: reqwest::Client, credentials: &FleetCredentials) -> Result<Self, FleetError> {
        let base = base_url(&credentials.server);
        let params = json!({
            "database": credentials.database,
            "userName": credentials.username,
            "password": credentials.password,
        });
        let result = rpc(&client, &base, "Authenticate", params).await
            .map_err(|e| match e {
                FleetError::Api { message, .. } => FleetError::Authentication(message),
                other => other,
            })?;

        let session = result.get("credentials")
            .filter(|c| c.get("sessionId").is_some())
            .cloned()
            .ok_or_else(|| FleetError::Authentication("no session returned".to_string()))?;

        // Databases hosted elsewhere name their server in "path"
        let base_url = match result.get("path").and_then(Value::as_str) {
            Some(path) if !path.is_empty() && !path.eq_ignore_ascii_case("ThisServer") => base_url(path),
            _ => base,
        };
        info!("Authenticated to MyGeotab database {} on {}", credentials.database, base_url);

        Ok(GeotabClient { client, base_url, session })
    }

    pub async fn call(&self, method: &str, mut params: ArbitraryJson) -> Result<Value, FleetError> {
        params.insert("credentials".to_string(), self.session.clone());
        rpc(&self.client, &self.base_url, method, Value::Object(params)).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, type_name: &str, search: Option<Value>) -> Result<Vec<T>, FleetError> {
        let mut params = ArbitraryJson::new();
        params.insert("typeName".to_string(), json!(type_name));
        if let Some(search) = search {
            params.insert("search".to_string(), search);
        }
        let result = self.call("Get", params).await?;
        serde_json::from_value(result)
            .map_err(|e| FleetError::Decode(format!("Get {}: {}", type_name, e)))
    }
}

#[async_trait]
impl FleetApi for GeotabClient {
    async fn get_devices(&self) -> Result<Vec<Device>, FleetError> {
        let devices: Vec<Device> = self.get("Device", None).await?;
        debug!("Fetched {} devices", devices.len());
        Ok(devices)
    }

    async fn get_property_catalog(&self) -> Result<Vec<PropertyDefinition>, FleetError> {
        self.get("Property", None).await
    }

    async fn get_property_sets(&self) -> Result<Vec<EntityRef>, FleetError> {
        self.get("PropertySet", None).await
    }

    async fn set_device(&self, device: &Device) -> Result<(), FleetError> {
        let mut params = ArbitraryJson::new();
        params.insert("typeName".to_string(), json!("Device"));
        params.insert("entity".to_string(), serde_json::to_value(device)
            .map_err(|e| FleetError::Decode(e.to_string()))?);
        self.call("Set", params).await?;
        Ok(())
    }

    async fn add_property(&self, property: &PropertyDefinition) -> Result<String, FleetError> {
        let mut entity = serde_json::to_value(property)
            .map_err(|e| FleetError::Decode(e.to_string()))?;
        if let Some(obj) = entity.as_object_mut() {
            obj.remove("id");
            obj.insert("isSystem".to_string(), json!(false));
        }
        let mut params = ArbitraryJson::new();
        params.insert("typeName".to_string(), json!("Property"));
        params.insert("entity".to_string(), entity);
        let result = self.call("Add", params).await?;
        result.as_str()
            .map(str::to_string)
            .ok_or_else(|| FleetError::Decode(format!("Add Property returned {}", result)))
    }
}

async fn rpc(client: &reqwest::Client, base_url: &str, method: &str, params: Value) -> Result<Value, FleetError> {
    let url = format!("{}/apiv1", base_url);
    let body = json!({"method": method, "params": params});
    let response: Value = client.post(&url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if let Some(error) = response.get("error") {
        let name = error.pointer("/errors/0/name")
            .or_else(|| error.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("JSONRPCError")
            .to_string();
        let message = error.get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        if name.contains("InvalidUser") || name.contains("DbUnavailable") {
            return Err(FleetError::Authentication(message));
        }
        return Err(FleetError::Api { method: method.to_string(), name, message });
    }
    response.get("result")
        .cloned()
        .ok_or_else(|| FleetError::Decode(format!("{} returned no result", method)))
}
