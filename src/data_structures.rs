use clap::{Parser, Subcommand};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type ArbitraryJson = Map<String, Value>;


#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {

    /// Path to the YAML config file
    #[arg(short, long, default_value = "fleetbridge.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API
    Serve,
    /// Run a single sync for one client and print the summary
    Sync {
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        max_devices: Option<usize>,
    },
    /// Create missing booking properties in the MyGeotab property catalog
    SetupProperties {
        #[arg(long)]
        api_key: String,
    },
}


/// Reference to another MyGeotab entity, e.g. `{"id": "b12"}`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EntityRef {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(id: &str) -> Self {
        EntityRef { id: id.to_string(), name: None }
    }
}

/// Device record as returned by `Get Device`. Fields this service does not use are kept in
/// `extra` so the record can be written back with `Set` without losing data.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_identification_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone_id: Option<String>,
    #[serde(default)]
    pub custom_properties: Vec<PropertyValue>,
    #[serde(flatten)]
    pub extra: ArbitraryJson,
}

impl Device {
    /// Serial number with surrounding whitespace removed, `None` when blank.
    pub fn serial(&self) -> Option<&str> {
        self.serial_number.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// One custom property value attached to a device.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PropertyValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    // Older databases return the value under "data"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: ArbitraryJson,
}

impl PropertyValue {
    pub fn new(property_id: &str, value: Value) -> Self {
        PropertyValue {
            property: Some(EntityRef::new(property_id)),
            value: Some(value),
            data: None,
            extra: ArbitraryJson::new(),
        }
    }

    pub fn property_id(&self) -> Option<&str> {
        self.property.as_ref().map(|p| p.id.as_str()).filter(|id| !id.is_empty())
    }

    pub fn raw_value(&self) -> Option<&Value> {
        match &self.value {
            Some(Value::Null) | None => self.data.as_ref(),
            Some(v) => Some(v),
        }
    }
}

/// Catalog entry from `Get Property`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_set: Option<EntityRef>,
}


/// Inbound body shared by the sync, status and property endpoints.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    #[serde(default, alias = "clientId")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub equipment_domain: Option<String>,
    #[serde(default)]
    pub exchange_tenant_id: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(flatten)]
    pub client: ClientRequest,
    #[serde(default)]
    pub max_devices: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePropertiesRequest {
    #[serde(flatten)]
    pub client: ClientRequest,
    #[serde(alias = "deviceId")]
    pub device: String,
    #[serde(default)]
    pub properties: ArbitraryJson,
}


#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    Ok,
    MailboxNotFound,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub device: String,
    pub serial_number: String,
    pub success: bool,
    pub email: String,
    pub reason: SyncReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub success: bool,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<SyncResult>,
    pub execution_time_ms: u64,
}

impl SyncSummary {
    pub fn push(&mut self, result: SyncResult) {
        self.processed += 1;
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }
}
