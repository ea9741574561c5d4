//! In-memory stand-ins for MyGeotab and Exchange used across the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use serde_json::{json, Value};
use crate::credentials::{FleetCredentials, TenantCredentials};
use crate::data_structures::{ArbitraryJson, Device, EntityRef, PropertyDefinition, PropertyValue};
use crate::exchange::{CmdletTransport, ExchangeClient, ExchangeConnector, ExchangeError, Mailbox};
use crate::geotab::{FleetApi, FleetConnector, FleetError};

pub const TEST_CERT: &str = include_str!("testdata/client_cert.pem");
pub const TEST_KEY: &str = include_str!("testdata/client_key.pem");
pub const TEST_API_KEY: &str = "abcdefghijklmnopqrstuvwxyz012345";


pub fn mailbox(address: &str, recipient_type: &str) -> Mailbox {
    let local = address.split('@').next().unwrap_or_default();
    Mailbox {
        identity: Some(local.to_string()),
        external_directory_object_id: None,
        display_name: local.to_uppercase(),
        alias: local.to_string(),
        primary_smtp_address: address.to_string(),
        email_addresses: vec![format!("SMTP:{}", address)],
        recipient_type_details: recipient_type.to_string(),
    }
}

pub fn tenant() -> TenantCredentials {
    TenantCredentials {
        client_key: TEST_API_KEY.to_string(),
        fleet: FleetCredentials {
            server: "my.geotab.com".to_string(),
            database: "fleetdb".to_string(),
            username: "svc".to_string(),
            password: "pw".to_string(),
        },
        equipment_domain: "equip.example.com".to_string(),
        exchange_tenant_id: Some("tenant-1".to_string()),
    }
}

/// Catalog with the canonical booking property names, ids p1..p8.
pub fn catalog_definitions() -> Vec<PropertyDefinition> {
    [
        "Enable Equipment Booking",
        "Allow Recurring Bookings",
        "Booking Approvers",
        "Fleet Managers",
        "Allow Double Booking",
        "Booking Window (Days)",
        "Maximum Booking Duration (Hours)",
        "Mailbox Language",
    ].iter().enumerate().map(|(i, name)| PropertyDefinition {
        id: format!("p{}", i + 1),
        name: name.to_string(),
        description: None,
        property_set: Some(EntityRef::new("ps-device")),
    }).collect()
}

pub fn device(id: &str, serial: &str, properties: &[(&str, Value)]) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Vehicle {}", serial),
        serial_number: Some(serial.to_string()),
        custom_properties: properties.iter()
            .map(|(pid, v)| PropertyValue::new(pid, v.clone()))
            .collect(),
        ..Default::default()
    }
}


/// Interprets the handful of cmdlets the service issues against an in-memory mailbox list.
#[derive(Default)]
pub struct FakeExchange {
    pub mailboxes: Mutex<Vec<Mailbox>>,
    pub calls: Mutex<Vec<(String, ArbitraryJson)>>,
    pub calendar_processing: Mutex<HashMap<String, ArbitraryJson>>,
    pub folder_permissions: Mutex<HashMap<(String, String), String>>,
    pub unavailable: Mutex<HashSet<String>>,
    pub failing: Mutex<HashSet<String>>,
    pub unauthorized: Mutex<HashSet<String>>,
}

impl FakeExchange {
    pub fn with_mailboxes(mailboxes: Vec<Mailbox>) -> Arc<Self> {
        let fake = FakeExchange::default();
        *fake.mailboxes.lock().unwrap() = mailboxes;
        Arc::new(fake)
    }

    pub fn client(self: &Arc<Self>) -> ExchangeClient {
        ExchangeClient::new(self.clone())
    }

    pub fn mark_unavailable(&self, cmdlet: &str) {
        self.unavailable.lock().unwrap().insert(cmdlet.to_string());
    }

    pub fn mark_failing(&self, cmdlet: &str) {
        self.failing.lock().unwrap().insert(cmdlet.to_string());
    }

    pub fn mark_unauthorized(&self, cmdlet: &str) {
        self.unauthorized.lock().unwrap().insert(cmdlet.to_string());
    }

    pub fn calls_to(&self, cmdlet: &str) -> Vec<ArbitraryJson> {
        self.calls.lock().unwrap().iter()
            .filter(|(c, _)| c == cmdlet)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn creation_calls(&self) -> usize {
        self.calls.lock().unwrap().iter()
            .filter(|(c, _)| c.starts_with("New-") || c.starts_with("Enable-"))
            .count()
    }

    pub fn calendar_processing_for(&self, identity: &str) -> Option<ArbitraryJson> {
        self.calendar_processing.lock().unwrap().get(&identity.to_lowercase()).cloned()
    }

    fn find_by_identity(&self, identity: &str) -> Vec<Mailbox> {
        let identity = identity.trim().to_lowercase();
        let proxy = format!("smtp:{}", identity);
        self.mailboxes.lock().unwrap().iter()
            .filter(|m| m.primary_smtp() == identity
                || m.alias.to_lowercase() == identity
                || m.email_addresses.iter().any(|a| a.to_lowercase() == proxy))
            .cloned()
            .collect()
    }

    fn filter_recipients(&self, filter: &str, types: &[String]) -> Result<Vec<Mailbox>, ExchangeError> {
        let (field, op, value) = parse_filter(filter)
            .ok_or_else(|| ExchangeError::Cmdlet { cmdlet: "Get-EXORecipient".to_string(), message: format!("bad filter {}", filter) })?;
        let matches = |candidate: &str| match op.as_str() {
            "-eq" => candidate.eq_ignore_ascii_case(&value),
            "-like" => glob_match(&value.to_lowercase(), &candidate.to_lowercase()),
            _ => false,
        };
        Ok(self.mailboxes.lock().unwrap().iter()
            .filter(|m| types.is_empty() || types.iter().any(|t| t == &m.recipient_type_details))
            .filter(|m| match field.as_str() {
                "PrimarySmtpAddress" => matches(&m.primary_smtp_address),
                "EmailAddresses" => m.email_addresses.iter().any(|a| matches(a)),
                _ => false,
            })
            .cloned()
            .collect())
    }

    fn rows(mailboxes: Vec<Mailbox>) -> Vec<Value> {
        mailboxes.into_iter().map(|m| serde_json::to_value(m).unwrap_or_default()).collect()
    }
}

fn string_param(parameters: &ArbitraryJson, name: &str) -> String {
    parameters.get(name).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Parses `Field -op 'value'`.
fn parse_filter(filter: &str) -> Option<(String, String, String)> {
    let mut parts = filter.trim().splitn(3, ' ');
    let field = parts.next()?.to_string();
    let op = parts.next()?.to_lowercase();
    let value = parts.next()?.trim();
    let value = value.strip_prefix('\'')?.strip_suffix('\'')?.replace("''", "'");
    Some((field, op, value))
}

fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, rest)) => {
            if !text.starts_with(prefix) {
                return false;
            }
            let remaining = &text[prefix.len()..];
            (0..=remaining.len())
                .filter(|i| remaining.is_char_boundary(*i))
                .any(|i| glob_match(rest, &remaining[i..]))
        }
    }
}

#[async_trait]
impl CmdletTransport for FakeExchange {
    async fn invoke(&self, cmdlet: &str, parameters: ArbitraryJson) -> Result<Vec<Value>, ExchangeError> {
        self.calls.lock().unwrap().push((cmdlet.to_string(), parameters.clone()));

        if self.unauthorized.lock().unwrap().contains(cmdlet) {
            return Err(ExchangeError::Unauthorized("token expired".to_string()));
        }
        if self.unavailable.lock().unwrap().contains(cmdlet) {
            return Err(ExchangeError::CmdletUnavailable(cmdlet.to_string()));
        }
        if self.failing.lock().unwrap().contains(cmdlet) {
            return Err(ExchangeError::Cmdlet { cmdlet: cmdlet.to_string(), message: "simulated failure".to_string() });
        }

        match cmdlet {
            "Get-EXOMailbox" | "Get-Mailbox" => {
                let found = self.find_by_identity(&string_param(&parameters, "Identity"));
                if found.is_empty() {
                    Err(ExchangeError::NotFound(format!("The operation couldn't be performed because object '{}' couldn't be found",
                                                        string_param(&parameters, "Identity"))))
                } else {
                    Ok(Self::rows(found))
                }
            },
            "Get-EXORecipient" | "Get-Recipient" => {
                let types: Vec<String> = match parameters.get("RecipientTypeDetails") {
                    Some(Value::String(s)) => vec![s.clone()],
                    Some(Value::Array(a)) => a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                    _ => vec![],
                };
                Ok(Self::rows(self.filter_recipients(&string_param(&parameters, "Filter"), &types)?))
            },
            "Set-CalendarProcessing" => {
                let identity = string_param(&parameters, "Identity").to_lowercase();
                let mut stored = self.calendar_processing.lock().unwrap();
                let entry = stored.entry(identity).or_default();
                for (k, v) in parameters.iter().filter(|(k, _)| k.as_str() != "Identity") {
                    entry.insert(k.clone(), v.clone());
                }
                Ok(vec![])
            },
            "Add-MailboxFolderPermission" | "Set-MailboxFolderPermission" => {
                let key = (string_param(&parameters, "Identity"), string_param(&parameters, "User").to_lowercase());
                let rights = parameters.get("AccessRights").map(|v| v.to_string()).unwrap_or_default();
                let mut permissions = self.folder_permissions.lock().unwrap();
                if cmdlet.starts_with("Add-") && permissions.contains_key(&key) {
                    return Err(ExchangeError::AlreadyExists(format!("An existing permission entry was found for user: {}", key.1)));
                }
                permissions.insert(key, rights);
                Ok(vec![])
            },
            c if c.starts_with("Set-") => Ok(vec![]),
            c if c.starts_with("New-") => Err(ExchangeError::Cmdlet {
                cmdlet: c.to_string(),
                message: "mailbox creation is not allowed".to_string(),
            }),
            other => Err(ExchangeError::CmdletUnavailable(other.to_string())),
        }
    }
}

pub struct FakeExchangeConnector {
    pub exchange: Arc<FakeExchange>,
    pub reject: bool,
}

#[async_trait]
impl ExchangeConnector for FakeExchangeConnector {
    async fn connect(&self, tenant_id: &str) -> Result<ExchangeClient, ExchangeError> {
        if self.reject {
            return Err(ExchangeError::Unauthorized(format!("AADSTS700016: tenant {} has not consented", tenant_id)));
        }
        Ok(self.exchange.client())
    }
}


#[derive(Default)]
pub struct FakeFleetState {
    pub devices: Mutex<Vec<Device>>,
    pub catalog: Mutex<Vec<PropertyDefinition>>,
    pub property_sets: Mutex<Vec<EntityRef>>,
    pub saved_devices: Mutex<Vec<Device>>,
    pub reject_login: bool,
}

#[derive(Clone, Default)]
pub struct FakeFleet {
    pub state: Arc<FakeFleetState>,
}

impl FakeFleet {
    pub fn new(devices: Vec<Device>) -> Self {
        let state = FakeFleetState::default();
        *state.devices.lock().unwrap() = devices;
        *state.catalog.lock().unwrap() = catalog_definitions();
        *state.property_sets.lock().unwrap() = vec![EntityRef { id: "ps-device".to_string(), name: Some("Device".to_string()) }];
        FakeFleet { state: Arc::new(state) }
    }

    pub fn rejecting_login() -> Self {
        FakeFleet { state: Arc::new(FakeFleetState { reject_login: true, ..Default::default() }) }
    }
}

#[async_trait]
impl FleetConnector for FakeFleet {
    async fn connect(&self, credentials: &FleetCredentials) -> Result<Box<dyn FleetApi>, FleetError> {
        if self.state.reject_login {
            return Err(FleetError::Authentication(format!("Incorrect login credentials for {}", credentials.database)));
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl FleetApi for FakeFleet {
    async fn get_devices(&self) -> Result<Vec<Device>, FleetError> {
        Ok(self.state.devices.lock().unwrap().clone())
    }

    async fn get_property_catalog(&self) -> Result<Vec<PropertyDefinition>, FleetError> {
        Ok(self.state.catalog.lock().unwrap().clone())
    }

    async fn get_property_sets(&self) -> Result<Vec<EntityRef>, FleetError> {
        Ok(self.state.property_sets.lock().unwrap().clone())
    }

    async fn set_device(&self, device: &Device) -> Result<(), FleetError> {
        self.state.saved_devices.lock().unwrap().push(device.clone());
        let mut devices = self.state.devices.lock().unwrap();
        if let Some(existing) = devices.iter_mut().find(|d| d.id == device.id) {
            *existing = device.clone();
        }
        Ok(())
    }

    async fn add_property(&self, property: &PropertyDefinition) -> Result<String, FleetError> {
        let mut catalog = self.state.catalog.lock().unwrap();
        let id = format!("new{}", catalog.len() + 1);
        catalog.push(PropertyDefinition { id: id.clone(), ..property.clone() });
        Ok(id)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("smtp:abc123@*", "smtp:abc123@other.example.com"));
        assert!(!glob_match("smtp:abc123@*", "smtp:abc1234@other.example.com"));
        assert!(glob_match("*@x.com", "a@x.com"));
        assert!(glob_match("exact", "exact"));
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            parse_filter("EmailAddresses -like 'smtp:o''brien@*'"),
            Some(("EmailAddresses".to_string(), "-like".to_string(), "smtp:o'brien@*".to_string()))
        );
        assert!(parse_filter("garbage").is_none());
    }

    #[tokio::test]
    async fn test_fake_reports_missing_mailbox() {
        let fake = FakeExchange::with_mailboxes(vec![mailbox("abc123@equip.example.com", "EquipmentMailbox")]);
        let found = fake.invoke("Get-EXOMailbox", crate::exchange::params(json!({"Identity": "ABC123@equip.example.com"}))).await.unwrap();
        assert_eq!(found.len(), 1);
        let missing = fake.invoke("Get-EXOMailbox", crate::exchange::params(json!({"Identity": "nope@equip.example.com"}))).await;
        assert!(matches!(missing, Err(ExchangeError::NotFound(_))));
    }
}
