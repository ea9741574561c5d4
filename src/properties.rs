//! Writes booking properties back to MyGeotab: per-device updates and catalog setup.

use log::{info, warn};
use serde_derive::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use crate::data_structures::{ArbitraryJson, Device, EntityRef, PropertyDefinition, PropertyValue};
use crate::geotab::{FleetApi, FleetError};
use crate::normalizer::{lookup_alias, PolicyField, PropertyCatalog};

const DEVICE_PROPERTY_SET: &str = "Device";


#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Property set '{0}' not found in MyGeotab")]
    PropertySetMissing(String),
    #[error(transparent)]
    Fleet(#[from] FleetError),
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PropertyUpdateReport {
    pub success: bool,
    pub device: String,
    pub updated: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SetupReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}


/// Device by id, then serial number, then name.
pub fn find_device<'a>(devices: &'a [Device], reference: &str) -> Option<&'a Device> {
    let reference = reference.trim();
    devices.iter().find(|d| d.id == reference)
        .or_else(|| devices.iter().find(|d| d.serial().is_some_and(|s| s.eq_ignore_ascii_case(reference))))
        .or_else(|| devices.iter().find(|d| d.name.trim().eq_ignore_ascii_case(reference)))
}

/// Value as stored on the device. Empty strings clear the property.
fn property_value(value: &Value, scale: u32, field: PolicyField) -> Value {
    // Hours from the caller, minutes in a minute-based property
    if field == PolicyField::MaxDuration && scale == 1 {
        if let Some(hours) = numeric(value) {
            return json!(((hours * 60.0).round() as u64).to_string());
        }
    }
    match value {
        Value::String(s) if s.trim().is_empty() => Value::Null,
        Value::String(s) => json!(s.trim()),
        Value::Array(items) => {
            let joined: Vec<String> = items.iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            if joined.is_empty() { Value::Null } else { json!(joined.join(", ")) }
        },
        Value::Number(n) => json!(n.to_string()),
        Value::Bool(b) => json!(b.to_string()),
        Value::Null => Value::Null,
        Value::Object(_) => json!(value.to_string()),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }.filter(|n| n.is_finite() && *n >= 0.0)
}

fn resolve_key(key: &str) -> Option<PolicyField> {
    PolicyField::from_short_key(key)
        .or_else(|| lookup_alias(key).map(|(_, alias)| alias.field))
}

pub async fn update_device_properties(fleet: &dyn FleetApi, device_reference: &str,
                                      changes: &ArbitraryJson) -> Result<PropertyUpdateReport, PropertyError> {
    let devices = fleet.get_devices().await?;
    let mut device = find_device(&devices, device_reference)
        .cloned()
        .ok_or_else(|| PropertyError::DeviceNotFound(device_reference.to_string()))?;
    let catalog = PropertyCatalog::new(fleet.get_property_catalog().await?);

    let mut report = PropertyUpdateReport { device: device.id.clone(), ..Default::default() };
    for (key, value) in changes {
        let Some(field) = resolve_key(key) else {
            warn!("Ignoring unknown property key {}", key);
            report.skipped.push(key.clone());
            continue;
        };
        let Some((definition, alias)) = catalog.find_for_field(field) else {
            warn!("No catalog property for {}, run setup-properties first", key);
            report.skipped.push(key.clone());
            continue;
        };

        let new_value = property_value(value, alias.scale, field);
        match device.custom_properties.iter_mut().find(|pv| pv.property_id() == Some(definition.id.as_str())) {
            Some(existing) => {
                existing.value = Some(new_value);
                existing.data = None;
            },
            None => device.custom_properties.push(PropertyValue::new(&definition.id, new_value)),
        }
        report.updated.push(definition.name.clone());
    }

    if !report.updated.is_empty() {
        fleet.set_device(&device).await?;
        info!("Updated {} properties on device {}", report.updated.len(), device.id);
    }
    report.success = true;
    Ok(report)
}

/// Adds the canonical booking properties missing from the catalog.
pub async fn setup_properties(fleet: &dyn FleetApi) -> Result<SetupReport, PropertyError> {
    let property_set = fleet.get_property_sets().await?
        .into_iter()
        .find(|s| s.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(DEVICE_PROPERTY_SET)))
        .ok_or_else(|| PropertyError::PropertySetMissing(DEVICE_PROPERTY_SET.to_string()))?;
    let catalog = PropertyCatalog::new(fleet.get_property_catalog().await?);

    let mut report = SetupReport::default();
    for field in PolicyField::ALL {
        let alias = field.canonical_alias();
        if catalog.find_by_name(alias.name).is_some() {
            report.skipped.push(alias.name.to_string());
            continue;
        }
        let definition = PropertyDefinition {
            id: String::new(),
            name: alias.name.to_string(),
            description: Some(alias.description.to_string()).filter(|d| !d.is_empty()),
            property_set: Some(EntityRef::new(&property_set.id)),
        };
        let id = fleet.add_property(&definition).await?;
        info!("Created property '{}' ({})", alias.name, id);
        report.created.push(alias.name.to_string());
    }
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::params;
    use crate::testing::{device, FakeFleet};

    #[test]
    fn test_find_device_fallbacks() {
        let devices = vec![device("b1", "ABC123", &[]), device("b2", "DEF456", &[])];
        assert_eq!(find_device(&devices, "b2").unwrap().id, "b2");
        assert_eq!(find_device(&devices, "abc123").unwrap().id, "b1");
        assert_eq!(find_device(&devices, "vehicle def456").unwrap().id, "b2");
        assert!(find_device(&devices, "nope").is_none());
    }

    #[test]
    fn test_property_values() {
        assert_eq!(property_value(&json!(""), 1, PolicyField::Bookable), Value::Null);
        assert_eq!(property_value(&json!(true), 1, PolicyField::Bookable), json!("true"));
        assert_eq!(property_value(&json!(["a@x.com", "b@x.com"]), 1, PolicyField::Approvers), json!("a@x.com, b@x.com"));
        assert_eq!(property_value(&json!(2), 60, PolicyField::MaxDuration), json!("2"));
        assert_eq!(property_value(&json!(2), 1, PolicyField::MaxDuration), json!("120"));
        assert_eq!(property_value(&json!("8"), 1, PolicyField::MaxDuration), json!("480"));
        assert_eq!(property_value(&json!(" 1.5 "), 1, PolicyField::MaxDuration), json!("90"));
        assert_eq!(property_value(&json!("8"), 60, PolicyField::MaxDuration), json!("8"));
        assert_eq!(property_value(&json!("all day"), 1, PolicyField::MaxDuration), json!("all day"));
    }

    #[tokio::test]
    async fn test_replace_and_append() {
        let mut existing = PropertyValue::new("p1", json!("false"));
        existing.extra.insert("id".to_string(), json!("pv1"));
        existing.extra.insert("version".to_string(), json!("00000000000abc"));
        let mut target = device("b1", "ABC123", &[]);
        target.custom_properties.push(existing);
        let fleet = FakeFleet::new(vec![target]);

        let changes = params(json!({"bookable": true, "approvers": "", "colour": "red"}));
        let report = update_device_properties(&fleet, "ABC123", &changes).await.unwrap();
        assert_eq!(report.updated, vec!["Booking Approvers", "Enable Equipment Booking"]);
        assert_eq!(report.skipped, vec!["colour"]);

        let saved = fleet.state.saved_devices.lock().unwrap()[0].clone();
        assert_eq!(saved.custom_properties.len(), 2);
        let bookable = &saved.custom_properties[0];
        assert_eq!(bookable.value, Some(json!("true")));
        assert_eq!(bookable.extra.get("version"), Some(&json!("00000000000abc")));
        assert_eq!(saved.custom_properties[1].property_id(), Some("p3"));
        assert_eq!(saved.custom_properties[1].value, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let fleet = FakeFleet::new(vec![]);
        let err = update_device_properties(&fleet, "b9", &params(json!({"bookable": true}))).await.unwrap_err();
        assert!(matches!(err, PropertyError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_setup_creates_missing_properties() {
        let fleet = FakeFleet::new(vec![]);
        fleet.state.catalog.lock().unwrap().retain(|d| d.name != "Fleet Managers" && d.name != "Mailbox Language");

        let report = setup_properties(&fleet).await.unwrap();
        assert_eq!(report.created, vec!["Fleet Managers", "Mailbox Language"]);
        assert_eq!(report.skipped.len(), 6);

        let catalog = fleet.state.catalog.lock().unwrap().clone();
        let added = catalog.iter().find(|d| d.name == "Fleet Managers").unwrap();
        assert_eq!(added.property_set, Some(EntityRef::new("ps-device")));

        let again = setup_properties(&fleet).await.unwrap();
        assert!(again.created.is_empty());
    }

    #[tokio::test]
    async fn test_setup_requires_device_property_set() {
        let fleet = FakeFleet::new(vec![]);
        fleet.state.property_sets.lock().unwrap().clear();
        assert!(matches!(setup_properties(&fleet).await, Err(PropertyError::PropertySetMissing(_))));
    }
}
