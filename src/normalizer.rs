//! Turns the free-form custom properties of a MyGeotab device into a typed [`BookingPolicy`].
//!
//! Properties are matched by display name against [`ALIASES`], case-insensitively. For every
//! field the first usable source wins, in this order:
//! - a custom property, earlier aliases in the table before later ones
//! - a direct field on the device record with the same meaning
//! - the default
//!
//! Absent, null, blank and malformed values count as unusable. Nothing in here does I/O.

use std::collections::{BTreeSet, HashMap, HashSet};
use anyhow::bail;
use serde_derive::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use crate::data_structures::{Device, PropertyDefinition, PropertyValue};

pub const DEFAULT_BOOKING_WINDOW_DAYS: u32 = 90;
pub const DEFAULT_MAX_DURATION_MINUTES: u32 = 1440;
pub const DEFAULT_MAILBOX_LANGUAGE: &str = "en-AU";

const TRUE_WORDS: [&str; 5] = ["true", "1", "on", "yes", "y"];


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyField {
    Bookable,
    RecurringAllowed,
    Approvers,
    FleetManagers,
    AllowConflicts,
    BookingWindowDays,
    MaxDuration,
    MailboxLanguage,
}

impl PolicyField {
    pub const ALL: [PolicyField; 8] = [
        PolicyField::Bookable,
        PolicyField::RecurringAllowed,
        PolicyField::Approvers,
        PolicyField::FleetManagers,
        PolicyField::AllowConflicts,
        PolicyField::BookingWindowDays,
        PolicyField::MaxDuration,
        PolicyField::MailboxLanguage,
    ];

    /// Name of the property as created by `setup-properties`.
    pub fn canonical_alias(&self) -> &'static Alias {
        ALIASES.iter()
            .find(|a| a.field == *self)
            .unwrap_or(&ALIASES[0])
    }

    /// Key used by the device property update endpoint.
    pub fn short_key(&self) -> &'static str {
        match self {
            PolicyField::Bookable => "bookable",
            PolicyField::RecurringAllowed => "recurring",
            PolicyField::Approvers => "approvers",
            PolicyField::FleetManagers => "fleetManagers",
            PolicyField::AllowConflicts => "conflicts",
            PolicyField::BookingWindowDays => "windowDays",
            PolicyField::MaxDuration => "maxDurationHours",
            PolicyField::MailboxLanguage => "language",
        }
    }

    pub fn from_short_key(key: &str) -> Option<PolicyField> {
        PolicyField::ALL.iter().copied().find(|f| f.short_key().eq_ignore_ascii_case(key.trim()))
    }

    /// Device record fields consulted when no custom property is usable.
    fn direct_fields(&self) -> &'static [&'static str] {
        match self {
            PolicyField::Bookable => &["bookable"],
            PolicyField::RecurringAllowed => &["recurringAllowed", "allowRecurringMeetings"],
            PolicyField::Approvers => &["approvers", "resourceDelegates"],
            PolicyField::FleetManagers => &["fleetManagers"],
            PolicyField::AllowConflicts => &["allowConflicts"],
            PolicyField::BookingWindowDays => &["bookingWindowInDays"],
            PolicyField::MaxDuration => &["maximumDurationInMinutes"],
            PolicyField::MailboxLanguage => &["mailboxLanguage"],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Alias {
    pub name: &'static str,
    pub field: PolicyField,
    /// Multiplier applied to numeric values, e.g. 60 for a value given in hours.
    pub scale: u32,
    pub description: &'static str,
}

const fn alias(name: &'static str, field: PolicyField, scale: u32, description: &'static str) -> Alias {
    Alias { name, field, scale, description }
}

/// Accepted property names. The first entry of each field is its canonical catalog name.
pub static ALIASES: &[Alias] = &[
    alias("Enable Equipment Booking", PolicyField::Bookable, 1,
          "Allow this asset to be booked through its equipment mailbox"),
    alias("Bookable", PolicyField::Bookable, 1, ""),
    alias("IsBookable", PolicyField::Bookable, 1, ""),
    alias("Equipment Booking", PolicyField::Bookable, 1, ""),
    alias("Allow Recurring Bookings", PolicyField::RecurringAllowed, 1,
          "Allow recurring meeting requests"),
    alias("Recurring Allowed", PolicyField::RecurringAllowed, 1, ""),
    alias("RecurringAllowed", PolicyField::RecurringAllowed, 1, ""),
    alias("Allow Recurring", PolicyField::RecurringAllowed, 1, ""),
    alias("Booking Approvers", PolicyField::Approvers, 1,
          "Comma separated email addresses that approve booking requests"),
    alias("Approvers", PolicyField::Approvers, 1, ""),
    alias("Resource Delegates", PolicyField::Approvers, 1, ""),
    alias("Fleet Managers", PolicyField::FleetManagers, 1,
          "Comma separated email addresses with full calendar access"),
    alias("FleetManagers", PolicyField::FleetManagers, 1, ""),
    alias("Fleet Manager", PolicyField::FleetManagers, 1, ""),
    alias("Allow Double Booking", PolicyField::AllowConflicts, 1,
          "Accept overlapping bookings"),
    alias("Allow Conflicts", PolicyField::AllowConflicts, 1, ""),
    alias("AllowConflicts", PolicyField::AllowConflicts, 1, ""),
    alias("Booking Window (Days)", PolicyField::BookingWindowDays, 1,
          "How many days in advance the asset can be booked"),
    alias("Booking Window", PolicyField::BookingWindowDays, 1, ""),
    alias("BookingWindowInDays", PolicyField::BookingWindowDays, 1, ""),
    alias("Maximum Booking Duration (Hours)", PolicyField::MaxDuration, 60,
          "Longest allowed booking in hours"),
    alias("Maximum Duration (Minutes)", PolicyField::MaxDuration, 1, ""),
    alias("MaximumDurationInMinutes", PolicyField::MaxDuration, 1, ""),
    alias("Mailbox Language", PolicyField::MailboxLanguage, 1,
          "Language of the equipment mailbox, e.g. en-AU"),
    alias("Language", PolicyField::MailboxLanguage, 1, ""),
    alias("MailboxLanguage", PolicyField::MailboxLanguage, 1, ""),
];

/// Checks the alias table once at startup: every field has a name and no name is claimed twice.
pub fn validate_alias_table() -> anyhow::Result<()> {
    let mut seen: HashMap<String, PolicyField> = HashMap::new();
    for entry in ALIASES {
        let key = entry.name.trim().to_lowercase();
        if let Some(existing) = seen.insert(key, entry.field) {
            bail!("Property alias '{}' is mapped to both {:?} and {:?}", entry.name, existing, entry.field);
        }
    }
    for field in PolicyField::ALL {
        if !ALIASES.iter().any(|a| a.field == field) {
            bail!("No property alias configured for {:?}", field);
        }
    }
    Ok(())
}

pub fn lookup_alias(name: &str) -> Option<(usize, &'static Alias)> {
    let name = name.trim();
    ALIASES.iter()
        .enumerate()
        .find(|(_, a)| a.name.eq_ignore_ascii_case(name))
}


/// Property id to name index built from `Get Property`.
#[derive(Clone, Debug, Default)]
pub struct PropertyCatalog {
    definitions: Vec<PropertyDefinition>,
    by_id: HashMap<String, usize>,
}

impl PropertyCatalog {
    pub fn new(definitions: Vec<PropertyDefinition>) -> Self {
        let by_id = definitions.iter()
            .enumerate()
            .filter(|(_, d)| !d.id.is_empty())
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        PropertyCatalog { definitions, by_id }
    }

    pub fn name_of<'a>(&'a self, value: &'a PropertyValue) -> Option<&'a str> {
        let from_catalog = value.property_id()
            .and_then(|id| self.by_id.get(id))
            .map(|i| self.definitions[*i].name.as_str())
            .filter(|n| !n.is_empty());
        from_catalog.or_else(|| value.property.as_ref().and_then(|p| p.name.as_deref()))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PropertyDefinition> {
        let name = name.trim();
        self.definitions.iter().find(|d| d.name.trim().eq_ignore_ascii_case(name))
    }

    /// Catalog entry backing a field, trying its aliases in table order.
    pub fn find_for_field(&self, field: PolicyField) -> Option<(&PropertyDefinition, &'static Alias)> {
        ALIASES.iter()
            .filter(|a| a.field == field)
            .find_map(|a| self.find_by_name(a.name).map(|d| (d, a)))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}


#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BookingPolicy {
    pub bookable: bool,
    pub recurring_allowed: bool,
    pub approvers: BTreeSet<String>,
    pub fleet_managers: BTreeSet<String>,
    pub allow_conflicts: bool,
    pub booking_window_days: u32,
    pub max_duration_minutes: u32,
    pub mailbox_language: String,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        BookingPolicy {
            bookable: false,
            recurring_allowed: false,
            approvers: BTreeSet::new(),
            fleet_managers: BTreeSet::new(),
            allow_conflicts: false,
            booking_window_days: DEFAULT_BOOKING_WINDOW_DAYS,
            max_duration_minutes: DEFAULT_MAX_DURATION_MINUTES,
            mailbox_language: DEFAULT_MAILBOX_LANGUAGE.to_string(),
        }
    }
}

impl BookingPolicy {
    /// Short fingerprint of the normalized policy, stored on the mailbox to spot drift.
    pub fn version(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter()
            .take(6)
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}


pub fn normalize(device: &Device, catalog: &PropertyCatalog) -> BookingPolicy {
    let sources = collect_sources(device, catalog);
    let candidates = |field: PolicyField| field_candidates(&sources, device, field);

    let defaults = BookingPolicy::default();
    BookingPolicy {
        bookable: first_bool(&candidates(PolicyField::Bookable)).unwrap_or(defaults.bookable),
        recurring_allowed: first_bool(&candidates(PolicyField::RecurringAllowed))
            .unwrap_or(defaults.recurring_allowed),
        approvers: first_list(&candidates(PolicyField::Approvers)).unwrap_or(defaults.approvers),
        fleet_managers: first_list(&candidates(PolicyField::FleetManagers)).unwrap_or(defaults.fleet_managers),
        allow_conflicts: first_bool(&candidates(PolicyField::AllowConflicts)).unwrap_or(defaults.allow_conflicts),
        booking_window_days: first_positive_int(&candidates(PolicyField::BookingWindowDays))
            .unwrap_or(defaults.booking_window_days),
        max_duration_minutes: first_positive_int(&candidates(PolicyField::MaxDuration))
            .unwrap_or(defaults.max_duration_minutes),
        mailbox_language: first_text(&candidates(PolicyField::MailboxLanguage))
            .unwrap_or(defaults.mailbox_language),
    }
}

/// Usable custom property values per field as (alias rank, value, scale).
fn collect_sources<'a>(device: &'a Device, catalog: &'a PropertyCatalog)
    -> HashMap<PolicyField, Vec<(usize, &'a Value, u32)>> {

    let mut sources: HashMap<PolicyField, Vec<(usize, &Value, u32)>> = HashMap::new();
    for property in device.custom_properties.iter() {
        let Some(name) = catalog.name_of(property) else { continue };
        let Some((rank, alias)) = lookup_alias(name) else { continue };
        if let Some(value) = property.raw_value().filter(|v| is_present(v)) {
            sources.entry(alias.field).or_default().push((rank, value, alias.scale));
        }
    }
    sources
}

/// Values for one field in precedence order, each with its numeric scale.
fn field_candidates<'a>(sources: &HashMap<PolicyField, Vec<(usize, &'a Value, u32)>>,
                        device: &'a Device, field: PolicyField) -> Vec<(&'a Value, u32)> {
    let mut found = sources.get(&field).cloned().unwrap_or_default();
    found.sort_by_key(|(rank, _, _)| *rank);
    let mut values: Vec<(&'a Value, u32)> = found.into_iter().map(|(_, v, scale)| (v, scale)).collect();
    values.extend(direct_values(device, field).into_iter().map(|v| (v, 1)));
    values
}

fn direct_values(device: &Device, field: PolicyField) -> Vec<&Value> {
    let names: HashSet<String> = field.direct_fields().iter().map(|n| n.to_lowercase()).collect();
    device.extra.iter()
        .filter(|(k, _)| names.contains(&k.to_lowercase()))
        .map(|(_, v)| v)
        .filter(|v| is_present(v))
        .collect()
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    }
}

fn first_bool(candidates: &[(&Value, u32)]) -> Option<bool> {
    candidates.first().map(|(v, _)| coerce_bool(v))
}

fn first_list(candidates: &[(&Value, u32)]) -> Option<BTreeSet<String>> {
    candidates.iter()
        .map(|(v, _)| coerce_list(v))
        .find(|l| !l.is_empty())
}

fn first_positive_int(candidates: &[(&Value, u32)]) -> Option<u32> {
    candidates.iter().find_map(|(v, scale)| coerce_positive_int(v)
        .map(|n| n.saturating_mul(*scale)))
}

fn first_text(candidates: &[(&Value, u32)]) -> Option<String> {
    candidates.iter().find_map(|(v, _)| v.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            TRUE_WORDS.contains(&s.as_str())
        },
        _ => false,
    }
}

pub fn coerce_list(value: &Value) -> BTreeSet<String> {
    match value {
        Value::String(s) => s.split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items.iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Whole number of at least one, or `None`.
pub fn coerce_positive_int(value: &Value) -> Option<u32> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    if !number.is_finite() || number < 1.0 {
        return None;
    }
    Some(number.trunc().min(u32::MAX as f64) as u32)
}
