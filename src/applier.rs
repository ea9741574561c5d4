//! Pushes a [`BookingPolicy`] and device metadata onto a resolved mailbox.

use log::{debug, warn};
use serde_json::json;
use crate::config::{Config, WorkingHoursSubConfig};
use crate::data_structures::{ArbitraryJson, Device};
use crate::exchange::{params, ExchangeClient, ExchangeError, Mailbox};
use crate::normalizer::BookingPolicy;
use crate::timezone::{to_windows_timezone, DEFAULT_WINDOWS_TIMEZONE};

pub const ADDITIONAL_RESPONSE: &str = "IMPORTANT: Check the meeting status in your calendar:\n\
- ACCEPTED = Equipment is reserved for you\n\
- DECLINED = Equipment is NOT available - DELETE this calendar entry immediately\n\
- TENTATIVE = Awaiting approval from fleet manager\n\
\n\
Always cancel bookings you no longer need so others can use the equipment.";

const DEFAULT_FLEET_MANAGER_ACCESS: &str = "Editor";
const DEFAULT_CALENDAR_ACCESS: &str = "LimitedDetails";


#[derive(Clone, Debug)]
pub struct ApplierSettings {
    pub default_timezone: String,
    pub policy_id: Option<String>,
    pub fleet_manager_access: String,
    pub calendar_default_access: String,
    pub working_hours: Option<WorkingHoursSubConfig>,
}

impl Default for ApplierSettings {
    fn default() -> Self {
        ApplierSettings {
            default_timezone: DEFAULT_WINDOWS_TIMEZONE.to_string(),
            policy_id: None,
            fleet_manager_access: DEFAULT_FLEET_MANAGER_ACCESS.to_string(),
            calendar_default_access: DEFAULT_CALENDAR_ACCESS.to_string(),
            working_hours: None,
        }
    }
}

impl ApplierSettings {
    pub fn from_config(config: &Config) -> Self {
        let sync = &config.sync;
        let defaults = ApplierSettings::default();
        ApplierSettings {
            default_timezone: sync.default_timezone.clone().unwrap_or(defaults.default_timezone),
            policy_id: sync.policy_id.clone(),
            fleet_manager_access: sync.fleet_manager_access.clone().unwrap_or(defaults.fleet_manager_access),
            calendar_default_access: sync.calendar_default_access.clone().unwrap_or(defaults.calendar_default_access),
            working_hours: sync.working_hours.clone(),
        }
    }

    fn has_working_hours(&self) -> bool {
        self.working_hours.as_ref()
            .is_some_and(|w| w.start.is_some() || w.end.is_some() || w.work_days.is_some())
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStep {
    Identity,
    Regional,
    CalendarProcessing,
    WorkingHours,
    CustomAttributes,
    DelegatePermissions,
    DefaultVisibility,
}

impl ApplyStep {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyStep::Identity => "identity",
            ApplyStep::Regional => "regional",
            ApplyStep::CalendarProcessing => "calendar processing",
            ApplyStep::WorkingHours => "working hours",
            ApplyStep::CustomAttributes => "custom attributes",
            ApplyStep::DelegatePermissions => "delegate permissions",
            ApplyStep::DefaultVisibility => "default visibility",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<ApplyStep>,
    pub warnings: Vec<String>,
}

impl ApplyReport {
    /// Keeps going on cmdlet errors, stops on fatal ones.
    fn record(&mut self, step: ApplyStep, address: &str, result: Result<(), ExchangeError>) -> Result<(), ExchangeError> {
        match result {
            Ok(()) => {
                self.applied.push(step);
                Ok(())
            },
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Could not apply {} settings to {}: {}", step.label(), address, e);
                self.warnings.push(format!("{}: {}", step.label(), e));
                Ok(())
            },
        }
    }
}


/// `Set-CalendarProcessing` parameters for a policy. A non-bookable policy ignores every other field.
pub fn calendar_processing_parameters(identity: &str, policy: &BookingPolicy, work_hours_only: bool) -> ArbitraryJson {
    if !policy.bookable {
        return params(json!({
            "Identity": identity,
            "AutomateProcessing": "None",
            "BookingWindowInDays": 0,
            "AllBookInPolicy": false,
            "AllRequestInPolicy": false,
        }));
    }

    let mut parameters = params(json!({
        "Identity": identity,
        "AutomateProcessing": "AutoAccept",
        "AllowConflicts": policy.allow_conflicts,
        "BookingWindowInDays": policy.booking_window_days,
        "MaximumDurationInMinutes": policy.max_duration_minutes,
        "AllowRecurringMeetings": policy.recurring_allowed,
        "ScheduleOnlyDuringWorkHours": work_hours_only,
        "AddAdditionalResponse": true,
        "AdditionalResponse": ADDITIONAL_RESPONSE,
    }));
    if policy.approvers.is_empty() {
        parameters.insert("AllBookInPolicy".to_string(), json!(true));
        parameters.insert("AllRequestInPolicy".to_string(), json!(false));
    } else {
        parameters.insert("ResourceDelegates".to_string(), json!(policy.approvers));
        parameters.insert("AllBookInPolicy".to_string(), json!(false));
        parameters.insert("AllRequestInPolicy".to_string(), json!(true));
    }
    parameters
}

/// `CustomAttribute1..5` for a device. Absent values are left out so existing attributes survive.
pub fn custom_attribute_parameters(identity: &str, device: &Device, policy_id: &Option<String>,
                                   policy: &BookingPolicy) -> ArbitraryJson {
    let mut parameters = params(json!({
        "Identity": identity,
        "CustomAttribute5": policy.version(),
    }));
    let values = [
        ("CustomAttribute1", &device.vehicle_identification_number),
        ("CustomAttribute2", &device.license_plate),
        ("CustomAttribute3", &device.device_type),
        ("CustomAttribute4", policy_id),
    ];
    for (name, value) in values {
        if let Some(text) = value.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            parameters.insert(name.to_string(), json!(text));
        }
    }
    parameters
}


pub struct SettingsApplier<'a> {
    client: &'a ExchangeClient,
    settings: &'a ApplierSettings,
}

impl<'a> SettingsApplier<'a> {
    pub fn new(client: &'a ExchangeClient, settings: &'a ApplierSettings) -> Self {
        SettingsApplier { client, settings }
    }

    /// Runs every step against `mailbox`. `target_address` is the conventional `<serial>@<domain>`.
    pub async fn apply(&self, mailbox: &Mailbox, device: &Device, policy: &BookingPolicy,
                       target_address: &str) -> Result<ApplyReport, ExchangeError> {
        let identity = mailbox.id();
        let address = mailbox.primary_smtp();
        let timezone = to_windows_timezone(device.time_zone_id.as_deref(), &self.settings.default_timezone);
        let mut report = ApplyReport::default();

        let result = self.apply_identity(&identity, mailbox, device, target_address).await;
        report.record(ApplyStep::Identity, &address, result)?;

        let result = self.run("Set-MailboxRegionalConfiguration", params(json!({
            "Identity": identity,
            "TimeZone": timezone,
            "Language": policy.mailbox_language,
            "LocalizeDefaultFolderName": true,
        }))).await;
        report.record(ApplyStep::Regional, &address, result)?;

        let parameters = calendar_processing_parameters(&identity, policy, self.settings.has_working_hours());
        let result = self.run("Set-CalendarProcessing", parameters).await;
        report.record(ApplyStep::CalendarProcessing, &address, result)?;

        let result = self.apply_working_hours(&identity, &timezone).await;
        report.record(ApplyStep::WorkingHours, &address, result)?;

        let parameters = custom_attribute_parameters(&identity, device, &self.settings.policy_id, policy);
        let result = self.run("Set-Mailbox", parameters).await;
        report.record(ApplyStep::CustomAttributes, &address, result)?;

        let calendar = format!("{}:\\Calendar", address);
        self.apply_delegates(&calendar, policy, &mut report).await?;

        let result = self.run("Set-MailboxFolderPermission", params(json!({
            "Identity": calendar,
            "User": "Default",
            "AccessRights": self.settings.calendar_default_access,
        }))).await;
        report.record(ApplyStep::DefaultVisibility, &address, result)?;

        debug!("Applied {} of 7 steps to {}", report.applied.len(), address);
        Ok(report)
    }

    async fn run(&self, cmdlet: &str, parameters: ArbitraryJson) -> Result<(), ExchangeError> {
        self.client.invoke(cmdlet, parameters).await.map(|_| ())
    }

    async fn apply_identity(&self, identity: &str, mailbox: &Mailbox, device: &Device,
                            target_address: &str) -> Result<(), ExchangeError> {
        let target_address = target_address.to_lowercase();
        let alias = target_address.split('@').next().unwrap_or_default().to_string();
        let display_name = match device.name.trim() {
            "" => format!("Equipment {}", alias),
            name => name.to_string(),
        };
        let mut parameters = params(json!({
            "Identity": identity,
            "DisplayName": display_name,
            "Alias": alias,
        }));
        if mailbox.primary_smtp() != target_address {
            parameters.insert("WindowsEmailAddress".to_string(), json!(target_address));
        }
        self.run("Set-Mailbox", parameters).await
    }

    async fn apply_working_hours(&self, identity: &str, timezone: &str) -> Result<(), ExchangeError> {
        let mut parameters = params(json!({"Identity": identity, "WorkingHoursTimeZone": timezone}));
        if let Some(hours) = &self.settings.working_hours {
            let optional = [
                ("WorkingHoursStartTime", &hours.start),
                ("WorkingHoursEndTime", &hours.end),
                ("WorkDays", &hours.work_days),
            ];
            for (name, value) in optional {
                if let Some(value) = value {
                    parameters.insert(name.to_string(), json!(value));
                }
            }
        }
        self.run("Set-MailboxCalendarConfiguration", parameters).await
    }

    /// One grant per fleet manager. A failed grant is a warning and the rest still run.
    async fn apply_delegates(&self, calendar: &str, policy: &BookingPolicy,
                             report: &mut ApplyReport) -> Result<(), ExchangeError> {
        let mut failed = false;
        for manager in &policy.fleet_managers {
            let parameters = params(json!({
                "Identity": calendar,
                "User": manager,
                "AccessRights": self.settings.fleet_manager_access,
            }));
            let result = match self.run("Add-MailboxFolderPermission", parameters.clone()).await {
                Err(ExchangeError::AlreadyExists(_)) => self.run("Set-MailboxFolderPermission", parameters).await,
                other => other,
            };
            match result {
                Ok(()) => {},
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failed = true;
                    warn!("Could not grant {} access to {}: {}", manager, calendar, e);
                    report.warnings.push(format!("{} for {}: {}", ApplyStep::DelegatePermissions.label(), manager, e));
                },
            }
        }
        if !failed {
            report.applied.push(ApplyStep::DelegatePermissions);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use crate::testing::{mailbox, FakeExchange};

    fn device() -> Device {
        Device {
            id: "b1".to_string(),
            name: "Ute 12".to_string(),
            serial_number: Some("ABC123".to_string()),
            vehicle_identification_number: Some("1HGCM82633A004352".to_string()),
            license_plate: Some("XYZ-123".to_string()),
            time_zone_id: Some("Australia/Perth".to_string()),
            ..Default::default()
        }
    }

    fn bookable_policy() -> BookingPolicy {
        BookingPolicy {
            bookable: true,
            fleet_managers: BTreeSet::from(["fm@example.com".to_string()]),
            ..Default::default()
        }
    }

    async fn apply(fake: &Arc<FakeExchange>, settings: &ApplierSettings, policy: &BookingPolicy) -> Result<ApplyReport, ExchangeError> {
        let client = fake.client();
        let mailbox = mailbox("abc123@equip.example.com", "EquipmentMailbox");
        SettingsApplier::new(&client, settings)
            .apply(&mailbox, &device(), policy, "abc123@equip.example.com").await
    }

    #[test]
    fn test_disabled_policy_shape() {
        let policy = BookingPolicy {
            bookable: false,
            approvers: BTreeSet::from(["a@example.com".to_string()]),
            allow_conflicts: true,
            ..Default::default()
        };
        let p = calendar_processing_parameters("x", &policy, true);
        assert_eq!(p["AutomateProcessing"], json!("None"));
        assert_eq!(p["BookingWindowInDays"], json!(0));
        assert_eq!(p["AllBookInPolicy"], json!(false));
        assert_eq!(p["AllRequestInPolicy"], json!(false));
        assert!(p.get("ResourceDelegates").is_none());
        assert!(p.get("AllowConflicts").is_none());
    }

    #[test]
    fn test_approvers_become_delegates() {
        let policy = BookingPolicy {
            bookable: true,
            approvers: BTreeSet::from(["b@example.com".to_string(), "a@example.com".to_string()]),
            ..Default::default()
        };
        let p = calendar_processing_parameters("x", &policy, false);
        assert_eq!(p["AutomateProcessing"], json!("AutoAccept"));
        assert_eq!(p["ResourceDelegates"], json!(["a@example.com", "b@example.com"]));
        assert_eq!(p["AllBookInPolicy"], json!(false));
        assert_eq!(p["AllRequestInPolicy"], json!(true));
        assert_eq!(p["AdditionalResponse"], json!(ADDITIONAL_RESPONSE));
        assert_eq!(p["ScheduleOnlyDuringWorkHours"], json!(false));
    }

    #[test]
    fn test_no_null_parameters() {
        for policy in [BookingPolicy::default(), BookingPolicy { bookable: true, ..Default::default() }] {
            let p = calendar_processing_parameters("x", &policy, false);
            assert!(p.values().all(|v| !v.is_null()), "{:?}", p);
        }
        let p = calendar_processing_parameters("x", &BookingPolicy { bookable: true, ..Default::default() }, false);
        assert!(p.get("ResourceDelegates").is_none());

        let bare = Device { id: "b2".to_string(), ..Default::default() };
        let p = custom_attribute_parameters("x", &bare, &None, &BookingPolicy::default());
        assert!(p.values().all(|v| !v.is_null()), "{:?}", p);
        assert_eq!(p.len(), 2);
        assert!(p.contains_key("CustomAttribute5"));
    }

    #[test]
    fn test_open_booking_without_approvers() {
        let p = calendar_processing_parameters("x", &bookable_policy(), false);
        assert_eq!(p["AllBookInPolicy"], json!(true));
        assert_eq!(p["AllRequestInPolicy"], json!(false));
        assert_eq!(p["BookingWindowInDays"], json!(90));
        assert_eq!(p["MaximumDurationInMinutes"], json!(1440));
    }

    #[tokio::test]
    async fn test_all_steps_applied() {
        let fake = FakeExchange::with_mailboxes(vec![]);
        let report = apply(&fake, &ApplierSettings::default(), &bookable_policy()).await.unwrap();
        assert_eq!(report.applied.len(), 7);
        assert!(report.warnings.is_empty());

        let regional = &fake.calls_to("Set-MailboxRegionalConfiguration")[0];
        assert_eq!(regional["TimeZone"], json!("W. Australia Standard Time"));
        assert_eq!(regional["Language"], json!("en-AU"));

        let set_mailbox = fake.calls_to("Set-Mailbox");
        assert_eq!(set_mailbox[0]["DisplayName"], json!("Ute 12"));
        assert!(set_mailbox[0].get("WindowsEmailAddress").is_none());
        assert_eq!(set_mailbox[1]["CustomAttribute1"], json!("1HGCM82633A004352"));
        assert!(set_mailbox[1].get("CustomAttribute3").is_none());
        assert_eq!(set_mailbox[1]["CustomAttribute5"], json!(bookable_policy().version()));

        let grants = fake.calls_to("Add-MailboxFolderPermission");
        assert_eq!(grants[0]["Identity"], json!("abc123@equip.example.com:\\Calendar"));
        assert_eq!(grants[0]["AccessRights"], json!("Editor"));
        let default = &fake.calls_to("Set-MailboxFolderPermission")[0];
        assert_eq!(default["User"], json!("Default"));
        assert_eq!(default["AccessRights"], json!("LimitedDetails"));
    }

    #[tokio::test]
    async fn test_existing_grant_is_updated() {
        let fake = FakeExchange::with_mailboxes(vec![]);
        let settings = ApplierSettings::default();
        apply(&fake, &settings, &bookable_policy()).await.unwrap();
        let report = apply(&fake, &settings, &bookable_policy()).await.unwrap();
        assert!(report.warnings.is_empty());
        let updates: Vec<_> = fake.calls_to("Set-MailboxFolderPermission").into_iter()
            .filter(|p| p["User"] == json!("fm@example.com"))
            .collect();
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn test_step_failure_is_warning() {
        let fake = FakeExchange::with_mailboxes(vec![]);
        fake.mark_failing("Set-MailboxRegionalConfiguration");
        let report = apply(&fake, &ApplierSettings::default(), &bookable_policy()).await.unwrap();
        assert_eq!(report.applied.len(), 6);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("regional:"));
        assert_eq!(fake.calls_to("Set-CalendarProcessing").len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_aborts() {
        let fake = FakeExchange::with_mailboxes(vec![]);
        fake.mark_unauthorized("Set-CalendarProcessing");
        let err = apply(&fake, &ApplierSettings::default(), &bookable_policy()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unauthorized(_)));
        assert!(fake.calls_to("Set-MailboxCalendarConfiguration").is_empty());
    }

    #[tokio::test]
    async fn test_working_hours_and_primary_address() {
        let fake = FakeExchange::with_mailboxes(vec![]);
        let settings = ApplierSettings {
            working_hours: Some(WorkingHoursSubConfig {
                start: Some("07:00:00".to_string()),
                end: Some("17:00:00".to_string()),
                work_days: None,
            }),
            ..Default::default()
        };
        let client = fake.client();
        let found = mailbox("abc123@legacy.example.com", "EquipmentMailbox");
        let device = Device { name: " ".to_string(), ..device() };
        SettingsApplier::new(&client, &settings)
            .apply(&found, &device, &bookable_policy(), "ABC123@equip.example.com").await.unwrap();

        let identity = &fake.calls_to("Set-Mailbox")[0];
        assert_eq!(identity["DisplayName"], json!("Equipment abc123"));
        assert_eq!(identity["WindowsEmailAddress"], json!("abc123@equip.example.com"));

        let hours = &fake.calls_to("Set-MailboxCalendarConfiguration")[0];
        assert_eq!(hours["WorkingHoursStartTime"], json!("07:00:00"));
        assert!(hours.get("WorkDays").is_none());
        assert_eq!(fake.calls_to("Set-CalendarProcessing")[0]["ScheduleOnlyDuringWorkHours"], json!(true));
    }
}
