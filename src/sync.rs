use std::sync::Arc;
use std::time::Instant;
use log::{error, info, warn};
use thiserror::Error;
use crate::applier::{ApplierSettings, SettingsApplier};
use crate::credentials::{CredentialError, TenantCredentials};
use crate::data_structures::{Device, SyncReason, SyncResult, SyncSummary};
use crate::exchange::{ExchangeClient, ExchangeConnector, ExchangeError};
use crate::geotab::{FleetConnector, FleetError};
use crate::normalizer::{normalize, PropertyCatalog};
use crate::resolver::MailboxResolver;


#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error("Exchange is not connected for this client. Grant the Exchange application access first.")]
    ExchangeNotConnected,
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}


/// Runs one full sync for a client: MyGeotab devices in, mailbox settings out.
pub struct SyncService {
    fleet: Arc<dyn FleetConnector>,
    exchange: Arc<dyn ExchangeConnector>,
    settings: ApplierSettings,
}

impl SyncService {
    pub fn new(fleet: Arc<dyn FleetConnector>, exchange: Arc<dyn ExchangeConnector>, settings: ApplierSettings) -> Self {
        SyncService { fleet, exchange, settings }
    }

    pub fn fleet(&self) -> &Arc<dyn FleetConnector> {
        &self.fleet
    }

    /// `max_devices` of zero means no limit.
    pub async fn run(&self, tenant: &TenantCredentials, max_devices: Option<usize>) -> Result<SyncSummary, SyncError> {
        let start = Instant::now();
        let tenant_id = tenant.exchange_tenant_id.clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(SyncError::ExchangeNotConnected)?;

        let fleet = self.fleet.connect(&tenant.fleet).await?;
        let mut devices = fleet.get_devices().await?;
        let catalog = PropertyCatalog::new(fleet.get_property_catalog().await?);
        info!("Found {} devices and {} catalog properties in {}", devices.len(), catalog.len(), tenant.fleet.database);

        if let Some(limit) = max_devices.filter(|n| *n > 0) {
            if devices.len() > limit {
                info!("Limiting sync to the first {} of {} devices", limit, devices.len());
                devices.truncate(limit);
            }
        }

        let exchange = self.exchange.connect(&tenant_id).await?;
        let mut summary = SyncSummary::default();
        for device in devices.iter() {
            if device.serial().is_none() {
                warn!("Skipping device {} ({}) without a serial number", device.name, device.id);
                continue;
            }
            let result = self.sync_device(&exchange, device, &catalog, &tenant.equipment_domain).await;
            summary.push(result);
        }

        summary.success = true;
        summary.execution_time_ms = start.elapsed().as_millis() as u64;
        info!("{}", get_output_string(&summary));
        Ok(summary)
    }

    async fn sync_device(&self, exchange: &ExchangeClient, device: &Device, catalog: &PropertyCatalog,
                         domain: &str) -> SyncResult {
        let serial = device.serial().unwrap_or_default().to_string();
        let local_part = serial.to_lowercase();
        let email = format!("{}@{}", local_part, domain);
        let mut result = SyncResult {
            device: device.name.clone(),
            serial_number: serial,
            success: false,
            email: email.clone(),
            reason: SyncReason::Error,
            detail: None,
            warnings: vec![],
        };

        let policy = normalize(device, catalog);
        info!("Syncing {} to {} (bookable: {})", device.name, email, policy.bookable);

        let resolved = match MailboxResolver::new(exchange.clone()).resolve(&local_part, domain).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                info!("No mailbox found for {}", email);
                result.reason = SyncReason::MailboxNotFound;
                result.detail = Some(format!("No mailbox found for {}. Mailboxes are not created automatically.", email));
                return result;
            },
            Err(e) => {
                error!("Could not resolve mailbox for {}: {}", email, e);
                result.detail = Some(e.to_string());
                return result;
            },
        };

        let applier = SettingsApplier::new(exchange, &self.settings);
        match applier.apply(&resolved.mailbox, device, &policy, &email).await {
            Ok(report) => {
                result.success = true;
                result.reason = SyncReason::Ok;
                result.email = resolved.mailbox.primary_smtp();
                result.warnings = report.warnings;
            },
            Err(e) => {
                error!("Could not apply settings to {}: {}", email, e);
                result.detail = Some(e.to_string());
            },
        }
        result
    }
}

fn get_output_string(summary: &SyncSummary) -> String {
    let not_found = summary.results.iter().filter(|r| r.reason == SyncReason::MailboxNotFound).count();
    let warnings: usize = summary.results.iter().map(|r| r.warnings.len()).sum();
    format!("\
Done!||
Devices processed: {}||
Devices successful: {}||
Devices failed: {}||
Mailboxes not found: {}||
Step warnings: {}||
Took: {}ms",
        summary.processed, summary.successful, summary.failed, not_found, warnings, summary.execution_time_ms
    )
}
