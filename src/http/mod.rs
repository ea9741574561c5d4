pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    routing::{get, post},
};
use log::{error, info, warn};

use crate::applier::ApplierSettings;
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::data_structures::{SyncRequest, SyncSummary};
use crate::exchange::admin_api::AdminApiConnector;
use crate::geotab::GeotabConnector;
use crate::interfaces::interface::{UsageLog, UsageRecord};
use crate::rate_limit::{SharedRateLimiter, DEFAULT_MAX_CLIENTS};
use crate::secrets::LayeredSecretStore;
use crate::state::{ClientSyncState, StateManager};
use crate::sync::{SyncError, SyncService};

pub const SERVICE_NAME: &str = "fleetbridge";

#[derive(Clone)]
pub struct AppContext {
    pub credentials: Arc<CredentialResolver>,
    pub sync: Arc<SyncService>,
    pub state: Arc<StateManager>,
    pub usage: UsageLog,
    pub rate_limiter: SharedRateLimiter,
}

pub type SharedContext = Arc<AppContext>;

impl AppContext {
    /// Wires the production clients from the config file.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let secrets = Arc::new(LayeredSecretStore::from_config(&config.secrets));
        let timeout = config.get_request_timeout();
        let fleet = Arc::new(GeotabConnector::new(timeout)?);
        let exchange = Arc::new(AdminApiConnector::from_config(config)?);
        let (requests, window) = config.get_rate_limit();
        let max_clients = config.rate_limit.as_ref()
            .and_then(|r| r.max_clients)
            .unwrap_or(DEFAULT_MAX_CLIENTS);

        Ok(AppContext {
            credentials: Arc::new(CredentialResolver::new(secrets, config)),
            sync: Arc::new(SyncService::new(fleet, exchange, ApplierSettings::from_config(config))),
            state: Arc::new(StateManager::new(&config.get_working_dir())),
            usage: UsageLog::from_config(config),
            rate_limiter: SharedRateLimiter::new(requests, window, max_clients),
        })
    }

    /// Resolves credentials, runs the sync, persists the outcome and records usage.
    pub async fn run_sync(&self, request: &SyncRequest) -> Result<SyncSummary, SyncError> {
        let start = Instant::now();
        let tenant = self.credentials.resolve(&request.client).await?;
        info!("Starting sync for database {}", tenant.fleet.database);

        let result = self.sync.run(&tenant, request.max_devices).await;
        let elapsed = start.elapsed().as_millis() as u64;
        let mut record = UsageRecord::new(&tenant.client_key, "sync", result.is_ok(), elapsed);
        match &result {
            Ok(summary) => {
                record.processed = Some(summary.processed);
                if let Err(e) = self.state.save_state(&tenant.client_key, &ClientSyncState::from_summary(summary)) {
                    warn!("Sync state not saved: {}", e);
                }
            },
            Err(e) => {
                error!("Sync failed for database {}: {}", tenant.fleet.database, e);
                record.error = Some(e.to_string());
            },
        }
        self.usage.record(record).await;
        result
    }
}

pub fn router(context: SharedContext) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/sync-to-exchange", post(handlers::sync_to_exchange))
        .route("/api/status", post(handlers::status))
        .route("/api/update-device-properties", post(handlers::update_device_properties))
        .with_state(context)
}

pub async fn serve(address: &str, context: SharedContext) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(context).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Stopping FleetBridge.");
}
