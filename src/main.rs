use std::sync::Arc;
use clap::Parser;
use log::{error, info, LevelFilter};
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::data_structures::{ClientRequest, CliArgs, Command, SyncRequest};
use crate::geotab::{FleetConnector, GeotabConnector};
use crate::http::AppContext;
use crate::secrets::LayeredSecretStore;

mod applier;
mod config;
mod credentials;
mod data_structures;
mod exchange;
mod geotab;
mod http;
mod interfaces;
mod normalizer;
mod properties;
mod rate_limit;
mod resolver;
mod secrets;
mod state;
mod sync;
mod timezone;
#[cfg(test)]
mod testing;


#[tokio::main]
async fn main() {

    let args = CliArgs::parse();
    let config = match Config::new(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config);

    if let Err(e) = run(args.command, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    normalizer::validate_alias_table()?;

    match command {
        Command::Serve => {
            info!("Starting FleetBridge API");
            let context = AppContext::from_config(&config)?;
            http::serve(&config.get_listen_address(), Arc::new(context)).await
        },
        Command::Sync { api_key, max_devices } => {
            let context = AppContext::from_config(&config)?;
            let request = SyncRequest {
                client: ClientRequest { api_key: Some(api_key), ..Default::default() },
                max_devices,
            };
            let summary = context.run_sync(&request).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        },
        Command::SetupProperties { api_key } => {
            let secrets = Arc::new(LayeredSecretStore::from_config(&config.secrets));
            let tenant = CredentialResolver::new(secrets, &config).resolve_api_key(&api_key).await?;
            let fleet = GeotabConnector::new(config.get_request_timeout())?
                .connect(&tenant.fleet).await?;
            let report = properties::setup_properties(fleet.as_ref()).await?;
            info!("Property setup for {}: {} created, {} already present",
                tenant.fleet.database, report.created.len(), report.skipped.len());
            println!("Created: {}", report.created.len());
            println!("Skipped: {}", report.skipped.len());
            Ok(())
        },
    }
}

fn init_logging(config: &Config) {

    let (path, level) = if let Some(log_config) = &config.log {
        let level = if log_config.debug { LevelFilter::Debug } else { LevelFilter::Info };
        (log_config.path.clone(), level)
    } else {
        ("".to_string(), LevelFilter::Info)
    };

    if !path.is_empty() {
        if let Err(e) = simple_logging::log_to_file(&path, level) {
            eprintln!("Could not log to {}: {}, logging to stderr", path, e);
            simple_logging::log_to_stderr(level);
        }
    } else {
        simple_logging::log_to_stderr(level);
    }
}
