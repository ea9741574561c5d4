use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;
use serde_derive::Deserialize;
use thiserror::Error;


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config path could not be opened: {0}")]
    Open(#[from] std::io::Error),
    #[error("Config could not be parsed: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid apiType: {0}. Must be 'commercial', 'gcc', or 'gcc-high'")]
    InvalidApiType(String),
}


#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    pub listen: Option<String>,  // e.g. "0.0.0.0:8080"
    #[serde(rename = "workingDir")]
    pub working_dir: Option<String>,  // Directory for per-client sync state
    #[serde(rename = "requestTimeout")]
    pub request_timeout: Option<String>,  // e.g. "60s", "2m"
    pub log: Option<LogSubConfig>,
    pub geotab: Option<GeotabSubConfig>,
    #[serde(default)]
    pub exchange: ExchangeSubConfig,
    #[serde(default)]
    pub secrets: SecretsSubConfig,
    #[serde(default)]
    pub sync: SyncSubConfig,
    #[serde(rename = "rateLimit")]
    pub rate_limit: Option<RateLimitSubConfig>,
    pub usage: Option<UsageSubConfig>,
}
impl Config {

    pub fn new(path: &str) -> Result<Self, ConfigError> {

        let open_file = File::open(path)?;
        let reader = BufReader::new(open_file);
        let config: Config = serde_yaml::from_reader(reader)?;
        Ok(config)
    }

    #[cfg(test)]
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn get_listen_address(&self) -> String {
        self.listen.clone().unwrap_or_else(|| "0.0.0.0:8080".to_string())
    }

    pub fn get_working_dir(&self) -> String {
        self.working_dir.clone().unwrap_or_else(|| "./".to_string())
    }

    pub fn get_request_timeout(&self) -> Duration {
        let seconds = self.request_timeout.as_deref()
            .map(Self::parse_interval)
            .unwrap_or(60);
        Duration::from_secs(seconds)
    }

    pub fn get_geotab_server(&self) -> String {
        self.geotab.as_ref()
            .and_then(|g| g.server.clone())
            .unwrap_or_else(|| "my.geotab.com".to_string())
    }

    pub fn get_rate_limit(&self) -> (usize, Duration) {
        let requests = self.rate_limit.as_ref().and_then(|r| r.requests).unwrap_or(30);
        let window = self.rate_limit.as_ref()
            .and_then(|r| r.window.as_deref())
            .map(Self::parse_interval)
            .unwrap_or(60);
        (requests, Duration::from_secs(window))
    }

    pub fn get_usage_path(&self) -> Option<String> {
        self.usage.as_ref().and_then(|u| u.path.clone()).filter(|p| !p.is_empty())
    }

    pub(crate) fn parse_interval(s: &str) -> u64 {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('s') {
            n.parse().unwrap_or(60)
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>().unwrap_or(1) * 60
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>().unwrap_or(1) * 3600
        } else {
            s.parse().unwrap_or(60)  // Assume seconds if no unit
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct LogSubConfig {
    pub path: String,
    pub debug: bool,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct GeotabSubConfig {
    pub server: Option<String>,  // e.g. "my.geotab.com"
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ExchangeSubConfig {
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: Option<String>,  // Fallback when a client has no tenant secret
    #[serde(rename = "certificatePath")]
    pub certificate_path: Option<String>,
    #[serde(rename = "privateKeyPath")]
    pub private_key_path: Option<String>,
    #[serde(rename = "apiType")]
    pub api_type: Option<String>,  // commercial, gcc, gcc-high
    #[serde(rename = "loginUrl")]
    pub login_url: Option<String>,
    #[serde(rename = "adminUrl")]
    pub admin_url: Option<String>,
}

impl ExchangeSubConfig {
    /// Returns (login endpoint, Exchange admin endpoint). Explicit URLs override the apiType.
    pub fn get_endpoints(&self) -> Result<(String, String), ConfigError> {
        let api_type = self.api_type.as_deref().unwrap_or("commercial");
        let (login, admin) = match api_type {
            "commercial" | "gcc" => (
                "https://login.microsoftonline.com",
                "https://outlook.office365.com"
            ),
            "gcc-high" => (
                "https://login.microsoftonline.us",
                "https://outlook.office365.us"
            ),
            _ => return Err(ConfigError::InvalidApiType(api_type.to_string()))
        };
        Ok((
            self.login_url.clone().unwrap_or_else(|| login.to_string()),
            self.admin_url.clone().unwrap_or_else(|| admin.to_string()),
        ))
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct SecretsSubConfig {
    pub dir: Option<String>,  // One file per secret, named after the secret
    #[serde(default)]
    pub values: HashMap<String, String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct SyncSubConfig {
    #[serde(rename = "equipmentDomain")]
    pub equipment_domain: Option<String>,
    #[serde(rename = "defaultTimezone")]
    pub default_timezone: Option<String>,
    #[serde(rename = "policyId")]
    pub policy_id: Option<String>,
    #[serde(rename = "fleetManagerAccess")]
    pub fleet_manager_access: Option<String>,
    #[serde(rename = "calendarDefaultAccess")]
    pub calendar_default_access: Option<String>,
    #[serde(rename = "workingHours")]
    pub working_hours: Option<WorkingHoursSubConfig>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WorkingHoursSubConfig {
    pub start: Option<String>,  // e.g. "07:00:00"
    pub end: Option<String>,
    #[serde(rename = "workDays")]
    pub work_days: Option<String>,  // e.g. "Weekdays"
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct RateLimitSubConfig {
    pub requests: Option<usize>,
    pub window: Option<String>,
    #[serde(rename = "maxClients")]
    pub max_clients: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct UsageSubConfig {
    pub path: Option<String>,
}
