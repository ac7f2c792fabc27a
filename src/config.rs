//! Application settings loaded from environment variables.
//!
//! Every option can be set through the environment (a `.env` file is read at
//! startup when present). List-valued options accept either a comma-separated
//! string (`a,b,c`) or a JSON array (`["a","b","c"]`).

use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    // Application
    pub app_name: String,
    pub debug: bool,
    pub log_level: String,

    // Server
    pub host: String,
    pub port: u16,

    // Security
    pub auth_required: bool,
    pub allowed_public_keys: Vec<String>,
    pub allowed_cors_origins: Vec<String>,
    pub max_request_size: usize,

    // Projects (empty = allow any)
    pub project_ids: Vec<u64>,

    // OpenSearch
    pub opensearch_hosts: Vec<String>,
    pub opensearch_username: Option<String>,
    pub opensearch_password: Option<String>,
    pub opensearch_index_prefix: String,
    pub opensearch_use_ssl: bool,
    pub opensearch_verify_certs: bool,
    pub opensearch_ca_certs: Option<String>,

    // Processing
    pub batch_size: usize,
    pub batch_timeout_seconds: u64,
    pub use_celery: bool,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: u64,

    // Enrichment
    pub geoip_database_path: Option<String>,
    pub enable_geoip: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "sentrel".to_string(),
            debug: false,
            log_level: "INFO".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            auth_required: true,
            allowed_public_keys: Vec::new(),
            allowed_cors_origins: Vec::new(),
            max_request_size: 5 * 1024 * 1024,
            project_ids: Vec::new(),
            opensearch_hosts: vec!["http://localhost:9200".to_string()],
            opensearch_username: None,
            opensearch_password: None,
            opensearch_index_prefix: "sentry-events".to_string(),
            opensearch_use_ssl: false,
            opensearch_verify_certs: true,
            opensearch_ca_certs: None,
            batch_size: 100,
            batch_timeout_seconds: 5,
            use_celery: true,
            rate_limit_enabled: true,
            rate_limit_requests: 1000,
            rate_limit_window: 60,
            geoip_database_path: None,
            enable_geoip: false,
        }
    }
}

impl Settings {
    /// Load settings from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut s = Settings::default();

        if let Some(v) = read("APP_NAME") {
            s.app_name = v;
        }
        if let Some(v) = read("DEBUG") {
            s.debug = parse_bool("DEBUG", &v)?;
        }
        if let Some(v) = read("LOG_LEVEL") {
            s.log_level = v;
        }
        if let Some(v) = read("HOST") {
            s.host = v;
        }
        if let Some(v) = read("PORT") {
            s.port = parse_num("PORT", &v)?;
        }
        if let Some(v) = read("AUTH_REQUIRED") {
            s.auth_required = parse_bool("AUTH_REQUIRED", &v)?;
        }
        if let Some(v) = read("ALLOWED_PUBLIC_KEYS") {
            s.allowed_public_keys = parse_list(&v);
        }
        if let Some(v) = read("ALLOWED_CORS_ORIGINS") {
            s.allowed_cors_origins = parse_list(&v);
        }
        if let Some(v) = read("MAX_REQUEST_SIZE") {
            s.max_request_size = parse_num("MAX_REQUEST_SIZE", &v)?;
        }
        if let Some(v) = read("PROJECT_IDS") {
            s.project_ids = parse_int_list("PROJECT_IDS", &v)?;
        }
        if let Some(v) = read("OPENSEARCH_HOSTS") {
            let hosts = parse_list(&v);
            if !hosts.is_empty() {
                s.opensearch_hosts = hosts;
            }
        }
        s.opensearch_username = read("OPENSEARCH_USERNAME");
        s.opensearch_password = read("OPENSEARCH_PASSWORD");
        if let Some(v) = read("OPENSEARCH_INDEX_PREFIX") {
            s.opensearch_index_prefix = v;
        }
        if let Some(v) = read("OPENSEARCH_USE_SSL") {
            s.opensearch_use_ssl = parse_bool("OPENSEARCH_USE_SSL", &v)?;
        }
        if let Some(v) = read("OPENSEARCH_VERIFY_CERTS") {
            s.opensearch_verify_certs = parse_bool("OPENSEARCH_VERIFY_CERTS", &v)?;
        }
        s.opensearch_ca_certs = read("OPENSEARCH_CA_CERTS");
        if let Some(v) = read("BATCH_SIZE") {
            s.batch_size = parse_num("BATCH_SIZE", &v)?;
        }
        if let Some(v) = read("BATCH_TIMEOUT_SECONDS") {
            s.batch_timeout_seconds = parse_num("BATCH_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = read("USE_CELERY") {
            s.use_celery = parse_bool("USE_CELERY", &v)?;
        }
        if let Some(v) = read("RATE_LIMIT_ENABLED") {
            s.rate_limit_enabled = parse_bool("RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = read("RATE_LIMIT_REQUESTS") {
            s.rate_limit_requests = parse_num("RATE_LIMIT_REQUESTS", &v)?;
        }
        if let Some(v) = read("RATE_LIMIT_WINDOW") {
            s.rate_limit_window = parse_num("RATE_LIMIT_WINDOW", &v)?;
        }
        s.geoip_database_path = read("GEOIP_DATABASE_PATH");
        if let Some(v) = read("ENABLE_GEOIP") {
            s.enable_geoip = parse_bool("ENABLE_GEOIP", &v)?;
        }

        Ok(s)
    }

    /// True when the given project is accepted (empty list = allow any).
    pub fn project_allowed(&self, project_id: u64) -> bool {
        self.project_ids.is_empty() || self.project_ids.contains(&project_id)
    }
}

fn read(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a list of strings from either a JSON array or a comma-separated string.
fn parse_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_int_list(name: &'static str, value: &str) -> Result<Vec<u64>, ConfigError> {
    let trimmed = value.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<u64>>(trimmed) {
            return Ok(items);
        }
    }
    let mut out = Vec::new();
    for part in trimmed.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.push(parse_num::<u64>(name, part)?);
    }
    Ok(out)
}
