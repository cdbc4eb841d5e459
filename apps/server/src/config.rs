//! Service configuration
//!
//! Sources, lowest precedence first: built-in defaults, an optional `wardline.toml` (or the file
//! named by `WARDLINE_CONFIG`), then `WARDLINE__SECTION__KEY` environment variables. A `.env`
//! file is loaded into the environment first.

use config::{Environment, File};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::models::MaxPolicy;
use crate::services::LockSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub occupancy: OccupancyConfig,
    pub stock: StockConfig,
    pub patients: PatientsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_body_size: usize,
    /// Allowed CORS origins; `*` allows any
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; when absent the in-memory store is used
    pub url: Option<String>,
    pub pool_max_size: u32,
    pub pool_min_size: u32,
    pub pool_timeout_seconds: u64,
    pub statement_timeout_seconds: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OccupancyConfig {
    pub lock_timeout_ms: u64,
    pub max_lock_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockConfig {
    /// Reject adjustments that would exceed an item's maximum instead of flagging them
    pub enforce_max: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientDirectoryMode {
    Open,
    Static,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatientsConfig {
    pub directory: PatientDirectoryMode,
    /// Known patient ids for the `static` directory
    pub known: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file_enabled: bool,
    pub file_directory: String,
    pub file_prefix: String,
    pub file_rotation: String,
    pub opentelemetry_enabled: bool,
    pub otlp_endpoint: String,
    pub otlp_timeout_seconds: u64,
    pub service_name: String,
    pub service_version: Option<String>,
    pub deployment_environment: String,
    pub trace_sample_ratio: f64,
}

impl Config {
    /// Load configuration from defaults, file and environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file = std::env::var("WARDLINE_CONFIG").unwrap_or_else(|_| "wardline".to_string());

        let settings = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.max_request_body_size", 1024 * 1024)?
            .set_default("server.cors_origins", Vec::<String>::new())?
            .set_default("database.pool_max_size", 10)?
            .set_default("database.pool_min_size", 1)?
            .set_default("database.pool_timeout_seconds", 30)?
            .set_default("database.statement_timeout_seconds", 30)?
            .set_default("database.run_migrations", true)?
            .set_default("occupancy.lock_timeout_ms", 2000)?
            .set_default("occupancy.max_lock_attempts", 3)?
            .set_default("stock.enforce_max", false)?
            .set_default("patients.directory", "open")?
            .set_default("patients.known", Vec::<String>::new())?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("logging.file_enabled", false)?
            .set_default("logging.file_directory", "logs")?
            .set_default("logging.file_prefix", "wardline")?
            .set_default("logging.file_rotation", "daily")?
            .set_default("logging.opentelemetry_enabled", false)?
            .set_default("logging.otlp_endpoint", "http://localhost:4317")?
            .set_default("logging.otlp_timeout_seconds", 10)?
            .set_default("logging.service_name", "wardline")?
            .set_default("logging.deployment_environment", "development")?
            .set_default("logging.trace_sample_ratio", 1.0)?
            .add_source(File::with_name(&file).required(false))
            .add_source(
                Environment::with_prefix("WARDLINE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .with_list_parse_key("patients.known")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must not be 0".to_string());
        }
        if self.server.max_request_body_size == 0 {
            return Err("server.max_request_body_size must be positive".to_string());
        }
        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err("database.url must be a postgres:// URL".to_string());
            }
        }
        if self.database.pool_min_size > self.database.pool_max_size {
            return Err("database.pool_min_size must not exceed pool_max_size".to_string());
        }
        if self.occupancy.lock_timeout_ms == 0 {
            return Err("occupancy.lock_timeout_ms must be positive".to_string());
        }
        if self.occupancy.max_lock_attempts == 0 {
            return Err("occupancy.max_lock_attempts must be at least 1".to_string());
        }
        if self.patients.directory == PatientDirectoryMode::Static && self.patients.known.is_empty()
        {
            return Err("patients.known must list patients for the static directory".to_string());
        }
        if !(0.0..=1.0).contains(&self.logging.trace_sample_ratio) {
            return Err("logging.trace_sample_ratio must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.server.host.parse()?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings::new(
            Duration::from_millis(self.occupancy.lock_timeout_ms),
            self.occupancy.max_lock_attempts,
        )
    }

    pub fn max_policy(&self) -> MaxPolicy {
        MaxPolicy::from_enforce_flag(self.stock.enforce_max)
    }
}

impl Default for Config {
    /// In-memory configuration used by tests and embedded setups.
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_request_body_size: 1024 * 1024,
                cors_origins: Vec::new(),
            },
            database: DatabaseConfig {
                url: None,
                pool_max_size: 10,
                pool_min_size: 1,
                pool_timeout_seconds: 30,
                statement_timeout_seconds: 30,
                run_migrations: true,
            },
            occupancy: OccupancyConfig {
                lock_timeout_ms: 2000,
                max_lock_attempts: 3,
            },
            stock: StockConfig { enforce_max: false },
            patients: PatientsConfig {
                directory: PatientDirectoryMode::Open,
                known: Vec::new(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
                file_enabled: false,
                file_directory: "logs".to_string(),
                file_prefix: "wardline".to_string(),
                file_rotation: "daily".to_string(),
                opentelemetry_enabled: false,
                otlp_endpoint: "http://localhost:4317".to_string(),
                otlp_timeout_seconds: 10,
                service_name: "wardline".to_string(),
                service_version: None,
                deployment_environment: "development".to_string(),
                trace_sample_ratio: 1.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_settings().timeout, Duration::from_millis(2000));
        assert_eq!(config.lock_settings().max_attempts, 3);
        assert_eq!(config.max_policy(), MaxPolicy::Advisory);
        assert!(config.server.cors_origins.is_empty());
    }

    #[test]
    fn static_directory_needs_patients() {
        let mut config = Config::default();
        config.patients.directory = PatientDirectoryMode::Static;
        assert!(config.validate().is_err());
        config.patients.known = vec!["P1".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_postgres_url_is_rejected() {
        let mut config = Config::default();
        config.database.url = Some("mysql://localhost/wards".to_string());
        assert!(config.validate().is_err());
    }
}
