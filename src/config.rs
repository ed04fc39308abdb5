use crate::auth::DEFAULT_MAX_SKEW;
use crate::http_api::DEFAULT_BODY_LIMIT;
use crate::jobs::DEFAULT_JOB_RETENTION;
use crate::rate_limit::{DEFAULT_SWEEP_INTERVAL, RateLimitConfig};
use crate::worker_pool::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_GRACE, DEFAULT_WORKERS, PoolConfig,
};
use std::env;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

// Environment variable names (external interface).
pub const ENV_PORT: &str = "CLOUD_UPDATE_PORT";
pub const ENV_SECRET: &str = "CLOUD_UPDATE_SECRET";
pub const ENV_LOG_LEVEL: &str = "CLOUD_UPDATE_LOG_LEVEL";
pub const ENV_LOG_FILE: &str = "CLOUD_UPDATE_LOG_FILE";
pub const ENV_TLS_ENABLED: &str = "CLOUD_UPDATE_TLS_ENABLED";
pub const ENV_TLS_CERT: &str = "CLOUD_UPDATE_TLS_CERT";
pub const ENV_TLS_KEY: &str = "CLOUD_UPDATE_TLS_KEY";
pub const ENV_TLS_AUTO: &str = "CLOUD_UPDATE_TLS_AUTO";
pub const ENV_DOMAIN: &str = "CLOUD_UPDATE_DOMAIN";

pub const SERVICE_NAME: &str = "cloud-update";
pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_LOG_FILE: &str = "/var/log/cloud-update/cloud-update.log";
pub const DEFAULT_TLS_CERT: &str = "/etc/cloud-update/tls/cert.pem";
pub const DEFAULT_TLS_KEY: &str = "/etc/cloud-update/tls/key.pem";
const WEAK_SECRET_LEN: usize = 16;
const DEFAULT_JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("CLOUD_UPDATE_SECRET is required and must not be empty")]
    MissingSecret,
    #[error("invalid CLOUD_UPDATE_PORT: {0}")]
    InvalidPort(String),
    #[error("invalid CLOUD_UPDATE_LOG_LEVEL: {0}")]
    InvalidLogLevel(String),
    #[error("invalid boolean for {name}: {value}")]
    InvalidBool { name: &'static str, value: String },
    #[error("CLOUD_UPDATE_DOMAIN is required when CLOUD_UPDATE_TLS_AUTO is set")]
    MissingDomain,
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        "config_invalid"
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TlsMode {
    Disabled,
    Manual { cert_path: PathBuf, key_path: PathBuf },
    /// Certificate issuance is not implemented; served as plain HTTP.
    Auto { domain: String },
}

/// Daemon configuration, immutable after load.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub secret: Vec<u8>,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub tls: TlsMode,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("secret", &"<redacted>")
            .field("log_level", &self.log_level)
            .field("log_file", &self.log_file)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup(ENV_PORT) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
            _ => DEFAULT_PORT,
        };

        let secret = lookup(ENV_SECRET)
            .filter(|raw| !raw.trim().is_empty())
            .ok_or(ConfigError::MissingSecret)?
            .into_bytes();

        let log_level = match lookup(ENV_LOG_LEVEL) {
            Some(raw) if !raw.trim().is_empty() => {
                LogLevel::parse(&raw).ok_or(ConfigError::InvalidLogLevel(raw))?
            }
            _ => LogLevel::Info,
        };

        // Set but empty disables the file sink.
        let log_file = match lookup(ENV_LOG_FILE) {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        };

        let tls_enabled = env_bool(&lookup, ENV_TLS_ENABLED)?;
        let tls_auto = env_bool(&lookup, ENV_TLS_AUTO)?;
        let tls = if tls_auto {
            let domain = lookup(ENV_DOMAIN)
                .map(|raw| raw.trim().to_string())
                .filter(|domain| !domain.is_empty())
                .ok_or(ConfigError::MissingDomain)?;
            TlsMode::Auto { domain }
        } else if tls_enabled {
            TlsMode::Manual {
                cert_path: path_or(&lookup, ENV_TLS_CERT, DEFAULT_TLS_CERT),
                key_path: path_or(&lookup, ENV_TLS_KEY, DEFAULT_TLS_KEY),
            }
        } else {
            TlsMode::Disabled
        };

        Ok(Self {
            port,
            secret,
            log_level,
            log_file,
            tls,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn secret_is_weak(&self) -> bool {
        self.secret.len() < WEAK_SECRET_LEN
    }
}

fn env_bool<F>(lookup: &F, name: &'static str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { name, value: raw }),
    }
}

fn path_or<F>(lookup: &F, name: &str, default: &str) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Runtime tunables that are not exposed through the environment.
#[derive(Clone, Copy, Debug)]
pub struct ServerSettings {
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub max_skew: Duration,
    pub job_retention: Duration,
    pub job_sweep_interval: Duration,
    pub limiter_sweep_interval: Duration,
    pub body_limit: usize,
    pub drain_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            pool: PoolConfig {
                workers: DEFAULT_WORKERS,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            rate_limit: RateLimitConfig::default(),
            max_skew: DEFAULT_MAX_SKEW,
            job_retention: DEFAULT_JOB_RETENTION,
            job_sweep_interval: DEFAULT_JOB_SWEEP_INTERVAL,
            limiter_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            body_limit: DEFAULT_BODY_LIMIT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
