use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use url::Url;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://fitness.db?mode=rwc";
pub const DEFAULT_IDENTITY_BASE_URL: &str = "http://127.0.0.1:8081/";
pub const DEFAULT_ACTIVITY_QUEUE: &str = "activity.queue";

const DEFAULT_IDENTITY_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_LISTENER_WORKERS: usize = 2;
const DEFAULT_LISTENER_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LISTENER_LEASE_SECS: u64 = 30;
const DEFAULT_LISTENER_POLL_MS: u64 = 500;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Settings for the outbound identity service client.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

/// Settings for the activity consumer workers.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub queue: String,
    pub workers: usize,
    pub max_attempts: u32,
    pub lease: Duration,
    pub poll_interval: Duration,
}

/// Runtime configuration resolved from environment variables.
///
/// Read once at startup; every component receives a clone and never writes back.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub identity: IdentityConfig,
    pub listener: ListenerConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let identity = IdentityConfig {
            base_url: read_base_url("IDENTITY_BASE_URL", DEFAULT_IDENTITY_BASE_URL)?,
            timeout: Duration::from_millis(read_positive(
                "IDENTITY_TIMEOUT_MS",
                DEFAULT_IDENTITY_TIMEOUT_MS,
            )?),
        };

        let workers = read_positive("LISTENER_WORKERS", DEFAULT_LISTENER_WORKERS)?;
        let max_attempts = read_positive("LISTENER_MAX_ATTEMPTS", DEFAULT_LISTENER_MAX_ATTEMPTS)?;

        let listener = ListenerConfig {
            queue: env::var("ACTIVITY_QUEUE").unwrap_or_else(|_| DEFAULT_ACTIVITY_QUEUE.to_string()),
            workers,
            max_attempts,
            lease: Duration::from_secs(read_number(
                "LISTENER_LEASE_SECS",
                DEFAULT_LISTENER_LEASE_SECS,
            )?),
            poll_interval: Duration::from_millis(read_number(
                "LISTENER_POLL_MS",
                DEFAULT_LISTENER_POLL_MS,
            )?),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            identity,
            listener,
        })
    }
}

fn read_number<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(default),
    }
}

fn read_positive<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + ToString,
{
    let value = read_number(var, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        });
    }
    Ok(value)
}

// Endpoint paths are appended segment by segment, so a trailing slash keeps
// a base path such as `/identity/` intact.
fn read_base_url(var: &'static str, default: &str) -> Result<Url, ConfigError> {
    let mut value = env::var(var).unwrap_or_else(|_| default.to_string());
    if !value.ends_with('/') {
        value.push('/');
    }
    let url = Url::parse(&value).map_err(|source| ConfigError::InvalidUrl { var, source })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            var,
            source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
        });
    }
    Ok(url)
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    InvalidNumber {
        var: &'static str,
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidUrl { var, source } => write!(f, "invalid {var} value: {source}"),
            Self::InvalidNumber { var, value } => {
                write!(f, "{var} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BIND_ADDR;

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "IDENTITY_BASE_URL",
        "IDENTITY_TIMEOUT_MS",
        "ACTIVITY_QUEUE",
        "LISTENER_WORKERS",
        "LISTENER_MAX_ATTEMPTS",
        "LISTENER_LEASE_SECS",
        "LISTENER_POLL_MS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.identity.base_url.as_str(), DEFAULT_IDENTITY_BASE_URL);
        assert_eq!(config.identity.timeout, Duration::from_secs(2));
        assert_eq!(config.listener.queue, "activity.queue");
        assert_eq!(config.listener.workers, 2);
        assert_eq!(config.listener.max_attempts, 5);
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn parses_production_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("IDENTITY_BASE_URL", "http://userservice:8081");
        env::set_var("LISTENER_WORKERS", "8");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.identity.base_url.as_str(), "http://userservice:8081/");
        assert_eq!(config.listener.workers, 8);

        clear_env();
    }

    #[test]
    fn rejects_non_numeric_timeout() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("IDENTITY_TIMEOUT_MS", "soon");

        let err = AppConfig::from_env().expect_err("non-numeric timeout should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { var: "IDENTITY_TIMEOUT_MS", ref value } if value == "soon"
        ));

        clear_env();
    }

    #[test]
    fn rejects_zero_workers() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("LISTENER_WORKERS", "0");

        let err = AppConfig::from_env().expect_err("zero workers should error");
        assert!(matches!(err, ConfigError::InvalidNumber { var: "LISTENER_WORKERS", .. }));

        clear_env();
    }

    #[test]
    fn rejects_zero_identity_timeout() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("IDENTITY_TIMEOUT_MS", "0");

        let err = AppConfig::from_env().expect_err("zero timeout should error");
        assert!(matches!(err, ConfigError::InvalidNumber { var: "IDENTITY_TIMEOUT_MS", .. }));

        clear_env();
    }

    #[test]
    fn rejects_invalid_identity_url() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("IDENTITY_BASE_URL", "not a url");

        let err = AppConfig::from_env().expect_err("invalid url should error");
        assert!(matches!(err, ConfigError::InvalidUrl { var: "IDENTITY_BASE_URL", .. }));

        clear_env();
    }
}
