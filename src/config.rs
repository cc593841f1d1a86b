//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default on-disk database location.
pub const DEFAULT_DB_PATH: &str = "./data/chat-relay.db";

/// Default port for the HTTP API.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default number of unanswered messages re-dispatched during recovery.
pub const DEFAULT_RECOVERY_LIMIT: usize = 100;

/// Answering-service client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Endpoint the relay request is POSTed to.
    pub url: String,
    /// Per-call timeout. `None` leaves the HTTP client default in place.
    pub timeout: Option<Duration>,
}

/// Relay trigger configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Opaque credential forwarded as the `sender` field of every request.
    pub sender_credential: SecretString,
    /// Cap on unanswered messages handed to the trigger by one recovery pass.
    pub recovery_limit: usize,
}

impl RelayConfig {
    pub fn new(sender_credential: impl Into<String>) -> Self {
        Self {
            sender_credential: SecretString::from(sender_credential.into()),
            recovery_limit: DEFAULT_RECOVERY_LIMIT,
        }
    }
}

/// Full service configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub relay: RelayConfig,
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let url = required("RELAY_GATEWAY_URL")?;
        let credential = required("RELAY_SENDER_TOKEN")?;

        let timeout = get("RELAY_GATEWAY_TIMEOUT_SECS")
            .map(|raw| parse_number::<u64>("RELAY_GATEWAY_TIMEOUT_SECS", &raw))
            .transpose()?
            .map(Duration::from_secs);

        let http_port = get("RELAY_HTTP_PORT")
            .map(|raw| parse_number::<u16>("RELAY_HTTP_PORT", &raw))
            .transpose()?
            .unwrap_or(DEFAULT_HTTP_PORT);

        let recovery_limit = get("RELAY_RECOVERY_LIMIT")
            .map(|raw| parse_number::<usize>("RELAY_RECOVERY_LIMIT", &raw))
            .transpose()?
            .unwrap_or(DEFAULT_RECOVERY_LIMIT);

        let db_path = get("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        Ok(Self {
            gateway: GatewayConfig { url, timeout },
            relay: RelayConfig {
                recovery_limit,
                ..RelayConfig::new(credential)
            },
            db_path,
            http_port,
            log_dir: get("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
