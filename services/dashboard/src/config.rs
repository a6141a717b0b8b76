use reqwest::Url;
use std::time::Duration;
use tracing::Level;
use voice_dashboard_core::{
    SessionConfig,
    session::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDENTITY, DEFAULT_ROOM_NAME, DEFAULT_TOKEN_TIMEOUT},
};

/// WebSocket host handed to the loopback backend, which ignores it.
const LOOPBACK_WS_HOST: &str = "ws://loopback";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported media backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaBackend {
    LiveKit,
    Loopback,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub token_service_url: String,
    pub ws_host: String,
    pub media_backend: MediaBackend,
    pub room_name: String,
    pub identity: String,
    pub token_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None)
    }

    /// Like [`Config::from_env`], with `MEDIA_BACKEND` overridden by the caller.
    pub fn from_env_with(backend: Option<MediaBackend>) -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let token_service_url = std::env::var("TOKEN_SERVICE_URL")
            .map_err(|_| ConfigError::MissingVar("TOKEN_SERVICE_URL".to_string()))?;
        let parsed = Url::parse(&token_service_url).map_err(|e| {
            ConfigError::InvalidValue("TOKEN_SERVICE_URL".to_string(), e.to_string())
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue(
                "TOKEN_SERVICE_URL".to_string(),
                format!("'{}' is not an http(s) URL", token_service_url),
            ));
        }

        let media_backend = match backend {
            Some(backend) => backend,
            None => {
                let backend_str =
                    std::env::var("MEDIA_BACKEND").unwrap_or_else(|_| "livekit".to_string());
                match backend_str.to_lowercase().as_str() {
                    "livekit" => MediaBackend::LiveKit,
                    "loopback" => MediaBackend::Loopback,
                    other => {
                        return Err(ConfigError::InvalidValue(
                            "MEDIA_BACKEND".to_string(),
                            format!("'{}' is not one of 'livekit', 'loopback'", other),
                        ));
                    }
                }
            }
        };

        let ws_host = match (&media_backend, std::env::var("LIVEKIT_WS_HOST").ok()) {
            (_, Some(host)) if !host.is_empty() => host,
            (MediaBackend::Loopback, _) => LOOPBACK_WS_HOST.to_string(),
            (MediaBackend::LiveKit, _) => {
                return Err(ConfigError::MissingVar(
                    "LIVEKIT_WS_HOST must be set for the 'livekit' backend".to_string(),
                ));
            }
        };

        let room_name =
            std::env::var("ROOM_NAME").unwrap_or_else(|_| DEFAULT_ROOM_NAME.to_string());
        let identity =
            std::env::var("CALLER_IDENTITY").unwrap_or_else(|_| DEFAULT_IDENTITY.to_string());

        let token_timeout = secs_var("TOKEN_TIMEOUT_SECS", DEFAULT_TOKEN_TIMEOUT)?;
        let connect_timeout = secs_var("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            token_service_url,
            ws_host,
            media_backend,
            room_name,
            identity,
            token_timeout,
            connect_timeout,
            log_level,
        })
    }

    /// The controller settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            room_name: self.room_name.clone(),
            identity: self.identity.clone(),
            token_timeout: self.token_timeout,
            connect_timeout: self.connect_timeout,
            ..SessionConfig::new(self.ws_host.clone())
        }
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("'{}' is not a positive number of seconds", raw),
            )),
        },
    }
}
