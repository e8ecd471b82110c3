use std::{env, num::ParseIntError};

use thiserror::Error;

use crate::MqttClientConfig;

pub const ENV_HOST: &str = "MQTT_HOST";
pub const ENV_PORT: &str = "MQTT_PORT";
pub const ENV_USER: &str = "MQTT_USER";
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("Invalid {ENV_PORT} value {value:?}: {source}")]
    InvalidPort {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Error loading .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
}

/// Broker connection settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Host and port must be non-empty; user and password
    /// must be present but may be empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));
        let non_empty = |key: &'static str| {
            required(key).and_then(|v| {
                if v.trim().is_empty() {
                    Err(ConfigError::Missing(key))
                } else {
                    Ok(v)
                }
            })
        };

        let host = non_empty(ENV_HOST)?;
        let port_value = non_empty(ENV_PORT)?;
        let port = port_value
            .trim()
            .parse::<u16>()
            .map_err(|source| ConfigError::InvalidPort {
                value: port_value.clone(),
                source,
            })?;

        Ok(Self {
            host,
            port,
            username: required(ENV_USER)?,
            password: required(ENV_PASSWORD)?,
        })
    }

    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn mqtt_client_config(&self) -> MqttClientConfig {
        MqttClientConfig::new(self.host.clone())
            .port(self.port)
            .username(self.username.clone())
            .password(self.password.clone())
    }
}

/// Load `.env` from the working directory or its parents. A missing file is not an error.
pub fn load_dotenv() -> Result<(), ConfigError> {
    match dotenvy::dotenv() {
        Ok(path) => {
            log::debug!("Loaded environment from {}", path.display());
            Ok(())
        }
        Err(err) if err.not_found() => {
            log::debug!("No .env file found, using process environment");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Host name of this machine, or `"unknown"` if it cannot be read.
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            log::error!("Failed to get hostname: {err}");
            "unknown".to_owned()
        }
    }
}
