use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use parley_gateway::dispatcher::DEFAULT_QUEUE_CAPACITY;

/// JWT secrets shipped in sample `.env` files; never accepted.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PARLEY_JWT_SECRET is unset or still a placeholder")]
    MissingSecret,

    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub fanout_queue: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = var("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::MissingSecret);
        }

        let db_path = var("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()).into();
        let host = var("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_or(&var, "PARLEY_PORT", 3000)?;
        let fanout_queue = parse_or(&var, "PARLEY_FANOUT_QUEUE", DEFAULT_QUEUE_CAPACITY)?;
        if fanout_queue == 0 {
            return Err(ConfigError::Invalid {
                name: "PARLEY_FANOUT_QUEUE",
                value: "0".into(),
            });
        }

        Ok(Self {
            jwt_secret,
            db_path,
            host,
            port,
            fanout_queue,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|_| ConfigError::Invalid {
            name: "PARLEY_HOST",
            value: raw,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = ServerConfig::from_lookup(lookup(&[("PARLEY_JWT_SECRET", "a-real-secret")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("parley.db"));
        assert_eq!(config.port, 3000);
        assert_eq!(config.fanout_queue, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn placeholder_secrets_are_refused() {
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingSecret)
        ));
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[("PARLEY_JWT_SECRET", "dev-secret-change-me")])),
            Err(ConfigError::MissingSecret)
        ));
    }

    #[test]
    fn bad_numbers_name_the_variable() {
        let err = ServerConfig::from_lookup(lookup(&[("PARLEY_JWT_SECRET", "s"), ("PARLEY_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PARLEY_PORT", .. }));
    }
}
