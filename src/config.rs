//! Process configuration for the relay server.
//!
//! Values come from the environment, optionally seeded from a `.env` file.
//! Validation happens once at startup; a missing credential is fatal.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::ai::DEFAULT_API_BASE;

pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";
pub const PORT_VAR: &str = "PORT";
pub const MODEL_VAR: &str = "MODEL_ID";
pub const API_BASE_VAR: &str = "GEMINI_API_BASE";
pub const STATIC_DIR_VAR: &str = "STATIC_DIR";

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing {0} environment variable.")]
    MissingCredential(&'static str),

    #[error("Invalid PORT value `{0}`: expected a port number")]
    InvalidPort(String),
}

#[derive(Clone)]
pub struct RelayConfig {
    pub api_key: String,
    pub port: u16,
    pub default_model: String,
    pub api_base: String,
    pub static_dir: Option<PathBuf>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_key = get(API_KEY_VAR).ok_or(ConfigError::MissingCredential(API_KEY_VAR))?;
        let port = match get(PORT_VAR) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            api_key,
            port,
            default_model: get(MODEL_VAR).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_base: get(API_BASE_VAR).unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            static_dir: get(STATIC_DIR_VAR).map(PathBuf::from),
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_key", &"<redacted>")
            .field("port", &self.port)
            .field("default_model", &self.default_model)
            .field("api_base", &self.api_base)
            .field("static_dir", &self.static_dir)
            .finish()
    }
}

/// Load `.env` from the working directory (or a parent) if there is one.
/// Existing environment variables win over the file.
pub fn load_dotenv() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn missing_credential_is_fatal() {
        assert_eq!(
            RelayConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::MissingCredential(API_KEY_VAR)
        );
        assert_eq!(
            RelayConfig::from_lookup(lookup(&[(API_KEY_VAR, "   ")])).unwrap_err(),
            ConfigError::MissingCredential(API_KEY_VAR)
        );
    }

    #[test]
    fn applies_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[(API_KEY_VAR, "secret")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.default_model, DEFAULT_MODEL);
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert!(config.static_dir.is_none());
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn reads_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            (API_KEY_VAR, "secret"),
            (PORT_VAR, "8080"),
            (MODEL_VAR, "gemini-2.5-pro"),
            (STATIC_DIR_VAR, "public"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr().port(), 8080);
        assert_eq!(config.default_model, "gemini-2.5-pro");
        assert_eq!(config.static_dir, Some(PathBuf::from("public")));
    }

    #[test]
    fn rejects_bad_port() {
        assert_eq!(
            RelayConfig::from_lookup(lookup(&[(API_KEY_VAR, "k"), (PORT_VAR, "http")]))
                .unwrap_err(),
            ConfigError::InvalidPort("http".to_string())
        );
    }
}
