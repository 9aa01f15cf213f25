//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PORTICO_CONFIG)
//! 3. Environment variables

use crate::error::ServerError;
use crate::server::{BindRetry, ServerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable per-server settings: where to listen and what to call it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to. `None` binds the wildcard address.
    pub bind_address: Option<String>,
    /// Port to listen on. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Descriptive protocol label, used in logs only.
    pub protocol: String,
    /// Whether accepted connections are TLS-wrapped.
    pub secure: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: 0,
            protocol: "tcp".to_string(),
            secure: false,
        }
    }
}

impl ServerSettings {
    pub fn new(protocol: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the bind address.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = Some(addr.into());
        self
    }

    /// Sets the secure flag.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// Bind retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindRetryConfig {
    /// Maximum bind attempts before giving up.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for BindRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            delay_ms: 10,
        }
    }
}

impl BindRetryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(attempts) = std::env::var("PORTICO_BIND_RETRY_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.max_attempts = n;
            }
        }

        if let Ok(delay) = std::env::var("PORTICO_BIND_RETRY_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.delay_ms = ms;
            }
        }
    }

    /// Returns the retry delay as a Duration.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Returns the runtime retry policy.
    pub fn bind_retry(&self) -> BindRetry {
        BindRetry {
            max_attempts: self.max_attempts,
            delay: self.delay(),
        }
    }
}

/// TLS configuration, consulted when the secure flag is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PORTICO_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PORTICO_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("PORTICO_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = require == "1" || require.to_lowercase() == "true";
        }
        if let Ok(path) = std::env::var("PORTICO_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration against the secure flag.
    pub fn validate(&self, secure: bool) -> Result<(), ConfigError> {
        if !secure {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "secure enabled but tls.cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "secure enabled but tls.key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but tls.client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen settings.
    pub server: ServerSettings,
    /// Bind retry policy.
    pub bind_retry: BindRetryConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable
    /// overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PORTICO_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PORTICO_BIND") {
            if !addr.is_empty() {
                self.server.bind_address = Some(addr);
            }
        }
        if let Ok(port) = std::env::var("PORTICO_PORT") {
            if let Ok(n) = port.parse() {
                self.server.port = n;
            }
        }
        if let Ok(protocol) = std::env::var("PORTICO_PROTOCOL") {
            if !protocol.is_empty() {
                self.server.protocol = protocol;
            }
        }
        if let Ok(secure) = std::env::var("PORTICO_SECURE") {
            self.server.secure = secure == "1" || secure.to_lowercase() == "true";
        }

        self.bind_retry.apply_env_overrides();
        self.tls.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tls.validate(self.server.secure)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Builds the runtime server configuration, creating the TLS acceptor
    /// when the secure flag is set.
    pub fn server_config(&self) -> Result<ServerConfig, ServerError> {
        self.validate()?;

        let mut config = ServerConfig::new(self.server.clone())
            .with_bind_retry(self.bind_retry.bind_retry());
        if self.server.secure {
            config = config.with_tls(crate::tls::create_tls_acceptor(&self.tls)?);
        }
        Ok(config)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 0);
        assert!(config.server.bind_address.is_none());
        assert!(!config.server.secure);
        assert_eq!(config.bind_retry.max_attempts, 25);
        assert_eq!(config.bind_retry.delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_settings_builder() {
        let settings = ServerSettings::new("smtp", 3025)
            .with_bind_address("127.0.0.1")
            .with_secure(true);
        assert_eq!(settings.protocol, "smtp");
        assert_eq!(settings.port, 3025);
        assert_eq!(settings.bind_address.as_deref(), Some("127.0.0.1"));
        assert!(settings.secure);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.server = ServerSettings::new("imap", 3143).with_bind_address("::1");
        config.bind_retry.max_attempts = 5;

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.protocol, "imap");
        assert_eq!(parsed.server.port, 3143);
        assert_eq!(parsed.server.bind_address.as_deref(), Some("::1"));
        assert_eq!(parsed.bind_retry.max_attempts, 5);
    }

    #[test]
    fn test_validate_secure_requires_cert_and_key() {
        let mut config = Config::default();
        config.server.secure = true;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cert_path"));

        config.tls.cert_path = Some("/some/cert.pem".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_path"));

        config.tls.key_path = Some("/some/key.pem".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_mtls_requires_client_ca() {
        let mut config = Config::default();
        config.server.secure = true;
        config.tls.cert_path = Some("/some/cert.pem".into());
        config.tls.key_path = Some("/some/key.pem".into());
        config.tls.require_client_cert = true;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_ca_path"));
    }

    #[test]
    fn test_insecure_config_skips_tls_validation() {
        let config = Config::default();
        config.validate().unwrap();
    }
}
