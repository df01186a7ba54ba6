//! Core configuration
//!
//! TOML-based configuration for the broker core. Only knobs the core itself
//! consumes live here; transport and bootstrap settings belong to the host
//! process.

use std::time::Duration;

use serde::Deserialize;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "config parse error: {}", e),
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Broker core configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Read timeout bounding the idle-eviction sweep
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Per-session bound on in-flight QoS 1/2 message ids
    pub max_inflight: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(90),
            max_inflight: 1024,
        }
    }
}

impl CoreConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "max_inflight must be at least 1".to_string(),
            ));
        }
        // Message ids are 16-bit with id 0 reserved; the bound must leave
        // at least one id free or allocation cannot terminate
        if self.max_inflight > 65534 {
            return Err(ConfigError::Validation(
                "max_inflight cannot exceed 65534".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "read_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(90));
        assert_eq!(config.max_inflight, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config = CoreConfig::from_toml_str(
            r#"
            read_timeout = "2m"
            max_inflight = 256
            "#,
        )
        .unwrap();
        assert_eq!(config.read_timeout, Duration::from_secs(120));
        assert_eq!(config.max_inflight, 256);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoreConfig::from_toml_str(r#"max_inflight = 8"#).unwrap();
        assert_eq!(config.max_inflight, 8);
        assert_eq!(config.read_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(CoreConfig::from_toml_str("max_inflight = 0").is_err());
        // 65535 would fill the whole id space and wedge allocation
        assert!(CoreConfig::from_toml_str("max_inflight = 65535").is_err());
        assert!(CoreConfig::from_toml_str("max_inflight = 100000").is_err());
        assert!(CoreConfig::from_toml_str(r#"read_timeout = "0s""#).is_err());
        assert!(CoreConfig::from_toml_str("unknown_knob = true").is_err());
    }
}
