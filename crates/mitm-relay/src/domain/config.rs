//! Relay configuration types.
//!
//! [`RelayConfig`] is the single source of truth for all runtime settings.
//! It is built from defaults, optionally overlaid with a TOML file, and then
//! with explicit CLI flags (see `main.rs`).
//!
//! Keeping configuration as a plain struct (no global state, no environment
//! variable reads inside the domain) lets tests build sessions with whatever
//! settings they need.
//!
//! # Example file
//!
//! ```toml
//! listen_addr = "0.0.0.0:19133"
//! upstream_addr = "203.0.113.7:19132"
//! idle_timeout_secs = 30
//! max_batch = 64
//! command_prefix = "!"
//! ```
//!
//! Every field is optional; missing fields keep their default.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// All runtime configuration for the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the game client connects to.
    pub listen_addr: SocketAddr,

    /// The real game server.
    pub upstream_addr: SocketAddr,

    /// A leg that delivers nothing for this long ends the session.
    pub idle_timeout_secs: u64,

    /// Give up dialling the upstream server after this long.
    pub connect_timeout_secs: u64,

    /// Most packets a leg writer packs into a single outgoing frame.
    pub max_batch: usize,

    /// Chat lines starting with this are treated as relay commands.
    pub command_prefix: String,

    /// `tracing` filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for RelayConfig {
    /// | Field                | Default           |
    /// |----------------------|-------------------|
    /// | listen_addr          | `0.0.0.0:19133`   |
    /// | upstream_addr        | `127.0.0.1:19132` |
    /// | idle_timeout_secs    | 30                |
    /// | connect_timeout_secs | 10                |
    /// | max_batch            | 64                |
    /// | command_prefix       | `!`               |
    /// | log_level            | `info`            |
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 19133)),
            upstream_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 19132)),
            idle_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_batch: 64,
            command_prefix: "!".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Parses a TOML document.  Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed or a field has
    /// the wrong type.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads and parses the file at `path`.
    ///
    /// Unlike an implicit default location, an explicitly named file must
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks values that would make the relay misbehave at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "max_batch",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "idle_timeout_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_timeout_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.command_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "command_prefix",
                reason: "must not be empty".to_string(),
            });
        }
        if self.listen_addr == self.upstream_addr {
            return Err(ConfigError::Invalid {
                field: "upstream_addr",
                reason: format!("relay would connect to itself at {}", self.listen_addr),
            });
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_port_is_19133() {
        // Arrange / Act
        let cfg = RelayConfig::default();
        // Assert
        assert_eq!(cfg.listen_addr.port(), 19133);
    }

    #[test]
    fn test_default_upstream_is_loopback_19132() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.upstream_addr.to_string(), "127.0.0.1:19132");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        // Arrange
        let toml = r#"
            upstream_addr = "10.0.0.5:19132"
            max_batch = 8
        "#;

        // Act
        let cfg = RelayConfig::from_toml_str(toml).unwrap();

        // Assert
        assert_eq!(cfg.upstream_addr.to_string(), "10.0.0.5:19132");
        assert_eq!(cfg.max_batch, 8);
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.command_prefix, "!");
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = RelayConfig::from_toml_str("max_batch = \"lots\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = RelayConfig::load(Path::new("/definitely/not/here/relay.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let cfg = RelayConfig {
            max_batch: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "max_batch", .. })
        ));
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let cfg = RelayConfig {
            idle_timeout_secs: 0,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_blank_prefix_rejected() {
        let cfg = RelayConfig {
            command_prefix: "  ".to_string(),
            ..RelayConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "command_prefix", .. })
        ));
    }

    #[test]
    fn test_self_loop_rejected() {
        let addr: SocketAddr = "127.0.0.1:19133".parse().unwrap();
        let cfg = RelayConfig {
            listen_addr: addr,
            upstream_addr: addr,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
