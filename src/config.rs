//! Bridge configuration using Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config bridge.toml`)
//! 3. Environment variables prefixed `MCPHA_`, nested with `__`
//!    (`MCPHA_ACQUISITION__POLL_INTERVAL_MS=500`)
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:4567"
//!
//! [device]
//! host = "192.168.1.100"
//! port = 1001
//! sample_rate = 4
//! pha_min_threshold = 300
//!
//! [acquisition]
//! poll_interval_ms = 1000
//! default_time_secs = 60
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use crate::acquisition::DEFAULT_POLL_INTERVAL_MS;
use crate::device::link::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS};
use crate::device::{DeviceLink, DeviceProfile};
use crate::error::{BridgeError, BridgeResult};
use crate::logging::{parse_log_level, LoggingConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MCPHA_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Client listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Instrument connection.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Acquisition polling.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Log level and format.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]`: client-facing listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` for client connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:4567".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// `[device]`: instrument connection and initialization profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Connect on startup when both `host` and `port` are set.
    #[serde(default)]
    pub host: Option<String>,
    /// Device TCP port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Response read timeout in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Written to the device after every fresh connection.
    #[serde(flatten)]
    pub profile: DeviceProfile,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            profile: DeviceProfile::default(),
        }
    }
}

impl DeviceConfig {
    /// A disconnected link with the configured timeouts.
    pub fn link(&self) -> DeviceLink {
        DeviceLink::new(
            Duration::from_millis(self.connect_timeout_ms),
            Duration::from_millis(self.read_timeout_ms),
        )
    }

    /// `(host, port)` to connect to on startup, if configured.
    pub fn auto_connect(&self) -> Option<(&str, u16)> {
        Some((self.host.as_deref()?, self.port?))
    }
}

/// `[acquisition]`: polling behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Delay between acquisition polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Run length used until a client sends `set_acquisition_time`.
    #[serde(default = "default_time_secs")]
    pub default_time_secs: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_time_secs() -> u64 {
    1
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            default_time_secs: default_time_secs(),
        }
    }
}

impl AcquisitionConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BridgeConfig {
    /// The layered provider: defaults, then `path` (if any), then environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(BridgeConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let config: BridgeConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> BridgeResult<()> {
        parse_log_level(&self.logging.level)?;

        if self.device.connect_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "device.connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.device.read_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "device.read_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.acquisition.poll_interval_ms == 0 {
            return Err(BridgeError::Configuration(
                "acquisition.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.server.listen_addr.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "server.listen_addr must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use figment::Jail;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listen_addr, "0.0.0.0:4567");
        assert_eq!(config.device.connect_timeout_ms, 8_000);
        assert_eq!(config.device.read_timeout_ms, 60_000);
        assert_eq!(config.device.profile, DeviceProfile::default());
        assert!(config.device.auto_connect().is_none());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"

            [device]
            host = "10.0.0.7"
            port = 1001
            pha_min_threshold = 250

            [logging]
            format = "json"
            "#
        )
        .unwrap();

        let config = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.device.auto_connect(), Some(("10.0.0.7", 1001)));
        assert_eq!(config.device.profile.pha_min_threshold, 250);
        assert_eq!(config.device.profile.pha_max_threshold, 16_300);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.toml",
                r#"
                [acquisition]
                poll_interval_ms = 2000
                "#,
            )?;
            jail.set_env("MCPHA_ACQUISITION__POLL_INTERVAL_MS", "250");
            jail.set_env("MCPHA_LOGGING__LEVEL", "debug");

            let config: BridgeConfig =
                BridgeConfig::figment(Some(Path::new("bridge.toml"))).extract()?;
            assert_eq!(config.acquisition.poll_interval(), Duration::from_millis(250));
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = BridgeConfig::default();
        config.acquisition.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.device.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut config = BridgeConfig::default();
        config.logging.level = "chatty".into();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::Configuration(_))
        ));
    }
}
