//! Configuration module
//!
//! TOML file layout (every key is optional):
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8887
//! listen_path = "/ocpp/{id}"
//! ping_wait_secs = 60
//!
//! [client]
//! url = "ws://127.0.0.1:8887/ocpp"
//! station_id = "CS001"
//! ocpp_version = "1.6"
//!
//! [dispatcher]
//! request_timeout_secs = 30
//! queue_capacity = 0
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::dispatcher::DispatcherConfig;
use crate::domain::{ConfigError, OcppVersion};
use crate::infrastructure::ws::tls::{ClientTlsConfig, ServerTlsConfig};
use crate::infrastructure::ws::{ClientTimeouts, ServerTimeouts};
use crate::support::validation::Validator;

/// Environment variable that overrides the default config location.
pub const CONFIG_ENV: &str = "OCPPJ_CONFIG";

/// Config file location: `$OCPPJ_CONFIG`, else `~/.config/ocppj/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocppj")
        .join("config.toml")
}

// ── AppConfig ──────────────────────────────────────────────────

/// Where [`AppConfig::load`] took its values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file does not exist.
    Defaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub dispatcher: DispatcherSection,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from `path`. A missing file yields the defaults.
    ///
    /// Runs before logging is set up, so it reports the source instead of
    /// logging it.
    pub fn load(path: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        if !path.exists() {
            return Ok((Self::default(), ConfigSource::Defaults));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        Ok((config, ConfigSource::File))
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.listen_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.listen_path must start with '/': {}",
                self.server.listen_path
            )));
        }
        if self.server.listen_path.matches("{id}").count() > 1 {
            return Err(ConfigError::Invalid(
                "server.listen_path may contain {id} at most once".into(),
            ));
        }
        if self.client.ping_period_secs >= self.client.pong_wait_secs {
            return Err(ConfigError::Invalid(format!(
                "client.ping_period_secs ({}) must be shorter than client.pong_wait_secs ({})",
                self.client.ping_period_secs, self.client.pong_wait_secs
            )));
        }
        if self.client.reconnect_backoff_secs > self.client.reconnect_max_backoff_secs {
            return Err(ConfigError::Invalid(
                "client.reconnect_backoff_secs exceeds client.reconnect_max_backoff_secs".into(),
            ));
        }
        if self.dispatcher.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.request_timeout_secs must be positive".into(),
            ));
        }
        if self.client.station_id.is_empty() || self.client.station_id.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "client.station_id is not a valid path segment: {:?}",
                self.client.station_id
            )));
        }
        Ok(())
    }
}

// ── [server] ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Route for upgrades; `{id}` marks the station id segment.
    pub listen_path: String,
    pub ocpp_version: OcppVersion,
    /// Overrides the catalog's subprotocol list when non-empty.
    pub subprotocols: Vec<String>,
    pub write_wait_secs: u64,
    pub ping_wait_secs: u64,
    pub basic_auth: Option<BasicAuthConfig>,
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8887,
            listen_path: "/{id}".to_string(),
            ocpp_version: OcppVersion::V16,
            subprotocols: Vec::new(),
            write_wait_secs: 10,
            ping_wait_secs: 60,
            basic_auth: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeouts(&self) -> ServerTimeouts {
        ServerTimeouts::default()
            .with_write_wait(Duration::from_secs(self.write_wait_secs))
            .with_ping_wait(Duration::from_secs(self.ping_wait_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

// ── [client] ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL; the station id is appended as the last path segment.
    pub url: String,
    pub station_id: String,
    pub ocpp_version: OcppVersion,
    pub username: Option<String>,
    pub password: Option<String>,
    pub write_wait_secs: u64,
    pub handshake_timeout_secs: u64,
    pub pong_wait_secs: u64,
    pub ping_period_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub reconnect_max_backoff_secs: u64,
    pub tls: Option<ClientTlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8887".to_string(),
            station_id: "CS001".to_string(),
            ocpp_version: OcppVersion::V16,
            username: None,
            password: None,
            write_wait_secs: 10,
            handshake_timeout_secs: 30,
            pong_wait_secs: 60,
            ping_period_secs: 54,
            reconnect_backoff_secs: 5,
            reconnect_max_backoff_secs: 120,
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn timeouts(&self) -> ClientTimeouts {
        ClientTimeouts::default()
            .with_write_wait(Duration::from_secs(self.write_wait_secs))
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_pong_wait(Duration::from_secs(self.pong_wait_secs))
            .with_ping_period(Duration::from_secs(self.ping_period_secs))
            .with_reconnect_backoff(
                Duration::from_secs(self.reconnect_backoff_secs),
                Duration::from_secs(self.reconnect_max_backoff_secs),
            )
    }
}

// ── [dispatcher] ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub request_timeout_secs: u64,
    /// Queued requests per peer; 0 means unbounded.
    pub queue_capacity: usize,
    /// Fail with `Busy` instead of queueing behind an in-flight request.
    pub reject_when_busy: bool,
    pub validate_messages: bool,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            queue_capacity: 0,
            reject_when_busy: false,
            validate_messages: true,
        }
    }
}

impl DispatcherSection {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            queue_capacity: self.queue_capacity,
            reject_when_busy: self.reject_when_busy,
        }
    }

    pub fn validator(&self) -> Validator {
        Validator::new().with_enabled(self.validate_messages)
    }
}

// ── [logging] ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 8887);
        assert_eq!(config.server.listen_path, "/{id}");
        assert_eq!(config.client.ping_period_secs, 54);
        assert_eq!(config.dispatcher.request_timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_sections() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            port = 9000
            listen_path = "/ocpp/{id}"
            ocpp_version = "2.0.1"

            [client]
            station_id = "CS042"
            ocpp_version = "1.6"
            reconnect_backoff_secs = 1

            [dispatcher]
            queue_capacity = 8
            validate_messages = false
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.ocpp_version, OcppVersion::V201);
        assert_eq!(config.client.station_id, "CS042");
        assert_eq!(
            config.client.timeouts().reconnect_backoff,
            Duration::from_secs(1)
        );
        assert_eq!(config.dispatcher.dispatcher_config().queue_capacity, 8);
        assert!(!config.dispatcher.validator().is_enabled());
    }

    #[test]
    fn rejects_ping_period_not_below_pong_wait() {
        let err = AppConfig::from_toml(
            r#"
            [client]
            pong_wait_secs = 10
            ping_period_secs = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unparseable_toml() {
        let err = AppConfig::from_toml("[server\nport = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_default() {
        let (config, source) = AppConfig::load(Path::new("/nonexistent/ocppj/config.toml")).unwrap();
        assert_eq!(source, ConfigSource::Defaults);
        assert_eq!(config.client.station_id, "CS001");
    }

    #[test]
    fn existing_file_is_reported_as_file() {
        let path = std::env::temp_dir().join(format!("ocppj-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[client]\nstation_id = \"CS042\"\n").unwrap();
        let loaded = AppConfig::load(&path);
        std::fs::remove_file(&path).unwrap();

        let (config, source) = loaded.unwrap();
        assert_eq!(source, ConfigSource::File);
        assert_eq!(config.client.station_id, "CS042");
    }
}
