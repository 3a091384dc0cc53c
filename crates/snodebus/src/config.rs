use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
pub use snodebus_session::opcode::KEY_LEN;
use snodebus_session::{SessionConfig, MAX_ENDPOINTS};
use snodebus_transport::{HeartbeatConfig, TransportConfig, DEFAULT_BAUD_RATE, DEFAULT_PORT};
use tracing::debug;

use crate::error::{BridgeError, Result};

const MAX_CONFIG_FILE_SIZE: u64 = 64 * 1024;

/// One virtual node to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Label used in logs and CLI output.
    pub name: String,
    /// 16-byte key as 32 hex characters.
    pub key: String,
}

/// Bridge settings, loadable from JSON.
///
/// ```json
/// {
///   "host": "192.168.1.40",
///   "endpoints": [{ "name": "hall", "key": "000102030405060708090a0b0c0d0e0f" }]
/// }
/// ```
///
/// Every other field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Telnet server host.
    pub host: String,
    /// Telnet server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Serial line speed requested after each connect.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Delay between reconnect attempts.
    #[serde(default = "default_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Keep-alive period while connected.
    #[serde(default = "default_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Transmissions per message before giving up.
    #[serde(default = "default_tries")]
    pub tries: usize,
    /// Reply wait per attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Endpoints to register.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_tries() -> usize {
    snodebus_session::DEFAULT_TRIES
}

fn default_timeout_ms() -> u64 {
    snodebus_session::DEFAULT_TIMEOUT.as_millis() as u64
}

impl BridgeConfig {
    /// Configuration for `host` with every default and no endpoints.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            baud: default_baud(),
            reconnect_interval_ms: default_interval_ms(),
            heartbeat_interval_ms: default_interval_ms(),
            tries: default_tries(),
            timeout_ms: default_timeout_ms(),
            endpoints: Vec::new(),
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(BridgeError::InvalidConfig(format!(
                "{} is {size} bytes (max {MAX_CONFIG_FILE_SIZE})",
                path.display()
            )));
        }

        let mut content = String::new();
        file.take(MAX_CONFIG_FILE_SIZE).read_to_string(&mut content)?;
        let config = Self::from_json(&content)?;
        debug!(path = %path.display(), endpoints = config.endpoints.len(), "config loaded");
        Ok(config)
    }

    /// Check ranges, key encodings and endpoint names.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(BridgeError::InvalidConfig("port must not be 0".into()));
        }
        if self.baud == 0 {
            return Err(BridgeError::InvalidConfig("baud must not be 0".into()));
        }
        if self.tries == 0 {
            return Err(BridgeError::InvalidConfig("tries must be at least 1".into()));
        }
        for (field, value) in [
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("timeout_ms", self.timeout_ms),
        ] {
            if value == 0 {
                return Err(BridgeError::InvalidConfig(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        if self.endpoints.len() > MAX_ENDPOINTS {
            return Err(BridgeError::InvalidConfig(format!(
                "{} endpoints configured (max {MAX_ENDPOINTS})",
                self.endpoints.len()
            )));
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(BridgeError::InvalidConfig(format!(
                    "duplicate endpoint name {:?}",
                    endpoint.name
                )));
            }
            parse_key(&endpoint.key).map_err(|reason| BridgeError::InvalidKey {
                name: endpoint.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Decoded keys in registration order.
    pub fn endpoint_keys(&self) -> Result<Vec<(String, [u8; KEY_LEN])>> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                parse_key(&endpoint.key)
                    .map(|key| (endpoint.name.clone(), key))
                    .map_err(|reason| BridgeError::InvalidKey {
                        name: endpoint.name.clone(),
                        reason,
                    })
            })
            .collect()
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            baud_rate: self.baud,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            ..TransportConfig::new(self.host.clone(), self.port)
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            tries: self.tries,
            timeout: Duration::from_millis(self.timeout_ms),
            ..SessionConfig::default()
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            ..HeartbeatConfig::default()
        }
    }
}

/// Decode a 32-character hex key.
pub fn parse_key(text: &str) -> std::result::Result<[u8; KEY_LEN], String> {
    let bytes = hex::decode(text.trim()).map_err(|err| err.to_string())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("expected {KEY_LEN} bytes, got {len}"))
}
