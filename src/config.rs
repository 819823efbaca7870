use std::fs;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("peer '{0}' is missing a send key")]
    MissingSendKey(String),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("session keys must be exactly 32 bytes")]
    KeyLength,
    #[error("invalid network '{0}': {1}")]
    Network(String, ipnetwork::IpNetworkError),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    pub interface: InterfaceConfig,
    #[serde(default, rename = "Peer")]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceConfig {
    pub listen_port: u16,
    pub addresses: Vec<String>,
    #[serde(default = "default_mtu", rename = "MTU")]
    pub mtu: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct PeerConfig {
    pub name: String,

    /// Base64 32-byte symmetric key sealing traffic toward this peer.
    pub send_key: String,

    /// Index the receiver expects to see echoed in the transport header.
    #[serde(default)]
    pub receiver_index: u32,

    #[serde(rename = "AllowedIPs")]
    pub allowed_ips: String,
    #[serde(default)]
    pub endpoint: String,

    /// Seconds between keepalives when idle; 0 disables them.
    #[serde(default)]
    pub persistent_keepalive: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_true")]
    pub to_stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: String::new(),
            to_stdout: true,
        }
    }
}

fn default_mtu() -> u16 {
    1420
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        if config.interface.addresses.is_empty() {
            log::warn!("'Addresses' is empty; the interface will come up unnumbered");
        }
        for peer in &config.peers {
            if peer.send_key.is_empty() {
                return Err(ConfigError::MissingSendKey(peer.name.clone()));
            }
        }
        Ok(config)
    }
}

/// Decode a base64 32-byte session key.
pub fn decode_session_key(key_b64: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = B64.decode(key_b64)?;
    bytes.as_slice().try_into().map_err(|_| ConfigError::KeyLength)
}

/// Parse a comma-separated CIDR list.
pub fn parse_allowed_ips(list: &str) -> Result<Vec<IpNetwork>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|cidr| {
            IpNetwork::from_str(cidr).map_err(|err| ConfigError::Network(cidr.to_string(), err))
        })
        .collect()
}

pub const SAMPLE_CONFIG: &str = r#"
# burrow config
[Interface]
ListenPort = 51820
Addresses = ["10.66.0.1/24"]
MTU = 1420

[Log]
Level = "info"
Path = ""
ToStdout = true

[[Peer]]
Name = "hub"
# Generate with `burrow gen-key`
SendKey = "c2FtcGxlLWtleS1yZXBsYWNlLW1lLXNhbXBsZS1rZXk="
ReceiverIndex = 1
AllowedIPs = "10.66.0.2/32, 10.66.1.0/24"
Endpoint = "tunnel.example.com:51820"
PersistentKeepalive = 25
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses() {
        let config: Config = toml::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.interface.listen_port, 51820);
        assert_eq!(config.interface.mtu, 1420);
        assert_eq!(config.peers.len(), 1);

        let peer = &config.peers[0];
        assert_eq!(peer.name, "hub");
        assert_eq!(peer.receiver_index, 1);
        assert_eq!(peer.persistent_keepalive, 25);
        decode_session_key(&peer.send_key).unwrap();
    }

    #[test]
    fn allowed_ips_split_and_parse() {
        let networks = parse_allowed_ips("10.66.0.2/32, 10.66.1.0/24,").unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].prefix(), 32);

        assert!(parse_allowed_ips("not-a-network").is_err());
    }

    #[test]
    fn session_keys_must_be_32_bytes() {
        assert!(matches!(
            decode_session_key("dG9vLXNob3J0"),
            Err(ConfigError::KeyLength)
        ));
        assert!(decode_session_key("!!!").is_err());
    }
}
