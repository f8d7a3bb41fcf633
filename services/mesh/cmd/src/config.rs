//! Configuration handling for the mesh node.
//!
//! This module reads the node configuration from the shared config file and
//! environment variables, providing a unified configuration interface.

use anyhow::{anyhow, bail, Result};
use mesh_net::{NetConfig, RelayFeatures};
use mesh_storage::StorageMode;
use mesh_subnet::{IvConfig, Key};
use mesh_transport::{SarConfig, StackConfig};
use mesh_wire::address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Address of the primary element
    pub unicast_addr: u16,
    /// Number of elements
    pub element_count: u16,
    /// UDP address the advertising bearer listens on
    pub listen: SocketAddr,
    /// UDP peers that hear our advertisements
    pub peers: Vec<SocketAddr>,
    /// NetKey index of the primary subnet
    pub net_idx: u16,
    /// NetKey, 32 hex digits
    pub net_key: String,
    /// AppKey index
    pub app_idx: u16,
    /// AppKey, 32 hex digits
    pub app_key: String,
    /// Device key, 32 hex digits
    pub dev_key: String,
    /// IV index used when nothing is stored
    pub iv_index: u32,
    /// Default TTL
    pub default_ttl: u8,
    /// Relay feature
    pub relay: bool,
    /// Settings file; in-memory settings when unset
    pub storage_path: Option<PathBuf>,
    /// Secure Network beacon interval
    pub beacon_interval: Duration,
    /// Group addresses the node subscribes to
    pub subscribe: Vec<u16>,
    /// Heartbeat publication destination, unassigned to disable
    pub heartbeat_dst: u16,
    /// Heartbeat publication period
    pub heartbeat_period: Duration,
    /// Heartbeat subscription destination, unassigned to disable
    pub heartbeat_sub: u16,
    /// Periodic publication destination, unassigned to disable
    pub publish_dst: u16,
    /// Periodic publication period
    pub publish_period: Duration,
    /// Published payload, hex
    pub publish_payload: String,
    /// Segmentation and reassembly parameters
    pub sar: SarConfig,
    /// Capacity of the bearer relay queue
    pub relay_queue: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            unicast_addr: 0x0001,
            element_count: 1,
            listen: SocketAddr::from(([127, 0, 0, 1], 7001)),
            peers: Vec::new(),
            net_idx: 0,
            net_key: "7dd7364cd842ad18c17c2b820c84c3d6".to_string(),
            app_idx: 0,
            app_key: "63964771734fbd76e3b40519d1d94a48".to_string(),
            dev_key: "9d6dd0e96eb25dc19a40ed9914f8f03f".to_string(),
            iv_index: 0,
            default_ttl: 7,
            relay: true,
            storage_path: None,
            beacon_interval: Duration::from_secs(10),
            subscribe: Vec::new(),
            heartbeat_dst: address::UNASSIGNED,
            heartbeat_period: Duration::from_secs(30),
            heartbeat_sub: address::UNASSIGNED,
            publish_dst: address::UNASSIGNED,
            publish_period: Duration::from_secs(5),
            publish_payload: "0102".to_string(),
            sar: SarConfig::default(),
            relay_queue: 16,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    mesh: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final mesh configuration: unicast=0x{:04x} listen={} peers={} net_idx=0x{:03x} iv_index=0x{:08x}",
            config.unicast_addr,
            config.listen,
            config.peers.len(),
            config.net_idx,
            config.iv_index
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        if let Some(mesh_service) = root_config.services.and_then(|s| s.mesh) {
            self.apply_service_config(mesh_service)?;
        }
        Ok(())
    }

    /// Apply the `args` list and the `services.mesh.*` config map
    fn apply_service_config(&mut self, service_config: ServiceConfig) -> Result<()> {
        for arg in service_config.args.unwrap_or_default() {
            if let Some(addr) = arg.strip_prefix("--unicast-addr=") {
                self.unicast_addr = parse_u16(addr)?;
            } else if let Some(listen) = arg.strip_prefix("--listen=") {
                self.listen = listen.parse()?;
            } else if let Some(peer) = arg.strip_prefix("--peer=") {
                self.peers.push(peer.parse()?);
            }
        }

        for (key, value) in service_config.config.unwrap_or_default() {
            let Some(name) = key.strip_prefix("services.mesh.") else {
                continue;
            };
            self.set(name, &value)?;
        }

        Ok(())
    }

    /// Set one field from its string form
    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "unicast_addr" => self.unicast_addr = parse_u16(value)?,
            "element_count" => self.element_count = value.parse()?,
            "listen" => self.listen = value.parse()?,
            "peers" => self.peers = parse_list(value, |p| Ok(p.parse::<SocketAddr>()?))?,
            "net_idx" => self.net_idx = parse_u16(value)?,
            "net_key" => self.net_key = value.to_string(),
            "app_idx" => self.app_idx = parse_u16(value)?,
            "app_key" => self.app_key = value.to_string(),
            "dev_key" => self.dev_key = value.to_string(),
            "iv_index" => self.iv_index = parse_u32(value)?,
            "default_ttl" => self.default_ttl = value.parse()?,
            "relay" => self.relay = value.eq_ignore_ascii_case("true"),
            "storage_path" => self.storage_path = Some(PathBuf::from(value)),
            "beacon_interval" => self.beacon_interval = humantime::parse_duration(value)?,
            "subscribe" => self.subscribe = parse_list(value, parse_u16)?,
            "heartbeat_dst" => self.heartbeat_dst = parse_u16(value)?,
            "heartbeat_period" => self.heartbeat_period = humantime::parse_duration(value)?,
            "heartbeat_sub" => self.heartbeat_sub = parse_u16(value)?,
            "publish_dst" => self.publish_dst = parse_u16(value)?,
            "publish_period" => self.publish_period = humantime::parse_duration(value)?,
            "publish_payload" => self.publish_payload = value.to_string(),
            "relay_queue" => self.relay_queue = value.parse()?,
            _ => {
                // Ignore unknown configuration keys
            }
        }
        Ok(())
    }

    /// Apply `MESH_*` overrides looked up through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("MESH_UNICAST_ADDR") {
            self.unicast_addr = parse_u16(&addr)?;
            info!("Unicast address overridden by environment: 0x{:04x}", self.unicast_addr);
        }

        if let Some(listen) = lookup("MESH_LISTEN") {
            self.listen = listen.parse()?;
            info!("Listen address overridden by environment: {}", self.listen);
        }

        if let Some(peers) = lookup("MESH_PEERS") {
            self.peers = parse_list(&peers, |p| Ok(p.parse::<SocketAddr>()?))?;
            info!("Peers overridden by environment: {:?}", self.peers);
        }

        if let Some(key) = lookup("MESH_NET_KEY") {
            self.net_key = key;
            info!("NetKey overridden by environment");
        }

        if let Some(iv_index) = lookup("MESH_IV_INDEX") {
            self.iv_index = parse_u32(&iv_index)?;
            info!("IV index overridden by environment: 0x{:08x}", self.iv_index);
        }

        Ok(())
    }

    /// Check addresses and keys
    pub fn validate(&self) -> Result<()> {
        if !address::is_unicast(self.unicast_addr) {
            bail!("0x{:04x} is not a unicast address", self.unicast_addr);
        }
        if self.element_count == 0
            || !address::is_unicast(self.unicast_addr.saturating_add(self.element_count - 1))
        {
            bail!("invalid element count {}", self.element_count);
        }
        if self.beacon_interval.is_zero()
            || self.heartbeat_period.is_zero()
            || self.publish_period.is_zero()
        {
            bail!("beacon, heartbeat and publish periods must be non-zero");
        }
        for group in &self.subscribe {
            if !address::is_group(*group) {
                bail!("0x{:04x} is not a group address", group);
            }
        }
        self.net_key()?;
        self.app_key()?;
        self.dev_key()?;
        self.publish_payload()?;
        Ok(())
    }

    /// Parsed NetKey
    pub fn net_key(&self) -> Result<Key> {
        parse_key(&self.net_key).map_err(|e| anyhow!("net_key: {}", e))
    }

    /// Parsed AppKey
    pub fn app_key(&self) -> Result<Key> {
        parse_key(&self.app_key).map_err(|e| anyhow!("app_key: {}", e))
    }

    /// Parsed device key
    pub fn dev_key(&self) -> Result<Key> {
        parse_key(&self.dev_key).map_err(|e| anyhow!("dev_key: {}", e))
    }

    /// Parsed publication payload
    pub fn publish_payload(&self) -> Result<Vec<u8>> {
        parse_hex(&self.publish_payload).map_err(|e| anyhow!("publish_payload: {}", e))
    }

    /// Settings backend
    pub fn storage_mode(&self) -> StorageMode {
        match &self.storage_path {
            Some(path) => StorageMode::File { path: path.clone() },
            None => StorageMode::InMemory,
        }
    }

    /// Network layer configuration
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            primary_addr: self.unicast_addr,
            element_count: self.element_count,
            default_ttl: self.default_ttl,
            features: RelayFeatures {
                relay: self.relay,
                ..Default::default()
            },
            iv: IvConfig::default(),
            ..Default::default()
        }
    }

    /// Transport configuration
    pub fn stack_config(&self) -> Result<StackConfig> {
        Ok(StackConfig {
            sar: self.sar,
            dev_key: self.dev_key()?,
            heartbeat_sub_dst: self.heartbeat_sub,
            ..Default::default()
        })
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal u16
pub fn parse_u16(value: &str) -> Result<u16> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => Ok(u16::from_str_radix(hex, 16)?),
        None => Ok(value.parse()?),
    }
}

fn parse_u32(value: &str) -> Result<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => Ok(u32::from_str_radix(hex, 16)?),
        None => Ok(value.parse()?),
    }
}

fn parse_list<T, F>(value: &str, parse: F) -> Result<Vec<T>>
where
    F: Fn(&str) -> Result<T>,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse)
        .collect()
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    if value.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            value
                .get(i..i + 2)
                .ok_or_else(|| anyhow!("invalid hex"))
                .and_then(|b| Ok(u8::from_str_radix(b, 16)?))
        })
        .collect()
}

fn parse_key(value: &str) -> Result<Key> {
    let bytes = parse_hex(value)?;
    Key::try_from(bytes.as_slice()).map_err(|_| anyhow!("expected 16 bytes, got {}", bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.unicast_addr, 0x0001);
        assert_eq!(config.listen, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        assert_eq!(config.beacon_interval, Duration::from_secs(10));
        config.validate().unwrap();
        assert_eq!(config.storage_mode(), StorageMode::InMemory);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
supervisor:
  port: 50000

services:
  mesh:
    enabled: true
    executable: ./mesh-net
    args:
      - --unicast-addr=0x0010
      - --peer=127.0.0.1:7002
    config:
      services.mesh.element_count: "2"
      services.mesh.iv_index: "0x00000005"
      services.mesh.subscribe: "0xc000, 0xc001"
      services.mesh.beacon_interval: "2s 500ms"
      services.mesh.relay: "false"
      services.mesh.storage_path: "/tmp/mesh.json"
      services.other.unicast_addr: "0x0099"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.unicast_addr, 0x0010);
        assert_eq!(config.element_count, 2);
        assert_eq!(config.peers, vec!["127.0.0.1:7002".parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.subscribe, vec![0xc000, 0xc001]);
        assert_eq!(config.beacon_interval, Duration::from_millis(2500));
        assert!(!config.relay);
        assert!(!config.net_config().features.relay);
        assert_eq!(
            config.storage_mode(),
            StorageMode::File { path: PathBuf::from("/tmp/mesh.json") }
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.net_idx, 0);
        assert_eq!(config.default_ttl, 7);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_UNICAST_ADDR", "0x0042"),
            ("MESH_LISTEN", "0.0.0.0:9100"),
            ("MESH_PEERS", "10.0.0.2:9100,10.0.0.3:9100"),
            ("MESH_NET_KEY", "000102030405060708090a0b0c0d0e0f"),
            ("MESH_IV_INDEX", "12"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.unicast_addr, 0x0042);
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.iv_index, 12);
        let key = config.net_key().unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0f);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MeshConfig { unicast_addr: 0xc000, ..Default::default() };
        assert!(config.validate().is_err());

        config.unicast_addr = 0x7fff;
        config.element_count = 2;
        assert!(config.validate().is_err());

        config = MeshConfig { net_key: "0011".to_string(), ..Default::default() };
        assert!(config.validate().is_err());

        config = MeshConfig { subscribe: vec![0x0005], ..Default::default() };
        assert!(config.validate().is_err());

        config = MeshConfig { publish_payload: "abc".to_string(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_u16("0x7FFF").unwrap(), 0x7fff);
        assert_eq!(parse_u16("42").unwrap(), 42);
        assert!(parse_u16("0x10000").is_err());
        assert_eq!(parse_u32(" 0X10 ").unwrap(), 16);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert!(parse_hex("zz").is_err());
    }
}
