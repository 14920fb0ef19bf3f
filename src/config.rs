//! Runtime configuration for the discovery and session subsystems.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_mdns_port() -> u16 {
    5353
}
fn default_matter_port() -> u16 {
    5540
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IPv6 is mandatory for matter; IPv4 multicast is opt-in.
    #[serde(default)]
    pub enable_ipv4: bool,
    /// Restrict discovery to one interface by name. All interfaces if unset.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_mdns_port")]
    pub mdns_port: u16,
    #[serde(default = "default_matter_port")]
    pub matter_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enable_ipv4: false,
            interface: None,
            mdns_port: default_mdns_port(),
            matter_port: default_matter_port(),
        }
    }
}

pub fn load_config(path: &str) -> Result<NodeConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context("parsing node config")
}

pub fn save_config(path: &str, config: &NodeConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = NodeConfig::default();
        assert!(!c.enable_ipv4);
        assert_eq!(c.mdns_port, 5353);
        assert_eq!(c.matter_port, 5540);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let c: NodeConfig = serde_json::from_str(r#"{"enable_ipv4": true}"#).unwrap();
        assert!(c.enable_ipv4);
        assert_eq!(c.interface, None);
        assert_eq!(c.mdns_port, 5353);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("matn-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let path = path.to_str().unwrap();
        let mut c = NodeConfig::default();
        c.interface = Some("eth0".to_owned());
        save_config(path, &c).unwrap();
        let back = load_config(path).unwrap();
        assert_eq!(back.interface.as_deref(), Some("eth0"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
