//! Controller Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Control surface bind address
    pub listen_addr: String,
    /// Policy document rewritten on every mutation
    pub rules_path: String,
    /// Seed policy document read when `rules_path` is absent
    pub rules_default_path: String,
    /// Flow/port statistics poll period
    pub stats_interval_secs: u64,
    /// Bound on every call into a switch
    pub install_timeout_ms: u64,
    /// Bound on every key delivery
    pub forward_timeout_ms: u64,
    /// Switch programming backend
    pub driver: DriverKind,
    /// ovs-ofctl binary
    pub ofctl_path: String,
    /// Attach/detach probe period
    pub probe_interval_secs: u64,
    /// Switches managed by the driver
    pub switches: Vec<SwitchTarget>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            rules_path: "channels.json".into(),
            rules_default_path: "channels.default.json".into(),
            stats_interval_secs: 10,
            install_timeout_ms: 3_000,
            forward_timeout_ms: 5_000,
            driver: DriverKind::Ofctl,
            ofctl_path: "ovs-ofctl".into(),
            probe_interval_secs: 5,
            switches: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Switch call timeout
    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    /// Key delivery timeout
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Switch programming backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Open vSwitch through `ovs-ofctl`
    Ofctl,
    /// In-memory flow tables (dry runs)
    Memory,
}

/// A switch the driver should attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchTarget {
    /// Datapath id as hex, e.g. `0000000000000001`
    pub dpid: String,
    /// ovs-ofctl target, e.g. `br0` or `tcp:10.0.0.2:6653`
    #[serde(default)]
    pub target: String,
}
