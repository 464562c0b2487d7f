//! Policy Document
//!
//! The persisted shape: switch descriptors under `ovs`, channel definitions
//! under `channels`.
//!
//! ```json
//! {
//!   "ovs": {
//!     "1": {
//!       "dpid": "0000000000000001",
//!       "intport": {"1": {"type": "server"}},
//!       "outport": {"2": {"sla": "1", "mzvs": "1"}, "3": {"sla": "2", "mzvs": "2"}},
//!       "mzvs": {"1": ["http://10.0.0.5:8000/key"], "2": []}
//!     }
//!   },
//!   "channels": {
//!     "1": {
//!       "src": {"ovs": "1", "subnet": "10.0.1.0/24", "vlan": 10, "type": "server"},
//!       "dst": {"ovs": "2", "subnet": "10.0.2.0/24", "vlan": 20, "type": "client"},
//!       "sla": "1",
//!       "active": "1"
//!     }
//!   }
//! }
//! ```

use crate::{Result, SteerError};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Highest 802.1Q VLAN id
pub const MAX_VLAN: u16 = 4095;

/// Identifier written either as a JSON string or a JSON integer.
///
/// The written form is kept so documents round-trip unchanged; lookups go
/// through the textual form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Number(u64),
    Text(String),
}

impl Key {
    /// Compare by textual form
    pub fn is(&self, other: &str) -> bool {
        match self {
            Key::Text(s) => s == other,
            Key::Number(n) => other.parse::<u64>().map(|o| o == *n).unwrap_or(false),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

/// Switch port, as used in `intport`/`outport` keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortNo {
    Number(u32),
    /// Reserved or symbolic ports such as `LOCAL`
    Named(String),
}

impl PortNo {
    /// Parse a port-table key
    pub fn parse(key: &str) -> Self {
        match key.trim().parse::<u32>() {
            Ok(n) => PortNo::Number(n),
            Err(_) => PortNo::Named(key.to_string()),
        }
    }
}

impl Ord for PortNo {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PortNo::Number(a), PortNo::Number(b)) => a.cmp(b),
            (PortNo::Number(_), PortNo::Named(_)) => Ordering::Less,
            (PortNo::Named(_), PortNo::Number(_)) => Ordering::Greater,
            (PortNo::Named(a), PortNo::Named(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for PortNo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PortNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortNo::Number(n) => write!(f, "{}", n),
            PortNo::Named(s) => f.write_str(s),
        }
    }
}

/// Host-facing port: which endpoint role is cabled to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntPort {
    #[serde(rename = "type", alias = "role")]
    pub role: String,
}

/// Egress port: which SLA class leaves through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutPort {
    pub sla: Key,
    /// Downstream service group receiving keys for this SLA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mzvs: Option<Key>,
}

/// Switch descriptor (an `ovs` entry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchDescriptor {
    /// Datapath id, hex
    pub dpid: String,
    #[serde(default)]
    pub intport: BTreeMap<String, IntPort>,
    #[serde(default)]
    pub outport: BTreeMap<String, OutPort>,
    /// Service group id -> endpoint URLs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mzvs: BTreeMap<String, Vec<String>>,
}

impl SwitchDescriptor {
    /// Host port for a role, scanning ports in ascending order
    pub fn port_for_role(&self, role: &str) -> Option<PortNo> {
        sorted_ports(&self.intport)
            .find(|(_, p)| p.role == role)
            .map(|(port, _)| port)
    }

    /// Egress port carrying an SLA, scanning ports in ascending order
    pub fn port_for_sla(&self, sla: &str) -> Option<(PortNo, &OutPort)> {
        sorted_ports(&self.outport).find(|(_, p)| p.sla.is(sla))
    }

    /// Endpoint URLs registered for a service group
    pub fn group_urls(&self, group: &Key) -> Option<&[String]> {
        self.mzvs.get(&group.to_string()).map(|urls| urls.as_slice())
    }

    /// Reject descriptors whose role or SLA lookups would be ambiguous
    pub fn validate(&self, id: &str) -> Result<()> {
        crate::switch::parse_dpid(&self.dpid)
            .map_err(|_| malformed(format!("ovs.{}.dpid: invalid datapath id {:?}", id, self.dpid)))?;

        let mut roles = HashSet::new();
        for (port, entry) in sorted_ports(&self.intport) {
            if !roles.insert(entry.role.as_str()) {
                return Err(malformed(format!(
                    "ovs.{}.intport.{}: role {:?} already bound to another port",
                    id, port, entry.role
                )));
            }
        }

        let mut slas = HashSet::new();
        for (port, entry) in sorted_ports(&self.outport) {
            if !slas.insert(entry.sla.to_string()) {
                return Err(malformed(format!(
                    "ovs.{}.outport.{}: sla {} already bound to another port",
                    id, port, entry.sla
                )));
            }
        }

        Ok(())
    }
}

fn sorted_ports<T>(table: &BTreeMap<String, T>) -> impl Iterator<Item = (PortNo, &T)> {
    let mut ports: Vec<(PortNo, &T)> = table
        .iter()
        .map(|(k, v)| (PortNo::parse(k), v))
        .collect();
    ports.sort_by(|a, b| a.0.cmp(&b.0));
    ports.into_iter()
}

/// One side of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// Key into the `ovs` table
    pub ovs: Key,
    /// IPv4 address or network
    pub subnet: String,
    /// 802.1Q id, 0 = untagged
    #[serde(default)]
    pub vlan: u16,
    /// Role matched against `intport`
    #[serde(rename = "type", alias = "role")]
    pub role: String,
}

impl Endpoint {
    /// Parsed subnet
    pub fn network(&self) -> Result<Ipv4Network> {
        self.parse_subnet().map_err(malformed)
    }

    fn parse_subnet(&self) -> std::result::Result<Ipv4Network, String> {
        self.subnet
            .trim()
            .parse()
            .map_err(|e| format!("subnet {:?}: {}", self.subnet, e))
    }

    fn validate(&self, at: &str) -> Result<()> {
        self.parse_subnet()
            .map_err(|e| malformed(format!("{}.{}", at, e)))?;
        if self.vlan > MAX_VLAN {
            return Err(malformed(format!("{}.vlan: {} out of range", at, self.vlan)));
        }
        Ok(())
    }
}

/// Channel definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Channel {
    pub src: Endpoint,
    pub dst: Endpoint,
    /// Currently bound SLA id
    pub sla: Key,
    #[serde(default)]
    pub active: Flag,
}

impl Channel {
    /// Whether rules should be on the switches
    pub fn is_active(&self) -> bool {
        self.active.0
    }

    /// Field-level checks that do not need the switch table
    pub fn validate(&self, id: &str) -> Result<()> {
        self.src.validate(&format!("channels.{}.src", id))?;
        self.dst.validate(&format!("channels.{}.dst", id))
    }
}

/// Boolean persisted as `"1"`/`"0"`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flag(pub bool);

impl Serialize for Flag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(if self.0 { "1" } else { "0" })
    }
}

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Ok(Flag(b)),
            Raw::Number(0) => Ok(Flag(false)),
            Raw::Number(1) => Ok(Flag(true)),
            Raw::Text(s) if s == "0" => Ok(Flag(false)),
            Raw::Text(s) if s == "1" => Ok(Flag(true)),
            _ => Err(serde::de::Error::custom("expected \"0\" or \"1\"")),
        }
    }
}

/// The whole persisted policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub ovs: BTreeMap<String, SwitchDescriptor>,
    #[serde(default)]
    pub channels: BTreeMap<String, Channel>,
}

impl PolicyDocument {
    /// Parse and validate a document
    pub fn from_json(content: &str) -> Result<Self> {
        let doc: PolicyDocument =
            serde_json::from_str(content).map_err(|e| malformed(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Validate every switch and channel
    pub fn validate(&self) -> Result<()> {
        for (id, switch) in &self.ovs {
            switch.validate(id)?;
        }
        for (id, channel) in &self.channels {
            channel.validate(id)?;
        }
        Ok(())
    }

    /// Switch descriptor referenced by an endpoint
    pub fn switch_for(&self, endpoint: &Endpoint) -> Result<&SwitchDescriptor> {
        let id = endpoint.ovs.to_string();
        self.ovs.get(&id).ok_or(SteerError::UnknownSwitch(id))
    }
}

fn malformed(msg: String) -> SteerError {
    SteerError::MalformedRequest(msg)
}
