//! Switch Handles
//!
//! The capability the controller needs from an attached OpenFlow switch:
//! push a flow-mod and read counters back.

use crate::config::SwitchTarget;
use crate::flow::{FlowCommand, FlowMatch, FlowMod, FlowRule};
use crate::registry::SwitchEvent;
use crate::{Result, SteerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// OpenFlow 1.3 wire version, the only one rules are compiled for
pub const OFP_VERSION_1_3: u8 = 0x04;

/// Per-flow counters from a flow stats reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStat {
    pub priority: u16,
    pub in_port: Option<String>,
    pub packet_count: u64,
    pub byte_count: u64,
}

/// Per-port counters from a port stats reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStat {
    pub port: String,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Rule installation and statistics for one attached switch
#[async_trait]
pub trait SwitchHandle: Send + Sync {
    /// Datapath id
    fn dpid(&self) -> u64;

    /// Negotiated OpenFlow wire version
    fn protocol_version(&self) -> u8;

    /// Install or strictly remove one rule
    async fn apply(&self, flow_mod: &FlowMod) -> Result<()>;

    /// Flow table counters
    async fn flow_stats(&self) -> Result<Vec<FlowStat>>;

    /// Port counters
    async fn port_stats(&self) -> Result<Vec<PortStat>>;
}

/// Push one flow-mod, treating a slow switch as a failed install.
pub async fn apply_with_timeout(
    handle: &dyn SwitchHandle,
    flow_mod: &FlowMod,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, handle.apply(flow_mod)).await {
        Ok(result) => result,
        Err(_) => Err(SteerError::InstallFailure(format!(
            "dpid={}: no answer within {:?}",
            format_dpid(handle.dpid()),
            timeout
        ))),
    }
}

/// Parse a datapath id written as up to 16 hex digits.
pub fn parse_dpid(s: &str) -> Result<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.len() > 16 {
        return Err(SteerError::InvalidReference(s.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| SteerError::InvalidReference(s.to_string()))
}

/// Render a datapath id as 16 hex digits.
pub fn format_dpid(dpid: u64) -> String {
    format!("{:016x}", dpid)
}

#[derive(Debug, Clone)]
struct FlowEntry {
    rule: FlowRule,
    packet_count: u64,
    byte_count: u64,
}

/// In-memory switch with OpenFlow add/strict-delete semantics
pub struct MemorySwitch {
    dpid: u64,
    version: u8,
    table: Mutex<HashMap<(u16, FlowMatch), FlowEntry>>,
    history: Mutex<Vec<FlowMod>>,
    ports: Mutex<Vec<PortStat>>,
    failures: AtomicUsize,
}

impl MemorySwitch {
    /// OpenFlow 1.3 switch
    pub fn new(dpid: u64) -> Self {
        Self::with_version(dpid, OFP_VERSION_1_3)
    }

    /// Switch speaking another wire version
    pub fn with_version(dpid: u64, version: u8) -> Self {
        Self {
            dpid,
            version,
            table: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        }
    }

    /// Installed rules
    pub fn rules(&self) -> Vec<FlowRule> {
        self.table.lock().values().map(|e| e.rule.clone()).collect()
    }

    /// Number of installed rules
    pub fn rule_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Every flow-mod applied so far, in order
    pub fn history(&self) -> Vec<FlowMod> {
        self.history.lock().clone()
    }

    /// Reject the next `n` flow-mods
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Account traffic against every installed rule
    pub fn count_packets(&self, packets: u64) {
        for entry in self.table.lock().values_mut() {
            entry.packet_count = entry.packet_count.saturating_add(packets);
            entry.byte_count = entry.byte_count.saturating_add(packets.saturating_mul(64));
        }
    }

    /// Replace reported port counters
    pub fn set_port_stats(&self, ports: Vec<PortStat>) {
        *self.ports.lock() = ports;
    }
}

#[async_trait]
impl SwitchHandle for MemorySwitch {
    fn dpid(&self) -> u64 {
        self.dpid
    }

    fn protocol_version(&self) -> u8 {
        self.version
    }

    async fn apply(&self, flow_mod: &FlowMod) -> Result<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(SteerError::InstallFailure(format!(
                "dpid={}: rejected {}",
                format_dpid(self.dpid),
                flow_mod.rule.match_spec()
            )));
        }

        let key = (flow_mod.rule.priority, flow_mod.rule.matches.clone());
        let mut table = self.table.lock();
        match flow_mod.command {
            FlowCommand::Add => {
                table.insert(
                    key,
                    FlowEntry {
                        rule: flow_mod.rule.clone(),
                        packet_count: 0,
                        byte_count: 0,
                    },
                );
            }
            FlowCommand::DeleteStrict => {
                table.remove(&key);
            }
        }
        self.history.lock().push(flow_mod.clone());
        Ok(())
    }

    async fn flow_stats(&self) -> Result<Vec<FlowStat>> {
        Ok(self
            .table
            .lock()
            .values()
            .map(|e| FlowStat {
                priority: e.rule.priority,
                in_port: Some(e.rule.matches.in_port.to_string()),
                packet_count: e.packet_count,
                byte_count: e.byte_count,
            })
            .collect())
    }

    async fn port_stats(&self) -> Result<Vec<PortStat>> {
        Ok(self.ports.lock().clone())
    }
}

/// Attach one in-memory switch per configured target.
pub async fn attach_memory_switches(targets: &[SwitchTarget], events: &mpsc::Sender<SwitchEvent>) {
    for target in targets {
        let dpid = match parse_dpid(&target.dpid) {
            Ok(dpid) => dpid,
            Err(_) => {
                warn!("Skipping switch with invalid dpid {:?}", target.dpid);
                continue;
            }
        };
        info!("Attaching in-memory switch {}", format_dpid(dpid));
        let handle: Arc<dyn SwitchHandle> = Arc::new(MemorySwitch::new(dpid));
        if events.send(SwitchEvent::Attached(handle)).await.is_err() {
            warn!("Switch registry stopped; in-memory switches not attached");
            return;
        }
    }
}
