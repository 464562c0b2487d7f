//! Switch Registry
//!
//! Tracks which switches are attached, keyed by datapath id. The table is
//! mutated only by attach/detach events and read by everything else.

use crate::switch::{format_dpid, parse_dpid, SwitchHandle, OFP_VERSION_1_3};
use crate::{Result, SteerError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Switch lifecycle notification from a driver
pub enum SwitchEvent {
    /// Handshake completed
    Attached(Arc<dyn SwitchHandle>),
    /// Connection lost
    Detached(u64),
}

/// Attached switches
#[derive(Default)]
pub struct SwitchRegistry {
    switches: RwLock<HashMap<u64, Arc<dyn SwitchHandle>>>,
}

impl SwitchRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attached switch. Only OpenFlow 1.3 switches are kept.
    pub fn on_attach(&self, handle: Arc<dyn SwitchHandle>) -> bool {
        let dpid = handle.dpid();
        let version = handle.protocol_version();
        if version != OFP_VERSION_1_3 {
            info!(
                "Ignoring switch {}: OpenFlow version {:#04x} not supported",
                format_dpid(dpid),
                version
            );
            return false;
        }

        if self.switches.write().insert(dpid, handle).is_some() {
            info!("Switch {} re-attached", format_dpid(dpid));
        } else {
            info!("Switch {} attached", format_dpid(dpid));
        }
        true
    }

    /// Forget a switch. Unknown ids are ignored.
    pub fn on_detach(&self, dpid: u64) -> bool {
        let removed = self.switches.write().remove(&dpid).is_some();
        if removed {
            info!("Switch {} detached", format_dpid(dpid));
        }
        removed
    }

    /// Resolve a textual datapath id to an attached switch.
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn SwitchHandle>> {
        let switches = self.switches.read();
        if switches.is_empty() {
            return Err(SteerError::NoSwitchConnected);
        }
        let dpid = parse_dpid(reference)?;
        switches
            .get(&dpid)
            .cloned()
            .ok_or_else(|| SteerError::NotConnected(reference.to_string()))
    }

    /// Whether a switch is attached
    pub fn is_connected(&self, dpid: u64) -> bool {
        self.switches.read().contains_key(&dpid)
    }

    /// Snapshot of attached switches
    pub fn connected(&self) -> Vec<Arc<dyn SwitchHandle>> {
        self.switches.read().values().cloned().collect()
    }

    /// Attached datapath ids, ascending
    pub fn dpids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.switches.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Apply driver events until every sender is gone.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<SwitchEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SwitchEvent::Attached(handle) => {
                    self.on_attach(handle);
                }
                SwitchEvent::Detached(dpid) => {
                    if !self.on_detach(dpid) {
                        warn!("Detach for unknown switch {}", format_dpid(dpid));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::MemorySwitch;

    #[test]
    fn test_attach_and_resolve() {
        let registry = SwitchRegistry::new();
        assert!(registry.on_attach(Arc::new(MemorySwitch::new(1))));

        let handle = registry.resolve("0000000000000001").unwrap();
        assert_eq!(handle.dpid(), 1);
        tokio_test::assert_ok!(registry.resolve("1"));
    }

    #[test]
    fn test_resolve_errors() {
        let registry = SwitchRegistry::new();
        assert!(matches!(registry.resolve("1"), Err(SteerError::NoSwitchConnected)));

        registry.on_attach(Arc::new(MemorySwitch::new(1)));
        assert!(matches!(registry.resolve(""), Err(SteerError::InvalidReference(_))));
        assert!(matches!(registry.resolve("zz"), Err(SteerError::InvalidReference(_))));
        match registry.resolve("0000000000000002") {
            Err(e @ SteerError::NotConnected(_)) => {
                assert_eq!(
                    e.to_string(),
                    "forwarding sw is not connected. : switchID=0000000000000002"
                );
            }
            _ => panic!("expected NotConnected"),
        }
    }

    #[test]
    fn test_only_openflow_13_kept() {
        let registry = SwitchRegistry::new();
        assert!(!registry.on_attach(Arc::new(MemorySwitch::with_version(3, 0x01))));
        assert!(!registry.is_connected(3));
        assert!(matches!(registry.resolve("3"), Err(SteerError::NoSwitchConnected)));
    }

    #[test]
    fn test_reattach_replaces_handle() {
        let registry = SwitchRegistry::new();
        let first = Arc::new(MemorySwitch::new(5));
        let second = Arc::new(MemorySwitch::new(5));
        registry.on_attach(first);
        registry.on_attach(second.clone());

        assert_eq!(registry.connected().len(), 1);
        let resolved = registry.resolve("5").unwrap();
        let expected: Arc<dyn SwitchHandle> = second;
        assert!(Arc::ptr_eq(&resolved, &expected));
    }

    #[tokio::test]
    async fn test_event_loop() {
        let registry = Arc::new(SwitchRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(registry.clone().run_events(rx));

        tx.send(SwitchEvent::Attached(Arc::new(MemorySwitch::new(2)))).await.unwrap();
        tx.send(SwitchEvent::Attached(Arc::new(MemorySwitch::new(1)))).await.unwrap();
        tx.send(SwitchEvent::Detached(2)).await.unwrap();
        tx.send(SwitchEvent::Detached(9)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(registry.dpids(), vec![1]);
    }
}
