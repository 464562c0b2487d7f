//! Statistics Collector
//!
//! Periodically polls every attached switch for flow and port counters.
//! Each poll replaces the switch's entry; nothing accumulates across polls.

use crate::flow::CHANNEL_PRIORITY;
use crate::registry::SwitchRegistry;
use crate::switch::{format_dpid, PortStat, SwitchHandle};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Last poll result for one switch
#[derive(Debug, Clone, Serialize)]
pub struct SwitchStats {
    /// Datapath id, 16 hex digits
    pub dpid: String,
    /// Packets matched by channel rules
    pub packets: u64,
    /// Port counters
    pub ports: Vec<PortStat>,
    /// When the reply arrived
    pub polled_at: DateTime<Utc>,
}

/// Per-switch counters, fed by a background poll loop
pub struct StatsCollector {
    entries: RwLock<BTreeMap<u64, SwitchStats>>,
    timeout: Duration,
}

impl StatsCollector {
    /// Create collector; `timeout` bounds each switch's replies
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            timeout,
        }
    }

    /// Sum of last-polled channel packet counts over all switches
    pub fn total_packets(&self) -> u64 {
        self.entries.read().values().map(|s| s.packets).sum()
    }

    /// Last poll result per switch, by dpid
    pub fn snapshot(&self) -> Vec<SwitchStats> {
        self.entries.read().values().cloned().collect()
    }

    /// Poll every attached switch once, concurrently. Entries of switches
    /// that are no longer attached are dropped.
    pub async fn poll_once(&self, registry: &SwitchRegistry) {
        let switches = registry.connected();
        let live: HashSet<u64> = switches.iter().map(|switch| switch.dpid()).collect();
        let polls = switches.iter().map(|switch| self.poll_switch(switch.as_ref()));
        let results = join_all(polls).await;

        let mut entries = self.entries.write();
        entries.retain(|dpid, _| live.contains(dpid));
        for (dpid, stats) in results.into_iter().flatten() {
            debug!("Switch {}: {} channel packets", stats.dpid, stats.packets);
            entries.insert(dpid, stats);
        }
    }

    async fn poll_switch(&self, switch: &dyn SwitchHandle) -> Option<(u64, SwitchStats)> {
        let id = switch.dpid();
        let dpid = format_dpid(id);
        let replies = tokio::time::timeout(self.timeout, async {
            let flows = switch.flow_stats().await?;
            let ports = switch.port_stats().await?;
            Ok::<_, crate::SteerError>((flows, ports))
        })
        .await;

        match replies {
            Ok(Ok((flows, ports))) => Some((
                id,
                SwitchStats {
                    packets: flows
                        .iter()
                        .filter(|f| f.priority == CHANNEL_PRIORITY)
                        .map(|f| f.packet_count)
                        .sum(),
                    dpid,
                    ports,
                    polled_at: Utc::now(),
                },
            )),
            Ok(Err(e)) => {
                warn!("Statistics from {} failed: {}", dpid, e);
                None
            }
            Err(_) => {
                warn!("Statistics from {} timed out", dpid);
                None
            }
        }
    }

    /// Poll on a fixed interval until shutdown is signalled. A poll that
    /// has started always runs to completion.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<SwitchRegistry>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Statistics collector started ({:?} interval)", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.poll_once(&registry).await;
        }

        info!("Statistics collector stopped");
    }
}
