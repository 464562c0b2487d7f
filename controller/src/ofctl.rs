//! Open vSwitch Driver
//!
//! Programs switches through the `ovs-ofctl` CLI and watches configured
//! targets for attach/detach.

use crate::config::SwitchTarget;
use crate::flow::{FlowCommand, FlowMod};
use crate::registry::SwitchEvent;
use crate::switch::{format_dpid, parse_dpid, FlowStat, PortStat, SwitchHandle};
use crate::{Result, SteerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Protocols offered when probing, so the reply names the negotiated one
const PROBE_PROTOCOLS: &str = "OpenFlow10,OpenFlow11,OpenFlow12,OpenFlow13,OpenFlow14,OpenFlow15";

/// `ovs-ofctl` invoker
pub struct Ofctl {
    binary: String,
    timeout: Duration,
}

impl Ofctl {
    /// Create invoker; every call is bounded by `timeout`
    pub fn new(binary: &str, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            timeout,
        }
    }

    /// Execute an OpenFlow 1.3 command
    pub async fn exec(&self, args: &[&str]) -> std::result::Result<String, String> {
        self.exec_with("OpenFlow13", args).await
    }

    async fn exec_with(&self, protocols: &str, args: &[&str]) -> std::result::Result<String, String> {
        let run = Command::new(&self.binary)
            .arg("-O")
            .arg(protocols)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| format!("{} {}: timed out after {:?}", self.binary, args.join(" "), self.timeout))?
            .map_err(|e| format!("{} exec error: {}", self.binary, e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(format!(
                "{} {}: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }

    /// Datapath id and negotiated version of a target
    pub async fn probe(&self, target: &str) -> std::result::Result<(u64, u8), String> {
        let output = self.exec_with(PROBE_PROTOCOLS, &["show", target]).await?;
        parse_features(&output).ok_or_else(|| format!("{}: unrecognised features reply", target))
    }
}

/// Switch programmed through `ovs-ofctl`
pub struct OfctlSwitch {
    dpid: u64,
    version: u8,
    target: String,
    ofctl: Arc<Ofctl>,
}

impl OfctlSwitch {
    /// Handle for a probed target
    pub fn new(dpid: u64, version: u8, target: &str, ofctl: Arc<Ofctl>) -> Self {
        Self {
            dpid,
            version,
            target: target.to_string(),
            ofctl,
        }
    }
}

#[async_trait]
impl SwitchHandle for OfctlSwitch {
    fn dpid(&self) -> u64 {
        self.dpid
    }

    fn protocol_version(&self) -> u8 {
        self.version
    }

    async fn apply(&self, flow_mod: &FlowMod) -> Result<()> {
        let result = match flow_mod.command {
            FlowCommand::Add => {
                let spec = flow_mod.rule.flow_spec();
                self.ofctl.exec(&["add-flow", &self.target, &spec]).await
            }
            FlowCommand::DeleteStrict => {
                let spec = flow_mod.rule.match_spec();
                self.ofctl.exec(&["del-flows", "--strict", &self.target, &spec]).await
            }
        };
        result.map(|_| ()).map_err(SteerError::InstallFailure)
    }

    async fn flow_stats(&self) -> Result<Vec<FlowStat>> {
        let output = self.ofctl.exec(&["dump-flows", &self.target]).await.map_err(stats_error)?;
        Ok(parse_flow_stats(&output))
    }

    async fn port_stats(&self) -> Result<Vec<PortStat>> {
        let output = self.ofctl.exec(&["dump-ports", &self.target]).await.map_err(stats_error)?;
        Ok(parse_port_stats(&output))
    }
}

fn stats_error(msg: String) -> SteerError {
    SteerError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
}

/// Periodic reachability probe over the configured targets
pub struct OfctlMonitor {
    ofctl: Arc<Ofctl>,
    targets: Vec<SwitchTarget>,
    interval: Duration,
}

impl OfctlMonitor {
    /// Targets without an ovs-ofctl address are ignored
    pub fn new(ofctl: Arc<Ofctl>, targets: Vec<SwitchTarget>, interval: Duration) -> Self {
        let targets = targets
            .into_iter()
            .filter(|t| {
                if t.target.is_empty() {
                    warn!("Switch {} has no ovs-ofctl target, not monitored", t.dpid);
                }
                !t.target.is_empty()
            })
            .collect();
        Self {
            ofctl,
            targets,
            interval,
        }
    }

    /// Probe every target each interval, reporting transitions, until shutdown.
    pub async fn run(self, events: mpsc::Sender<SwitchEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut attached: HashMap<String, u64> = HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Monitoring {} switches via ovs-ofctl", self.targets.len());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            for target in &self.targets {
                let event = match self.ofctl.probe(&target.target).await {
                    Ok((dpid, version)) if !attached.contains_key(&target.target) => {
                        if parse_dpid(&target.dpid).ok() != Some(dpid) {
                            warn!(
                                "{} reports dpid {}, configured as {}",
                                target.target,
                                format_dpid(dpid),
                                target.dpid
                            );
                        }
                        attached.insert(target.target.clone(), dpid);
                        let handle = OfctlSwitch::new(dpid, version, &target.target, self.ofctl.clone());
                        Some(SwitchEvent::Attached(Arc::new(handle)))
                    }
                    Ok(_) => None,
                    Err(e) => match attached.remove(&target.target) {
                        Some(dpid) => {
                            warn!("Lost {}: {}", target.target, e);
                            Some(SwitchEvent::Detached(dpid))
                        }
                        None => {
                            debug!("{} not reachable: {}", target.target, e);
                            None
                        }
                    },
                };

                if let Some(event) = event {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }

        info!("Switch monitor stopped");
    }
}

/// Parse `dpid:` and the `(OF1.x)` marker out of a `show` reply.
pub fn parse_features(output: &str) -> Option<(u64, u8)> {
    let header = output.lines().find(|l| l.contains("FEATURES_REPLY"))?;

    let dpid = header.split("dpid:").nth(1)?.trim();
    let dpid = u64::from_str_radix(dpid.get(..16).unwrap_or(dpid), 16).ok()?;

    let minor = header.split("(OF1.").nth(1)?.split(')').next()?;
    let version = minor.parse::<u8>().ok()? + 1;

    Some((dpid, version))
}

/// Parse a `dump-flows` reply.
pub fn parse_flow_stats(output: &str) -> Vec<FlowStat> {
    output
        .lines()
        .filter(|line| line.contains("n_packets="))
        .map(|line| {
            let fields = line.split(" actions=").next().unwrap_or(line);
            let mut stat = FlowStat {
                // OFP_DEFAULT_PRIORITY is omitted from dumps
                priority: 0x8000,
                in_port: None,
                packet_count: 0,
                byte_count: 0,
            };
            for token in fields.split(|c: char| c == ',' || c.is_whitespace()) {
                let Some((key, value)) = token.split_once('=') else {
                    continue;
                };
                match key {
                    "n_packets" => stat.packet_count = value.parse().unwrap_or(0),
                    "n_bytes" => stat.byte_count = value.parse().unwrap_or(0),
                    "priority" => stat.priority = value.parse().unwrap_or(stat.priority),
                    "in_port" => stat.in_port = Some(value.trim_matches('"').to_string()),
                    _ => {}
                }
            }
            stat
        })
        .collect()
}

/// Parse a `dump-ports` reply.
pub fn parse_port_stats(output: &str) -> Vec<PortStat> {
    let mut ports: Vec<PortStat> = Vec::new();
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("port ") {
            let Some((name, counters)) = rest.split_once(':') else {
                continue;
            };
            let (packets, bytes) = counters_after(counters, "rx");
            ports.push(PortStat {
                port: name.trim().trim_matches('"').to_string(),
                rx_packets: packets,
                rx_bytes: bytes,
                ..Default::default()
            });
        } else if line.starts_with("tx ") {
            if let Some(port) = ports.last_mut() {
                let (packets, bytes) = counters_after(line, "tx");
                port.tx_packets = packets;
                port.tx_bytes = bytes;
            }
        }
    }
    ports
}

/// `pkts=` and `bytes=` following a direction marker; `?` counts as 0
fn counters_after(text: &str, direction: &str) -> (u64, u64) {
    let section = text.trim().strip_prefix(direction).unwrap_or(text);
    let mut packets = 0;
    let mut bytes = 0;
    for token in section.split(',') {
        match token.trim().split_once('=') {
            Some(("pkts", v)) => packets = v.parse().unwrap_or(0),
            Some(("bytes", v)) => bytes = v.parse().unwrap_or(0),
            _ => {}
        }
    }
    (packets, bytes)
}
