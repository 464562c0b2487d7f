//! OpenSASE Steer - SLA-driven OpenFlow channel controller
//!
//! Compiles declarative channels (a pair of endpoints bound to an SLA id) into
//! bidirectional OpenFlow rules, keeps them installed on the switches that are
//! currently attached, and forwards key material to the service endpoints of
//! the active SLA.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          OPENSASE STEER                                 │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │                      CONTROL GATEWAY (HTTP)                       │  │
//! │  │  /status | /channels | /channel | /ovs | /activate | /qkey        │  │
//! │  └──────┬──────────────────────┬────────────────────────┬────────────┘  │
//! │         │                      │                        │               │
//! │  ┌──────▼────────┐   ┌─────────▼─────────┐   ┌──────────▼───────────┐   │
//! │  │ CHANNEL STORE │   │  STATS COLLECTOR  │   │     SLA ROUTER       │   │
//! │  │ policy + JSON │   │  10s flow polls   │   │ key fan-out per SLA  │   │
//! │  └──────┬────────┘   └─────────┬─────────┘   └──────────────────────┘   │
//! │         │ flow compiler        │                                        │
//! │  ┌──────▼──────────────────────▼─────────────────────────────────────┐  │
//! │  │                        SWITCH REGISTRY                            │  │
//! │  │        attached OpenFlow 1.3 switches (ovs-ofctl / memory)        │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod flow;
pub mod model;
pub mod ofctl;
pub mod registry;
pub mod sla;
pub mod stats;
pub mod store;
pub mod switch;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use config::{ControllerConfig, DriverKind};
pub use model::{Channel, PolicyDocument, SwitchDescriptor};
pub use registry::{SwitchEvent, SwitchRegistry};
pub use sla::SlaRouter;
pub use stats::StatsCollector;
pub use store::ChannelStore;

/// Which side of a channel a rule set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Rules on the switch named by `src.ovs`
    Source,
    /// Rules on the switch named by `dst.ovs`
    Destination,
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Source => f.write_str("source"),
            Leg::Destination => f.write_str("destination"),
        }
    }
}

/// Controller error types
#[derive(Debug, Error)]
pub enum SteerError {
    #[error("Invalid switchID.")]
    InvalidReference(String),

    #[error("forwarding sw is not connected.")]
    NoSwitchConnected,

    #[error("forwarding sw is not connected. : switchID={0}")]
    NotConnected(String),

    #[error("channel doesn't exists")]
    ChannelNotFound(String),

    #[error("unknown ovs: {0}")]
    UnknownSwitch(String),

    #[error("ovs {switch}: no port for {what}")]
    UnresolvedPort { switch: String, what: String },

    #[error("Cannot find sla_id: {0}")]
    UnresolvedSla(String),

    #[error("Invalid rule parameter. ({0})")]
    InstallFailure(String),

    #[error("URL {url}: can't connect")]
    DeliveryFailure { url: String, reason: String },

    #[error("persistence error: {0}")]
    PersistenceFailure(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("channel {channel}: {leg} leg failed: {source}")]
    LegFailure {
        channel: String,
        leg: Leg,
        #[source]
        source: Box<SteerError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SteerError {
    /// Attribute an error to one leg of a channel.
    pub fn on_leg(self, channel: &str, leg: Leg) -> Self {
        SteerError::LegFailure {
            channel: channel.to_string(),
            leg,
            source: Box::new(self),
        }
    }
}

/// Result type for the controller
pub type Result<T> = std::result::Result<T, SteerError>;

/// Process-scoped coordinator owning every component.
pub struct SteerController {
    /// Configuration
    pub config: ControllerConfig,
    /// Attached switches
    pub registry: Arc<SwitchRegistry>,
    /// Channel and switch policy
    pub store: Arc<ChannelStore>,
    /// Flow and port counters
    pub stats: Arc<StatsCollector>,
    /// Key forwarding
    pub sla: Arc<SlaRouter>,
    events_tx: mpsc::Sender<SwitchEvent>,
    events_rx: Option<mpsc::Receiver<SwitchEvent>>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Stops a running controller from outside
#[derive(Clone)]
pub struct Stopper(Arc<watch::Sender<bool>>);

impl Stopper {
    /// Ask background tasks to stop after their current cycle and the
    /// HTTP server to drain.
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

impl SteerController {
    /// Build the controller and load persisted policy.
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        let registry = Arc::new(SwitchRegistry::new());
        let backend = Arc::new(store::JsonFileBackend::new(
            &config.rules_path,
            &config.rules_default_path,
        ));
        let store = Arc::new(
            ChannelStore::open(registry.clone(), backend, config.install_timeout()).await,
        );
        let stats = Arc::new(StatsCollector::new(config.install_timeout()));
        let sla = Arc::new(SlaRouter::new(store.clone(), config.forward_timeout())?);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        Ok(Self {
            config,
            registry,
            store,
            stats,
            sla,
            events_tx,
            events_rx: Some(events_rx),
            shutdown,
        })
    }

    /// Sender for switch attach/detach notifications.
    pub fn events(&self) -> mpsc::Sender<SwitchEvent> {
        self.events_tx.clone()
    }

    /// Handle that stops `run`
    pub fn stopper(&self) -> Stopper {
        Stopper(self.shutdown.clone())
    }

    /// Run registry, driver, statistics and HTTP tasks until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| SteerError::MalformedRequest(format!("listen_addr: {}", e)))?;
        let events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| SteerError::MalformedRequest("controller already running".into()))?;
        let registry_task = tokio::spawn(self.registry.clone().run_events(events_rx));

        let driver_task = match self.config.driver {
            DriverKind::Ofctl => {
                let monitor = ofctl::OfctlMonitor::new(
                    Arc::new(ofctl::Ofctl::new(
                        &self.config.ofctl_path,
                        self.config.install_timeout(),
                    )),
                    self.config.switches.clone(),
                    Duration::from_secs(self.config.probe_interval_secs),
                );
                tokio::spawn(monitor.run(self.events_tx.clone(), self.shutdown.subscribe()))
            }
            DriverKind::Memory => {
                let events = self.events_tx.clone();
                let switches = self.config.switches.clone();
                tokio::spawn(async move { switch::attach_memory_switches(&switches, &events).await })
            }
        };

        let stats_task = tokio::spawn(self.stats.clone().run(
            self.registry.clone(),
            Duration::from_secs(self.config.stats_interval_secs),
            self.shutdown.subscribe(),
        ));

        let state = api::ApiState {
            registry: self.registry.clone(),
            store: self.store.clone(),
            stats: self.stats.clone(),
            sla: self.sla.clone(),
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        let signal = async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down"),
                _ = shutdown_rx.changed() => {},
            }
        };
        let served = api::serve(addr, state, signal).await;

        self.stopper().stop();
        drop(self.events_tx);
        let _ = stats_task.await;
        let _ = driver_task.await;
        registry_task.abort();

        served
    }
}
