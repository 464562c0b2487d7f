//! Channel Store
//!
//! Authoritative copy of the policy document. Every mutation is serialized
//! behind one gate, pushes its remove/install rules through the registry, and
//! is persisted before it becomes visible to readers.

use crate::flow::{compile, Addressing, FlowCommand, LegSpec};
use crate::model::{Channel, Key, PolicyDocument, SwitchDescriptor};
use crate::registry::SwitchRegistry;
use crate::switch::apply_with_timeout;
use crate::{Leg, Result, SteerError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LEGS: [Leg; 2] = [Leg::Source, Leg::Destination];

/// Durable home of the policy document
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Load the stored document. Never fails: unreadable state is empty state.
    async fn load(&self) -> PolicyDocument;

    /// Replace the stored document
    async fn save(&self, doc: &PolicyDocument) -> Result<()>;
}

/// JSON file with a read-only seed document
pub struct JsonFileBackend {
    path: PathBuf,
    default_path: PathBuf,
}

impl JsonFileBackend {
    /// Primary document plus the seed read when the primary is absent
    pub fn new(path: impl AsRef<Path>, default_path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            default_path: default_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PolicyBackend for JsonFileBackend {
    async fn load(&self) -> PolicyDocument {
        let (source, content) = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => (&self.path, content),
            Err(e) => {
                debug!("Policy {} unreadable: {}", self.path.display(), e);
                match tokio::fs::read_to_string(&self.default_path).await {
                    Ok(content) => (&self.default_path, content),
                    Err(_) => {
                        info!(
                            "No policy at {} or {}, starting empty",
                            self.path.display(),
                            self.default_path.display()
                        );
                        return PolicyDocument::default();
                    }
                }
            }
        };

        match PolicyDocument::from_json(&content) {
            Ok(doc) => {
                info!(
                    "Loaded policy from {}: {} switches, {} channels",
                    source.display(),
                    doc.ovs.len(),
                    doc.channels.len()
                );
                doc
            }
            Err(e) => {
                error!("Ignoring policy {}: {}", source.display(), e);
                PolicyDocument::default()
            }
        }
    }

    async fn save(&self, doc: &PolicyDocument) -> Result<()> {
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| SteerError::PersistenceFailure(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| SteerError::PersistenceFailure(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SteerError::PersistenceFailure(format!("{}: {}", self.path.display(), e)))
    }
}

/// Backend kept in memory, with failure injection
#[derive(Default)]
pub struct MemoryBackend {
    doc: Mutex<PolicyDocument>,
    fail: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryBackend {
    /// Start from a document
    pub fn new(doc: PolicyDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
            ..Default::default()
        }
    }

    /// Make every following save fail (or succeed again)
    pub fn fail_saves(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Last saved document
    pub fn saved(&self) -> PolicyDocument {
        self.doc.lock().clone()
    }

    /// Successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyBackend for MemoryBackend {
    async fn load(&self) -> PolicyDocument {
        self.doc.lock().clone()
    }

    async fn save(&self, doc: &PolicyDocument) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SteerError::PersistenceFailure("backend unavailable".into()));
        }
        *self.doc.lock() = doc.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome of a bulk activation
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationReport {
    /// Channels whose rules are in place
    pub installed: Vec<String>,
    /// Channels that could not be installed
    pub failed: Vec<ActivationFailure>,
}

/// One channel that failed to activate
#[derive(Debug, Clone, Serialize)]
pub struct ActivationFailure {
    /// Channel id
    pub id: String,
    /// Why the install was refused
    pub error: String,
}

/// One leg with its ports resolved
#[derive(Clone)]
struct LegPlan {
    dpid: String,
    spec: LegSpec,
}

/// Rule pushes made by one mutation, in order
#[derive(Default)]
struct Journal(Vec<(LegPlan, FlowCommand)>);

/// Policy state plus the rule pushes that realize it
pub struct ChannelStore {
    doc: RwLock<PolicyDocument>,
    gate: tokio::sync::Mutex<()>,
    registry: Arc<SwitchRegistry>,
    backend: Arc<dyn PolicyBackend>,
    install_timeout: Duration,
}

impl ChannelStore {
    /// Load the stored policy. Nothing is installed until `activate_all`.
    pub async fn open(
        registry: Arc<SwitchRegistry>,
        backend: Arc<dyn PolicyBackend>,
        install_timeout: Duration,
    ) -> Self {
        let doc = backend.load().await;
        Self {
            doc: RwLock::new(doc),
            gate: tokio::sync::Mutex::new(()),
            registry,
            backend,
            install_timeout,
        }
    }

    /// Number of configured channels
    pub fn channel_count(&self) -> usize {
        self.doc.read().channels.len()
    }

    /// One channel definition
    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.doc.read().channels.get(id).cloned()
    }

    /// One switch descriptor
    pub fn switch(&self, id: &str) -> Option<SwitchDescriptor> {
        self.doc.read().ovs.get(id).cloned()
    }

    /// Consistent copy of the whole document
    pub fn snapshot(&self) -> PolicyDocument {
        self.doc.read().clone()
    }

    /// Replace-and-install a batch of channels, persisting once at the end.
    ///
    /// Channels are processed in id order. If one fails, the channels before
    /// it stay applied and are persisted, and its error is returned.
    pub async fn upsert_channels(&self, batch: BTreeMap<String, Channel>) -> Result<Vec<String>> {
        for (id, channel) in &batch {
            channel.validate(id)?;
        }

        let _gate = self.gate.lock().await;
        let mut working = self.snapshot();
        let mut journal = Journal::default();
        let mut applied = Vec::with_capacity(batch.len());
        let mut failure = None;

        for (id, channel) in batch {
            if let Some(old) = working.channels.get(&id).cloned() {
                if let Err(e) = self.remove_binding(&working, &id, &old, &mut journal).await {
                    failure = Some(e);
                    break;
                }
            }
            working.channels.insert(id.clone(), channel.clone());
            if channel.is_active() {
                if let Err(e) = self
                    .install_binding(&working, &id, &channel, &channel.sla, &mut journal)
                    .await
                {
                    failure = Some(e);
                    break;
                }
            }
            info!("Channel {} configured (sla={}, active={})", id, channel.sla, channel.is_active());
            applied.push(id);
        }

        self.commit(working, journal).await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    /// Shallow per-key merge of switch descriptors.
    pub async fn update_switches(&self, partial: BTreeMap<String, SwitchDescriptor>) -> Result<()> {
        for (id, switch) in &partial {
            switch.validate(id)?;
        }

        let _gate = self.gate.lock().await;
        let mut working = self.snapshot();
        let ids: Vec<String> = partial.keys().cloned().collect();
        working.ovs.extend(partial);
        self.commit(working, Journal::default()).await?;
        info!("Switch descriptors updated: {:?}", ids);
        Ok(())
    }

    /// Install every active channel. Safe to repeat; nothing is persisted.
    pub async fn activate_all(&self) -> ActivationReport {
        let _gate = self.gate.lock().await;
        let doc = self.snapshot();
        let mut report = ActivationReport::default();

        for (id, channel) in doc.channels.iter().filter(|(_, c)| c.is_active()) {
            // Nothing is persisted, so there is nothing to undo
            let mut journal = Journal::default();
            match self.install_binding(&doc, id, channel, &channel.sla, &mut journal).await {
                Ok(()) => report.installed.push(id.clone()),
                Err(e) => {
                    warn!("Activation of channel {} failed: {}", id, e);
                    report.failed.push(ActivationFailure {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Activated {} channels ({} failed)",
            report.installed.len(),
            report.failed.len()
        );
        report
    }

    /// Rebind a channel to another SLA; `"0"` deactivates it.
    pub async fn set_channel_sla(&self, id: &str, sla: &str) -> Result<()> {
        let _gate = self.gate.lock().await;
        let mut working = self.snapshot();
        let channel = working
            .channels
            .get(id)
            .cloned()
            .ok_or_else(|| SteerError::ChannelNotFound(id.to_string()))?;

        let new_sla = Key::from(sla);
        let deactivate = sla == "0";
        if !deactivate {
            // Refuse before touching the switches if the new SLA has no port
            for leg in LEGS {
                self.plan_leg(&working, &channel, leg, &new_sla)
                    .map_err(|e| e.on_leg(id, leg))?;
            }
        }

        let mut journal = Journal::default();
        if let Err(e) = self.remove_binding(&working, id, &channel, &mut journal).await {
            self.rollback(journal).await;
            return Err(e);
        }

        let mut updated = channel;
        if deactivate {
            updated.active.0 = false;
        } else {
            updated.active.0 = true;
            updated.sla = new_sla;
        }
        working.channels.insert(id.to_string(), updated.clone());

        let installed = if deactivate {
            Ok(())
        } else {
            self.install_binding(&working, id, &updated, &updated.sla, &mut journal)
                .await
        };

        self.commit(working, journal).await?;
        installed?;
        info!("Channel {} switched to sla {}", id, sla);
        Ok(())
    }

    /// Persist, then publish to readers. If the save fails, the rule pushes
    /// in `journal` are reverted so the switches match the kept state.
    async fn commit(&self, working: PolicyDocument, journal: Journal) -> Result<()> {
        if let Err(e) = self.backend.save(&working).await {
            error!("Policy not persisted, keeping previous state: {}", e);
            self.rollback(journal).await;
            return Err(e);
        }
        *self.doc.write() = working;
        Ok(())
    }

    /// Invert recorded pushes, newest first. Best effort.
    async fn rollback(&self, journal: Journal) {
        for (plan, command) in journal.0.into_iter().rev() {
            let inverse = match command {
                FlowCommand::Add => FlowCommand::DeleteStrict,
                FlowCommand::DeleteStrict => FlowCommand::Add,
            };
            if let Err(e) = self.apply_plan(&plan, inverse).await {
                error!("Rollback on {} incomplete: {}", plan.dpid, e);
            }
        }
    }

    /// Strict-delete the rules of a channel's current binding, if active.
    async fn remove_binding(
        &self,
        doc: &PolicyDocument,
        id: &str,
        channel: &Channel,
        journal: &mut Journal,
    ) -> Result<()> {
        if !channel.is_active() {
            return Ok(());
        }
        for leg in LEGS {
            match self.plan_leg(doc, channel, leg, &channel.sla) {
                Ok(plan) => self
                    .push(plan, FlowCommand::DeleteStrict, journal)
                    .await
                    .map_err(|e| e.on_leg(id, leg))?,
                Err(e) => warn!("Channel {}: {} leg of old binding not removed: {}", id, leg, e),
            }
        }
        Ok(())
    }

    /// Install both legs under `sla`, source first.
    async fn install_binding(
        &self,
        doc: &PolicyDocument,
        id: &str,
        channel: &Channel,
        sla: &Key,
        journal: &mut Journal,
    ) -> Result<()> {
        for leg in LEGS {
            let plan = self
                .plan_leg(doc, channel, leg, sla)
                .map_err(|e| e.on_leg(id, leg))?;
            self.push(plan, FlowCommand::Add, journal)
                .await
                .map_err(|e| e.on_leg(id, leg))?;
        }
        Ok(())
    }

    fn plan_leg(&self, doc: &PolicyDocument, channel: &Channel, leg: Leg, sla: &Key) -> Result<LegPlan> {
        let (near, far) = match leg {
            Leg::Source => (&channel.src, &channel.dst),
            Leg::Destination => (&channel.dst, &channel.src),
        };
        let switch = doc.switch_for(near)?;

        let inport = switch
            .port_for_role(&near.role)
            .ok_or_else(|| SteerError::UnresolvedPort {
                switch: near.ovs.to_string(),
                what: format!("role {}", near.role),
            })?;
        let (outport, _) = switch
            .port_for_sla(&sla.to_string())
            .ok_or_else(|| SteerError::UnresolvedPort {
                switch: near.ovs.to_string(),
                what: format!("sla {}", sla),
            })?;

        Ok(LegPlan {
            dpid: switch.dpid.clone(),
            spec: LegSpec {
                inport,
                outport,
                local: Addressing {
                    subnet: near.network()?,
                    vlan: near.vlan,
                },
                remote: Addressing {
                    subnet: far.network()?,
                    vlan: far.vlan,
                },
            },
        })
    }

    /// Apply one leg and record it, including when it only partly applies.
    async fn push(&self, plan: LegPlan, command: FlowCommand, journal: &mut Journal) -> Result<()> {
        let result = self.apply_plan(&plan, command).await;
        journal.0.push((plan, command));
        result
    }

    async fn apply_plan(&self, plan: &LegPlan, command: FlowCommand) -> Result<()> {
        let handle = self.registry.resolve(&plan.dpid)?;
        let mods = compile(&plan.spec, command);
        for flow_mod in &mods {
            if let Err(e) = apply_with_timeout(handle.as_ref(), flow_mod, self.install_timeout).await {
                warn!(
                    "Failed to {} flow on {}: {}: {}",
                    command,
                    plan.dpid,
                    flow_mod.rule.match_spec(),
                    e
                );
                return Err(e);
            }
        }
        debug!("{} {} rules on {}", command, mods.len(), plan.dpid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowAction, FlowMod};
    use crate::model::{Endpoint, Flag};
    use crate::switch::MemorySwitch;

    const POLICY: &str = r#"{
        "ovs": {
            "1": {
                "dpid": "0000000000000001",
                "intport": {"1": {"type": "server"}},
                "outport": {"2": {"sla": "1", "mzvs": "1"}, "3": {"sla": "2", "mzvs": "2"}}
            },
            "2": {
                "dpid": "0000000000000002",
                "intport": {"1": {"type": "client"}},
                "outport": {"2": {"sla": "1", "mzvs": "1"}, "3": {"sla": "2", "mzvs": "2"}}
            }
        }
    }"#;

    struct Fixture {
        store: ChannelStore,
        registry: Arc<SwitchRegistry>,
        backend: Arc<MemoryBackend>,
        s1: Arc<MemorySwitch>,
        s2: Arc<MemorySwitch>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(SwitchRegistry::new());
        let s1 = Arc::new(MemorySwitch::new(1));
        let s2 = Arc::new(MemorySwitch::new(2));
        registry.on_attach(s1.clone());
        registry.on_attach(s2.clone());

        let backend = Arc::new(MemoryBackend::new(PolicyDocument::from_json(POLICY).unwrap()));
        let store = ChannelStore::open(registry.clone(), backend.clone(), Duration::from_secs(1)).await;
        Fixture { store, registry, backend, s1, s2 }
    }

    fn channel(sla: &str, active: bool, src_vlan: u16, dst_vlan: u16) -> Channel {
        Channel {
            src: Endpoint {
                ovs: Key::from("1"),
                subnet: "10.0.1.0/24".into(),
                vlan: src_vlan,
                role: "server".into(),
            },
            dst: Endpoint {
                ovs: Key::Number(2),
                subnet: "10.0.2.0/24".into(),
                vlan: dst_vlan,
                role: "client".into(),
            },
            sla: Key::from(sla),
            active: Flag(active),
        }
    }

    fn batch(id: &str, ch: Channel) -> BTreeMap<String, Channel> {
        BTreeMap::from([(id.to_string(), ch)])
    }

    fn outputs_to(switch: &MemorySwitch, port: u32) -> bool {
        let port = crate::model::PortNo::Number(port);
        switch.rules().iter().any(|r| {
            r.matches.in_port == port || r.actions.contains(&FlowAction::Output(port.clone()))
        })
    }

    #[tokio::test]
    async fn test_activation_installs_eight_rules() {
        let f = fixture().await;
        let applied = f.store.upsert_channels(batch("1", channel("1", true, 10, 20))).await.unwrap();

        assert_eq!(applied, vec!["1".to_string()]);
        assert_eq!(f.s1.rule_count(), 4);
        assert_eq!(f.s2.rule_count(), 4);
        for switch in [&f.s1, &f.s2] {
            let retagging: Vec<_> = switch
                .rules()
                .into_iter()
                .filter(|r| r.actions.contains(&FlowAction::PopVlan))
                .collect();
            assert_eq!(retagging.len(), 2);
            for rule in retagging {
                assert_eq!(rule.actions.iter().filter(|a| matches!(a, FlowAction::PushVlan(_))).count(), 1);
            }
        }
        assert_eq!(f.backend.saved().channels.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_removes_before_install() {
        let f = fixture().await;
        f.store.upsert_channels(batch("1", channel("1", true, 0, 0))).await.unwrap();
        f.store.upsert_channels(batch("1", channel("2", true, 0, 0))).await.unwrap();

        assert_eq!(f.store.channel_count(), 1);
        assert_eq!(f.s1.rule_count(), 4);
        assert!(outputs_to(&f.s1, 3));
        assert!(!outputs_to(&f.s1, 2));

        let history = f.s1.history();
        let commands: Vec<FlowCommand> = history.iter().map(|m: &FlowMod| m.command).collect();
        assert_eq!(&commands[4..8], &[FlowCommand::DeleteStrict; 4]);
        assert_eq!(&commands[8..], &[FlowCommand::Add; 4]);
    }

    #[tokio::test]
    async fn test_inactive_channel_is_stored_not_installed() {
        let f = fixture().await;
        f.store.upsert_channels(batch("4", channel("1", false, 0, 0))).await.unwrap();

        assert_eq!(f.store.channel_count(), 1);
        assert_eq!(f.s1.rule_count(), 0);
        assert_eq!(f.s2.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_sla_zero_deactivates() {
        let f = fixture().await;
        f.store.upsert_channels(batch("1", channel("1", true, 5, 5))).await.unwrap();
        f.store.set_channel_sla("1", "0").await.unwrap();

        assert_eq!(f.s1.rule_count(), 0);
        assert_eq!(f.s2.rule_count(), 0);
        let stored = f.store.channel("1").unwrap();
        assert!(!stored.is_active());
        assert_eq!(stored.sla, Key::from("1"));

        f.store.set_channel_sla("1", "2").await.unwrap();
        assert_eq!(f.s1.rule_count(), 4);
        assert!(outputs_to(&f.s2, 3));
        assert_eq!(f.backend.saved().channels["1"].sla, Key::from("2"));
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let f = fixture().await;
        let saves = f.backend.save_count();
        let err = f.store.set_channel_sla("9", "1").await.unwrap_err();

        assert!(matches!(err, SteerError::ChannelNotFound(_)));
        assert_eq!(f.backend.save_count(), saves);
        assert_eq!(f.store.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_sla_keeps_current_binding() {
        let f = fixture().await;
        f.store.upsert_channels(batch("1", channel("1", true, 0, 0))).await.unwrap();

        let err = f.store.set_channel_sla("1", "7").await.unwrap_err();
        assert!(matches!(err, SteerError::LegFailure { leg: Leg::Source, .. }));
        assert_eq!(f.s1.rule_count(), 4);
        assert_eq!(f.store.channel("1").unwrap().sla, Key::from("1"));
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_state_unchanged() {
        let f = fixture().await;
        f.backend.fail_saves(true);

        let err = f
            .store
            .upsert_channels(batch("1", channel("1", false, 0, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, SteerError::PersistenceFailure(_)));
        assert_eq!(f.store.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_reverts_sla_switch() {
        let f = fixture().await;
        f.store.upsert_channels(batch("1", channel("1", true, 0, 0))).await.unwrap();

        f.backend.fail_saves(true);
        let err = f.store.set_channel_sla("1", "2").await.unwrap_err();
        assert!(matches!(err, SteerError::PersistenceFailure(_)));
        assert_eq!(f.store.channel("1").unwrap().sla, Key::from("1"));
        for switch in [&f.s1, &f.s2] {
            assert_eq!(switch.rule_count(), 4);
            assert!(outputs_to(switch, 2));
            assert!(!outputs_to(switch, 3));
        }

        // The stored binding is still the one on the switches
        f.backend.fail_saves(false);
        f.store.set_channel_sla("1", "0").await.unwrap();
        assert_eq!(f.s1.rule_count(), 0);
        assert_eq!(f.s2.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_reverts_installed_channels() {
        let f = fixture().await;
        f.backend.fail_saves(true);

        let mut channels = batch("1", channel("1", true, 0, 0));
        channels.insert("2".into(), channel("2", true, 7, 8));
        let err = f.store.upsert_channels(channels).await.unwrap_err();

        assert!(matches!(err, SteerError::PersistenceFailure(_)));
        assert_eq!(f.store.channel_count(), 0);
        assert_eq!(f.s1.rule_count(), 0);
        assert_eq!(f.s2.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_activate_all_is_idempotent() {
        let f = fixture().await;
        let mut channels = batch("1", channel("1", true, 10, 20));
        channels.insert("2".into(), channel("2", false, 0, 0));
        f.store.upsert_channels(channels).await.unwrap();

        let first = f.store.activate_all().await;
        let rules = f.s1.rules().len();
        let second = f.store.activate_all().await;

        assert_eq!(first.installed, vec!["1".to_string()]);
        assert_eq!(second.installed, first.installed);
        assert!(second.failed.is_empty());
        assert_eq!(f.s1.rules().len(), rules);
        assert_eq!(f.s2.rule_count(), 4);
    }

    #[tokio::test]
    async fn test_failed_leg_is_reported_and_not_rolled_back() {
        let f = fixture().await;
        f.registry.on_detach(2);

        let err = f
            .store
            .upsert_channels(batch("1", channel("1", true, 0, 0)))
            .await
            .unwrap_err();
        match err {
            SteerError::LegFailure { leg, source, .. } => {
                assert_eq!(leg, Leg::Destination);
                assert!(matches!(*source, SteerError::NotConnected(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(f.s1.rule_count(), 4);
        assert_eq!(f.backend.saved().channels.len(), 1);

        let report = f.store.activate_all().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "1");
    }

    #[tokio::test]
    async fn test_unknown_role_installs_nothing() {
        let f = fixture().await;
        let mut ch = channel("1", true, 0, 0);
        ch.src.role = "printer".into();

        let err = f.store.upsert_channels(batch("1", ch)).await.unwrap_err();
        match err {
            SteerError::LegFailure { source, .. } => {
                assert!(matches!(*source, SteerError::UnresolvedPort { .. }))
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(f.s1.rule_count(), 0);
        assert_eq!(f.s2.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_channel_rejected_up_front() {
        let f = fixture().await;
        let mut ch = channel("1", true, 0, 0);
        ch.dst.subnet = "10.0.2".into();

        let mut channels = batch("1", channel("1", true, 0, 0));
        channels.insert("2".into(), ch);
        let err = f.store.upsert_channels(channels).await.unwrap_err();

        assert!(matches!(err, SteerError::MalformedRequest(_)));
        assert_eq!(f.store.channel_count(), 0);
        assert_eq!(f.s1.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_update_switches_merges() {
        let f = fixture().await;
        let partial: BTreeMap<String, SwitchDescriptor> = serde_json::from_str(
            r#"{"3": {"dpid": "0000000000000003", "intport": {"1": {"type": "server"}}}}"#,
        )
        .unwrap();
        f.store.update_switches(partial).await.unwrap();

        let doc = f.store.snapshot();
        assert_eq!(doc.ovs.len(), 3);
        assert!(f.backend.saved().ovs.contains_key("3"));

        let duplicate: BTreeMap<String, SwitchDescriptor> = serde_json::from_str(
            r#"{"1": {"dpid": "1", "outport": {"2": {"sla": "1"}, "5": {"sla": "1"}}}}"#,
        )
        .unwrap();
        assert!(f.store.update_switches(duplicate).await.is_err());
        assert_eq!(f.store.switch("1").unwrap().outport.len(), 2);
    }

    #[tokio::test]
    async fn test_json_backend_falls_back_to_seed() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("channels.json");
        let seed = dir.path().join("channels.default.json");
        std::fs::write(&seed, POLICY).unwrap();

        let backend = JsonFileBackend::new(&primary, &seed);
        let doc = backend.load().await;
        assert_eq!(doc.ovs.len(), 2);

        backend.save(&doc).await.unwrap();
        assert!(primary.exists());
        assert_eq!(backend.load().await, doc);
    }

    #[tokio::test]
    async fn test_json_backend_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("channels.json");
        let seed = dir.path().join("channels.default.json");

        let backend = JsonFileBackend::new(&primary, &seed);
        assert_eq!(backend.load().await, PolicyDocument::default());

        std::fs::write(&primary, "{ not json").unwrap();
        std::fs::write(&seed, POLICY).unwrap();
        assert_eq!(backend.load().await, PolicyDocument::default());
    }
}
