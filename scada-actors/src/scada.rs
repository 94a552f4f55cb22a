use scada_link::LinkName;
use scada_runtime::ServicesHandle;
use scada_types::{
    Contract, FsmEvent, LinkState, LinkStateChange, LogLevel, Message, Payload,
    ProblemEvent, SingleReading, LINK_MANAGER_NAME,
};
use std::sync::Arc;
use tokio::time::Duration;

use crate::{
    authority::GuardFailure, ActorError, AdminLease, CommandMode, CommandTree, ContractManager,
    GlitchLimiter, Node, TelemetryTracker,
};

pub const DEFAULT_SNAPSHOT_PERIOD: Duration = Duration::from_secs(60);

/// The primary scada. Decides who is in charge and tells every other
/// actor, answers the Atn's contract heartbeats, forwards commands that
/// arrive addressed to the scada itself, and reports telemetry upstream.
pub struct Scada {
    name: String,
    services: Arc<dyn ServicesHandle>,
    admin_name: Option<String>,
    local_actors: Vec<String>,
    tree: CommandTree,
    mode: CommandMode,
    upstream_active: bool,
    admin: AdminLease,
    contracts: ContractManager,
    telemetry: TelemetryTracker,
    snapshot_period_ms: i64,
    last_snapshot_ms: i64,
    glitches: GlitchLimiter,
}

impl Scada {
    pub fn new(
        name: &str,
        services: Arc<dyn ServicesHandle>,
        snapshot_period: Duration,
    ) -> Result<Self, ActorError> {
        let layout = services.layout();
        let mode = CommandMode::HomeAlone;
        let tree = CommandTree::for_mode(layout, mode)?;
        let admin_name = layout.admin().map(|n| n.name.clone());
        let local_actors = layout
            .sh_nodes
            .iter()
            .filter(|n| n.actor_class.is_local_actor() && n.name != name)
            .map(|n| n.name.clone())
            .collect();
        let telemetry = TelemetryTracker::new(layout, name);
        let now = services.now_ms();
        Ok(Self {
            name: name.to_string(),
            services,
            admin_name,
            local_actors,
            tree,
            mode,
            upstream_active: false,
            admin: AdminLease::default(),
            contracts: ContractManager::default(),
            telemetry,
            snapshot_period_ms: snapshot_period.as_millis() as i64,
            last_snapshot_ms: now,
            glitches: GlitchLimiter::default(),
        })
    }

    pub fn mode(&self) -> CommandMode {
        self.mode
    }

    pub fn tree(&self) -> &CommandTree {
        &self.tree
    }

    fn now_s(&self) -> i64 {
        self.services.now_ms() / 1000
    }

    fn glitch(&mut self, src: &str, summary: &str, details: String) {
        self.glitches
            .report(self.services.as_ref(), &self.name, src, summary, details);
    }

    fn broadcast_tree(&self) {
        let payload = self.tree.to_payload();
        for actor in &self.local_actors {
            self.services.send(Message::new(
                self.name.as_str(),
                actor.as_str(),
                Payload::NewCommandTree(payload.clone()),
            ));
        }
    }

    /// Re-select the command mode and propagate a changed tree
    fn refresh_mode(&mut self) -> Result<(), ActorError> {
        let now = self.services.now_ms();
        let mode = CommandMode::select(
            self.admin.is_active(now),
            self.contracts.in_force(now / 1000),
            self.upstream_active,
        );
        if mode == self.mode {
            return Ok(());
        }
        log::info!("{} command mode {} -> {mode}", self.name, self.mode);
        self.tree = CommandTree::for_mode(self.services.layout(), mode)?;
        self.mode = mode;
        self.broadcast_tree();
        Ok(())
    }

    fn send_contract(&self, contract: Contract) {
        self.services
            .publish(LinkName::Upstream, Payload::ContractHeartbeat(contract));
    }

    fn terminate_contract(&mut self, cause: &str) {
        let now_s = self.now_s();
        if let Some(terminated) = self.contracts.terminate(cause, now_s) {
            self.send_contract(terminated);
        }
    }

    fn on_link_change(&mut self, change: LinkStateChange) -> Result<(), ActorError> {
        log::info!(
            "Link {} {} -> {}",
            change.link,
            change.old_state,
            change.new_state
        );
        if change.link != LinkName::Upstream.as_str() {
            return Ok(());
        }
        let active = change.new_state == LinkState::Active;
        if self.upstream_active && !active {
            self.terminate_contract("upstream link lost");
        }
        self.upstream_active = active;
        self.refresh_mode()
    }

    fn is_admin(&self, src: &str) -> bool {
        self.admin_name.as_deref() == Some(src)
    }

    fn on_admin_wakes_up(&mut self, src: &str, timeout_s: Option<u64>) -> Result<(), ActorError> {
        if !self.is_admin(src) {
            self.glitch(src, "not_admin", "AdminWakesUp from a non-admin node".into());
            return Ok(());
        }
        let granted = self.admin.wake(timeout_s, self.services.now_ms());
        log::info!("{} admin in control for {granted}s", self.name);
        self.terminate_contract("admin took control");
        self.refresh_mode()
    }

    fn on_admin_releases(&mut self, src: &str) -> Result<(), ActorError> {
        if !self.is_admin(src) {
            self.glitch(
                src,
                "not_admin",
                "AdminReleasesControl from a non-admin node".into(),
            );
            return Ok(());
        }
        if self.admin.release() {
            log::info!("{} admin released control", self.name);
        }
        self.refresh_mode()
    }

    fn on_contract(&mut self, src: &str, contract: Contract) -> Result<(), ActorError> {
        if src != self.services.layout().atn_alias() {
            self.glitch(src, "bad_contract", format!("contract heartbeat from {src}"));
            return Ok(());
        }
        let now_s = self.now_s();
        match self.contracts.on_heartbeat(contract, now_s) {
            Ok(Some(reply)) => self.send_contract(reply),
            Ok(None) => {}
            Err(e) => {
                log::warn!("{} refusing contract heartbeat: {e:}", self.name);
                self.glitch(src, "bad_contract", e.to_string());
            }
        }
        self.refresh_mode()
    }

    /// Commands addressed to the scada go to whichever node holds the
    /// target handle, keeping the original sender so the target can
    /// check its boss
    fn forward_event(&mut self, src: &str, event: FsmEvent) {
        let target = self
            .tree
            .name_of(&event.to_handle)
            .filter(|name| self.local_actors.iter().any(|a| a.as_str() == *name))
            .map(str::to_string);
        match target {
            Some(dst) => {
                log::debug!(
                    "{} forwarding {} from {src} to {dst}",
                    self.name,
                    event.event_name
                );
                self.services
                    .send(Message::new(src, dst, Payload::FsmEvent(event)));
            }
            None => {
                let details = format!("no local actor holds {}", event.to_handle);
                self.glitch(src, GuardFailure::BadBoss.summary(), details);
            }
        }
    }

    fn on_reading(&mut self, src: &str, reading: SingleReading) {
        let channel = reading.channel_name.clone();
        if !self.telemetry.record(reading) {
            log::warn!("{} reading for unknown channel {channel} from {src}", self.name);
        }
    }

    fn report_flatlines(&mut self, now_ms: i64) {
        for channel in self.telemetry.newly_flatlined(now_ms) {
            log::warn!("{} channel {channel} flatlined", self.name);
            self.services.publish(
                LinkName::Upstream,
                Payload::ProblemEvent(ProblemEvent {
                    src: self.name.clone(),
                    problem_type: LogLevel::Warning,
                    summary: "channel_flatlined".to_string(),
                    details: channel,
                    time_created_ms: now_ms,
                }),
            );
        }
    }
}

impl Node for Scada {
    fn name(&self) -> &str {
        &self.name
    }

    fn services(&self) -> &Arc<dyn ServicesHandle> {
        &self.services
    }

    fn on_start(&mut self) {
        log::info!("{} starting in {} mode", self.name, self.mode);
        self.broadcast_tree();
    }

    fn process(&mut self, message: Message) -> Result<(), ActorError> {
        let src = message.header.src;
        match message.payload {
            Payload::LinkStateChange(change) if src == LINK_MANAGER_NAME => {
                self.on_link_change(change)
            }
            Payload::AdminWakesUp(wake) => self.on_admin_wakes_up(&src, wake.timeout_s),
            Payload::AdminReleasesControl(_) => self.on_admin_releases(&src),
            Payload::ContractHeartbeat(contract) => self.on_contract(&src, contract),
            Payload::FsmEvent(event) => {
                self.forward_event(&src, event);
                Ok(())
            }
            Payload::SingleReading(reading) => {
                self.on_reading(&src, reading);
                Ok(())
            }
            payload @ Payload::PowerWatts(_) => {
                self.services.publish(LinkName::Upstream, payload);
                Ok(())
            }
            Payload::FsmFullReport(report) => {
                log::info!(
                    "{} full report from {} for {}",
                    self.name,
                    report.from_name,
                    report.trigger_id
                );
                Ok(())
            }
            other => {
                log::warn!("{} ignoring {} from {src}", self.name, other.type_name());
                Ok(())
            }
        }
    }

    fn on_tick(&mut self) {
        let now = self.services.now_ms();
        let expired = self.admin.expire(now);
        if expired {
            log::info!("{} admin lease expired", self.name);
        }
        let contract_changed = self.contracts.tick(now / 1000);
        if expired || contract_changed {
            if let Err(e) = self.refresh_mode() {
                log::error!("{} unable to rebuild command tree: {e:}", self.name);
            }
        }

        self.report_flatlines(now);
        if now - self.last_snapshot_ms >= self.snapshot_period_ms {
            self.last_snapshot_ms = now;
            let snapshot = self.telemetry.snapshot(self.services.gnode_alias(), now);
            self.services
                .publish(LinkName::Upstream, Payload::Snapshot(snapshot));
        }
    }
}
