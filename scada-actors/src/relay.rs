use scada_link::LinkName;
use scada_runtime::ServicesHandle;
use scada_types::{
    FsmAtomicReport, FsmEvent, FsmEventName, FsmEventType, FsmFullReport, FsmReportType,
    Handle, Message, Payload, RelayActorConfig, SingleMachineState, TriggerId, AboutFsm,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use thiserror::Error;

use crate::{
    authority::{check_command, GuardFailure},
    ActorError, CommandTree, GlitchLimiter, Node,
};

/// Open triggers older than this are forgotten
pub const TRIGGER_TTL_MS: i64 = 5 * 60 * 1000;
pub const MAX_OPEN_TRIGGERS: usize = 64;

pub const PIN_ENERGIZED: &str = "Energized";
pub const PIN_DE_ENERGIZED: &str = "DeEnergized";

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Unknown trigger {trigger_id} reported by {src}")]
    UnknownTrigger { trigger_id: TriggerId, src: String },
    #[error("Relay {0} has no config in the layout")]
    NoConfig(String),
    #[error("Relay {0} has no multiplexer in the layout")]
    NoMultiplexer(String),
}

/// Canonical relay states. The intermediate ones only occur for slow
/// actuators still on their way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    DeEnergized,
    Energizing,
    Energized,
    DeEnergizing,
}

impl RelayState {
    pub fn pin_energized(&self) -> bool {
        matches!(self, RelayState::Energizing | RelayState::Energized)
    }
}

pub(crate) fn pin_label(energized: bool) -> &'static str {
    if energized {
        PIN_ENERGIZED
    } else {
        PIN_DE_ENERGIZED
    }
}

#[derive(Debug)]
struct OpenTrigger {
    boss: String,
    reports: Vec<FsmAtomicReport>,
    opened_ms: i64,
}

/// One relay on a relay board. Commands from its boss move the logical
/// state machine and become pin changes on the multiplexer; the reports
/// of each trigger are collected and returned to the boss in one
/// `FsmFullReport` once the multiplexer confirms.
pub struct Relay {
    name: String,
    services: Arc<dyn ServicesHandle>,
    config: RelayActorConfig,
    multiplexer: String,
    tree: CommandTree,
    state: RelayState,
    actuators_ready: bool,
    open: HashMap<TriggerId, OpenTrigger>,
    order: VecDeque<TriggerId>,
    evicted: VecDeque<TriggerId>,
    glitches: GlitchLimiter,
}

impl Relay {
    pub fn new(
        name: &str,
        services: Arc<dyn ServicesHandle>,
        tree: CommandTree,
    ) -> Result<Self, RelayError> {
        let layout = services.layout();
        let (_, config) = layout
            .relay_config(name)
            .ok_or_else(|| RelayError::NoConfig(name.to_string()))?;
        let multiplexer = layout
            .multiplexer_for_relay(name)
            .ok_or_else(|| RelayError::NoMultiplexer(name.to_string()))?;
        let (config, multiplexer) = (config.clone(), multiplexer.name.clone());
        Ok(Self {
            name: name.to_string(),
            services,
            config,
            multiplexer,
            tree,
            state: RelayState::DeEnergized,
            actuators_ready: false,
            open: HashMap::new(),
            order: VecDeque::new(),
            evicted: VecDeque::new(),
            glitches: GlitchLimiter::default(),
        })
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn label(&self, state: RelayState) -> &'static str {
        let kind = self.config.kind;
        match state {
            RelayState::DeEnergized => kind.state_label(self.config.de_energizing_event),
            RelayState::Energized => kind.state_label(self.config.energizing_event()),
            RelayState::Energizing => kind.transit_label(self.config.energizing_event()),
            RelayState::DeEnergizing => kind.transit_label(self.config.de_energizing_event),
        }
    }

    pub fn state_label(&self) -> &'static str {
        self.label(self.state)
    }

    pub fn open_triggers(&self) -> usize {
        self.open.len()
    }

    fn handle(&self) -> Result<Handle, ActorError> {
        self.tree
            .handle(&self.name)
            .cloned()
            .ok_or_else(|| ActorError::NoHandle(self.name.clone()))
    }

    fn glitch(&mut self, src: &str, failure: GuardFailure, details: String) {
        self.glitches.report(
            self.services.as_ref(),
            &self.name,
            src,
            failure.summary(),
            details,
        );
    }

    fn publish_state(&self, cause: TriggerId) -> Result<(), ActorError> {
        self.services.publish(
            LinkName::Upstream,
            Payload::SingleMachineState(SingleMachineState {
                machine_handle: self.handle()?,
                state_enum: format!("{:?}", self.config.kind.about_fsm()),
                state: self.state_label().to_string(),
                unix_ms: self.services.now_ms(),
                cause: Some(cause),
            }),
        );
        Ok(())
    }

    fn send_full_report(&self, boss: &str, trigger_id: TriggerId, atomic_list: Vec<FsmAtomicReport>) {
        self.services.send(Message::new(
            self.name.as_str(),
            boss,
            Payload::FsmFullReport(FsmFullReport {
                from_name: self.name.clone(),
                trigger_id,
                atomic_list,
            }),
        ));
    }

    /// Forget triggers past their age, then the oldest beyond the cap
    fn evict_stale(&mut self, now_ms: i64, room_for: usize) {
        while let Some(oldest) = self.order.front().copied() {
            let expired = self
                .open
                .get(&oldest)
                .map_or(true, |t| now_ms - t.opened_ms >= TRIGGER_TTL_MS);
            if !expired && self.open.len() + room_for <= MAX_OPEN_TRIGGERS {
                break;
            }
            self.order.pop_front();
            if let Some(trigger) = self.open.remove(&oldest) {
                log::warn!(
                    "{} evicting trigger {oldest} from {} with {} reports",
                    self.name,
                    trigger.boss,
                    trigger.reports.len()
                );
                self.evicted.push_back(oldest);
                if self.evicted.len() > MAX_OPEN_TRIGGERS {
                    self.evicted.pop_front();
                }
            }
        }
    }

    fn on_event(&mut self, src: &str, event: FsmEvent) -> Result<(), ActorError> {
        let accepted = [self.config.kind.event_type()];
        if let Err(failure) = check_command(
            &self.tree,
            self.services.layout(),
            &self.name,
            src,
            &event,
            &accepted,
            true,
        ) {
            let details = format!(
                "{} {} from {} to {}, my handle {:?}",
                event.event_type,
                event.event_name,
                event.from_handle,
                event.to_handle,
                self.tree.handle(&self.name)
            );
            self.glitch(src, failure, details);
            return Ok(());
        }
        if !self.actuators_ready {
            self.glitch(
                src,
                GuardFailure::ActuatorsNotReady,
                format!("{} before the relay board was ready", event.event_name),
            );
            return Ok(());
        }

        let my_handle = self.handle()?;
        let now = self.services.now_ms();
        let energize = event.event_name != self.config.de_energizing_event;
        let (target, next) = match (energize, self.config.is_slow()) {
            (true, false) => (RelayState::Energized, RelayState::Energized),
            (true, true) => (RelayState::Energized, RelayState::Energizing),
            (false, false) => (RelayState::DeEnergized, RelayState::DeEnergized),
            (false, true) => (RelayState::DeEnergized, RelayState::DeEnergizing),
        };
        let report = |report_type, about_fsm, event_type, event_name, from: &str, to: &str| {
            FsmAtomicReport {
                from_handle: my_handle.clone(),
                about_fsm,
                report_type,
                event_type,
                event_name,
                from_state: from.to_string(),
                to_state: to.to_string(),
                unix_time_ms: now,
                trigger_id: event.trigger_id,
            }
        };

        if self.state == target || self.state == next {
            log::debug!(
                "{} already {}, ignoring {}",
                self.name,
                self.state_label(),
                event.event_name
            );
            let label = self.state_label();
            let noop = report(
                FsmReportType::Event,
                self.config.kind.about_fsm(),
                event.event_type,
                event.event_name,
                label,
                label,
            );
            self.send_full_report(src, event.trigger_id, vec![noop]);
            return Ok(());
        }

        let multiplexer_handle = self
            .tree
            .handle(&self.multiplexer)
            .cloned()
            .ok_or_else(|| ActorError::NoHandle(self.multiplexer.clone()))?;
        let pin_event = if energize {
            FsmEventName::Energize
        } else {
            FsmEventName::DeEnergize
        };
        let from = self.state;
        let logical = report(
            FsmReportType::Event,
            self.config.kind.about_fsm(),
            event.event_type,
            event.event_name,
            self.label(from),
            self.label(next),
        );
        let pin_request = report(
            FsmReportType::Action,
            AboutFsm::RelayPinState,
            FsmEventType::ChangeRelayPin,
            pin_event,
            pin_label(from.pin_energized()),
            pin_label(energize),
        );

        self.state = next;
        log::info!(
            "{} {} -> {} on {} from {src}",
            self.name,
            self.label(from),
            self.label(next),
            event.event_name
        );

        self.evict_stale(now, 1);
        self.open.insert(
            event.trigger_id,
            OpenTrigger {
                boss: src.to_string(),
                reports: vec![logical, pin_request],
                opened_ms: now,
            },
        );
        self.order.push_back(event.trigger_id);

        self.publish_state(event.trigger_id)?;
        let pin_change = FsmEvent::new(
            my_handle,
            multiplexer_handle,
            FsmEventType::ChangeRelayPin,
            pin_event,
            now,
            event.trigger_id,
        )?;
        self.services.send(Message::new(
            self.name.as_str(),
            self.multiplexer.as_str(),
            Payload::FsmEvent(pin_change),
        ));
        Ok(())
    }

    fn on_report(&mut self, src: &str, report: FsmAtomicReport) -> Result<(), ActorError> {
        if src != self.multiplexer {
            log::warn!(
                "{} ignoring atomic report from {src}, not its multiplexer",
                self.name
            );
            return Ok(());
        }
        let Some(mut trigger) = self.open.remove(&report.trigger_id) else {
            if self.evicted.contains(&report.trigger_id) {
                log::warn!(
                    "{} late report for evicted trigger {}",
                    self.name,
                    report.trigger_id
                );
                return Ok(());
            }
            return Err(RelayError::UnknownTrigger {
                trigger_id: report.trigger_id,
                src: src.to_string(),
            }
            .into());
        };
        self.order.retain(|t| *t != report.trigger_id);

        let trigger_id = report.trigger_id;
        let settled = match (self.state, report.event_name) {
            (RelayState::Energizing, FsmEventName::Energize) => Some(RelayState::Energized),
            (RelayState::DeEnergizing, FsmEventName::DeEnergize) => Some(RelayState::DeEnergized),
            _ => None,
        };
        trigger.reports.push(report);
        if let Some(settled) = settled {
            log::info!(
                "{} {} -> {}",
                self.name,
                self.state_label(),
                self.label(settled)
            );
            self.state = settled;
            self.publish_state(trigger_id)?;
        }
        self.send_full_report(&trigger.boss, trigger_id, trigger.reports);
        Ok(())
    }
}

impl Node for Relay {
    fn name(&self) -> &str {
        &self.name
    }

    fn services(&self) -> &Arc<dyn ServicesHandle> {
        &self.services
    }

    fn process(&mut self, message: Message) -> Result<(), ActorError> {
        let src = message.header.src;
        match message.payload {
            Payload::FsmEvent(event) => self.on_event(&src, event),
            Payload::FsmAtomicReport(report) => self.on_report(&src, report),
            Payload::ActuatorsReady(_) if src == self.multiplexer => {
                log::info!("{} actuators ready", self.name);
                self.actuators_ready = true;
                Ok(())
            }
            Payload::NewCommandTree(tree) => {
                self.tree = CommandTree::from_handles(tree.handles);
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
        self.evict_stale(now, 0);
    }
}
