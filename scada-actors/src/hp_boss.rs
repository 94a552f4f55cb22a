use scada_link::LinkName;
use scada_runtime::{ServicesHandle, TaskHandle};
use scada_types::{
    AboutFsm, FsmAtomicReport, FsmEvent, FsmEventName, FsmEventType, FsmFullReport,
    FsmReportType, Handle, HpTurnOnWaitExpired, Message, Payload, SingleMachineState, TriggerId,
};
use std::{fmt, sync::Arc};
use tokio::time::Duration;

use crate::{authority::check_command, ActorError, CommandTree, GlitchLimiter, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpBossState {
    HpOff,
    PreparingToTurnOn,
    HpOn,
}

impl fmt::Display for HpBossState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HpBossState::HpOff => "HpOff",
            HpBossState::PreparingToTurnOn => "PreparingToTurnOn",
            HpBossState::HpOn => "HpOn",
        };
        f.write_str(s)
    }
}

/// The turn-on that is waiting for the distribution loop
struct PendingTurnOn {
    boss: String,
    trigger_id: TriggerId,
    reports: Vec<FsmAtomicReport>,
    timer: TaskHandle,
}

/// Boss of the heat pump's scada-ops relay. Turning the heat pump on waits
/// for the distribution loop to report ready, or for the configured
/// timeout, before closing the relay. Turning it off is immediate.
pub struct HpBoss {
    name: String,
    services: Arc<dyn ServicesHandle>,
    tree: CommandTree,
    hp_relay: String,
    turn_on_timeout: Duration,
    state: HpBossState,
    attempt: u64,
    pending: Option<PendingTurnOn>,
    glitches: GlitchLimiter,
}

impl HpBoss {
    pub fn new(
        name: &str,
        services: Arc<dyn ServicesHandle>,
        tree: CommandTree,
    ) -> Result<Self, ActorError> {
        let config = services
            .layout()
            .hp_boss_config(name)
            .ok_or_else(|| ActorError::NoConfig(name.to_string()))?;
        let (hp_relay, turn_on_timeout) = (
            config.hp_relay_name.clone(),
            Duration::from_secs(config.turn_on_timeout_s),
        );
        Ok(Self {
            name: name.to_string(),
            services,
            tree,
            hp_relay,
            turn_on_timeout,
            state: HpBossState::HpOff,
            attempt: 0,
            pending: None,
            glitches: GlitchLimiter::default(),
        })
    }

    pub fn state(&self) -> HpBossState {
        self.state
    }

    fn handle_of(&self, name: &str) -> Result<Handle, ActorError> {
        self.tree
            .handle(name)
            .cloned()
            .ok_or_else(|| ActorError::NoHandle(name.to_string()))
    }

    fn report(
        &self,
        event_name: FsmEventName,
        from: HpBossState,
        to: HpBossState,
        trigger_id: TriggerId,
    ) -> Result<FsmAtomicReport, ActorError> {
        Ok(FsmAtomicReport {
            from_handle: self.handle_of(&self.name)?,
            about_fsm: AboutFsm::HpBossState,
            report_type: FsmReportType::Event,
            event_type: FsmEventType::TurnHpOnOff,
            event_name,
            from_state: from.to_string(),
            to_state: to.to_string(),
            unix_time_ms: self.services.now_ms(),
            trigger_id,
        })
    }

    fn transition(&mut self, to: HpBossState, cause: TriggerId) -> Result<(), ActorError> {
        log::info!("{} {} -> {to}", self.name, self.state);
        self.state = to;
        self.services.publish(
            LinkName::Upstream,
            Payload::SingleMachineState(SingleMachineState {
                machine_handle: self.handle_of(&self.name)?,
                state_enum: format!("{:?}", AboutFsm::HpBossState),
                state: to.to_string(),
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

    fn command_relay(&self, event_name: FsmEventName, trigger_id: TriggerId) -> Result<(), ActorError> {
        let event = FsmEvent::new(
            self.handle_of(&self.name)?,
            self.handle_of(&self.hp_relay)?,
            FsmEventType::ChangeRelayState,
            event_name,
            self.services.now_ms(),
            trigger_id,
        )?;
        self.services.send(Message::new(
            self.name.as_str(),
            self.hp_relay.as_str(),
            Payload::FsmEvent(event),
        ));
        Ok(())
    }

    fn on_event(&mut self, src: &str, event: FsmEvent) -> Result<(), ActorError> {
        if let Err(failure) = check_command(
            &self.tree,
            self.services.layout(),
            &self.name,
            src,
            &event,
            &[FsmEventType::TurnHpOnOff],
            true,
        ) {
            let details = format!(
                "{} {} from {} to {}",
                event.event_type, event.event_name, event.from_handle, event.to_handle
            );
            self.glitches.report(
                self.services.as_ref(),
                &self.name,
                src,
                failure.summary(),
                details,
            );
            return Ok(());
        }

        let trigger_id = event.trigger_id;
        match (event.event_name, self.state) {
            (FsmEventName::TurnOn, HpBossState::HpOff) => {
                let preparing =
                    self.report(event.event_name, self.state, HpBossState::PreparingToTurnOn, trigger_id)?;
                self.transition(HpBossState::PreparingToTurnOn, trigger_id)?;
                self.attempt += 1;
                let expired = Message::new(
                    self.name.as_str(),
                    self.name.as_str(),
                    Payload::HpTurnOnWaitExpired(HpTurnOnWaitExpired {
                        attempt: self.attempt,
                    }),
                );
                let timer = self.services.send_after(
                    &format!("{}-turn-on-wait", self.name),
                    self.turn_on_timeout,
                    expired,
                );
                self.pending = Some(PendingTurnOn {
                    boss: src.to_string(),
                    trigger_id,
                    reports: vec![preparing],
                    timer,
                });
                Ok(())
            }
            (FsmEventName::TurnOff, HpBossState::PreparingToTurnOn | HpBossState::HpOn) => {
                if let Some(pending) = self.pending.take() {
                    pending.timer.cancel();
                }
                let off = self.report(event.event_name, self.state, HpBossState::HpOff, trigger_id)?;
                self.transition(HpBossState::HpOff, trigger_id)?;
                self.command_relay(FsmEventName::OpenRelay, trigger_id)?;
                self.send_full_report(src, trigger_id, vec![off]);
                Ok(())
            }
            (event_name, state) => {
                log::debug!("{} already {state}, ignoring {event_name}", self.name);
                let noop = self.report(event_name, state, state, trigger_id)?;
                self.send_full_report(src, trigger_id, vec![noop]);
                Ok(())
            }
        }
    }

    /// Close the heat pump relay and finish the pending turn-on
    fn turn_on(&mut self) -> Result<(), ActorError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(());
        };
        pending.timer.cancel();
        let on = self.report(
            FsmEventName::TurnOn,
            self.state,
            HpBossState::HpOn,
            pending.trigger_id,
        )?;
        pending.reports.push(on);
        self.transition(HpBossState::HpOn, pending.trigger_id)?;
        self.command_relay(FsmEventName::CloseRelay, pending.trigger_id)?;
        self.send_full_report(&pending.boss, pending.trigger_id, pending.reports);
        Ok(())
    }

    fn on_wait_expired(&mut self, expired: HpTurnOnWaitExpired) -> Result<(), ActorError> {
        if self.state != HpBossState::PreparingToTurnOn || expired.attempt != self.attempt {
            log::debug!(
                "{} stale turn-on timer for attempt {} (now {}, attempt {})",
                self.name,
                expired.attempt,
                self.state,
                self.attempt
            );
            return Ok(());
        }
        log::warn!(
            "{} not heard from the distribution loop after {}s, turning heat pump on",
            self.name,
            self.turn_on_timeout.as_secs()
        );
        self.turn_on()
    }
}

impl Node for HpBoss {
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
            Payload::SiegLoopReady(_) => {
                if self.state == HpBossState::PreparingToTurnOn {
                    log::info!("{} distribution loop ready ({src})", self.name);
                    self.turn_on()
                } else {
                    log::debug!("{} loop ready while {}", self.name, self.state);
                    Ok(())
                }
            }
            Payload::HpTurnOnWaitExpired(expired) if src == self.name => {
                self.on_wait_expired(expired)
            }
            Payload::FsmFullReport(report) if src == self.hp_relay => {
                log::debug!(
                    "{} relay reported {} steps for {}",
                    self.name,
                    report.atomic_list.len(),
                    report.trigger_id
                );
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
}
