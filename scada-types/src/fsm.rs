//! Records exchanged between bosses and the finite state machines they
//! command: the triggering [`FsmEvent`], the [`FsmAtomicReport`]s each
//! machine produces along the way, and the aggregated [`FsmFullReport`]
//! returned to whoever issued the trigger.
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Handle, SchemaError};

/// Trigger ids thread a command through every downstream report it causes
pub type TriggerId = Uuid;

pub fn new_trigger_id() -> TriggerId {
    Uuid::new_v4()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsmEventType {
    ChangeRelayState,
    ChangeStoreFlowRelay,
    ChangeValveState,
    ChangeRelayPin,
    TurnHpOnOff,
}

impl FsmEventType {
    /// Event names this type of event may carry
    pub fn event_names(&self) -> [FsmEventName; 2] {
        match self {
            FsmEventType::ChangeRelayState => [FsmEventName::OpenRelay, FsmEventName::CloseRelay],
            FsmEventType::ChangeStoreFlowRelay => {
                [FsmEventName::DischargeStore, FsmEventName::ChargeStore]
            }
            FsmEventType::ChangeValveState => [FsmEventName::CloseValve, FsmEventName::OpenValve],
            FsmEventType::ChangeRelayPin => [FsmEventName::DeEnergize, FsmEventName::Energize],
            FsmEventType::TurnHpOnOff => [FsmEventName::TurnOff, FsmEventName::TurnOn],
        }
    }

    pub fn accepts(&self, name: FsmEventName) -> bool {
        self.event_names().contains(&name)
    }
}

impl fmt::Display for FsmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsmEventName {
    OpenRelay,
    CloseRelay,
    DischargeStore,
    ChargeStore,
    OpenValve,
    CloseValve,
    Energize,
    DeEnergize,
    TurnOn,
    TurnOff,
}

impl fmt::Display for FsmEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which machine an atomic report is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AboutFsm {
    RelayState,
    StoreFlowDirection,
    ValveState,
    RelayPinState,
    HpBossState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsmReportType {
    /// The reporting machine acted on something below it
    Action,
    /// The reporting machine itself transitioned
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FsmEvent {
    pub from_handle: Handle,
    pub to_handle: Handle,
    pub event_type: FsmEventType,
    pub event_name: FsmEventName,
    pub send_time_unix_ms: i64,
    pub trigger_id: TriggerId,
}

impl FsmEvent {
    /// Build an event, rejecting an event name that does not belong to
    /// the event type
    pub fn new(
        from_handle: Handle,
        to_handle: Handle,
        event_type: FsmEventType,
        event_name: FsmEventName,
        send_time_unix_ms: i64,
        trigger_id: TriggerId,
    ) -> Result<Self, SchemaError> {
        if !event_type.accepts(event_name) {
            return Err(SchemaError::EventMismatch {
                event_type,
                event_name,
            });
        }
        Ok(Self {
            from_handle,
            to_handle,
            event_type,
            event_name,
            send_time_unix_ms,
            trigger_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FsmAtomicReport {
    pub from_handle: Handle,
    pub about_fsm: AboutFsm,
    pub report_type: FsmReportType,
    pub event_type: FsmEventType,
    pub event_name: FsmEventName,
    pub from_state: String,
    pub to_state: String,
    pub unix_time_ms: i64,
    pub trigger_id: TriggerId,
}

impl FsmAtomicReport {
    pub fn is_transition(&self) -> bool {
        self.from_state != self.to_state
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FsmFullReport {
    pub from_name: String,
    pub trigger_id: TriggerId,
    pub atomic_list: Vec<FsmAtomicReport>,
}

impl FsmFullReport {
    /// Timestamps never go backwards along the list and every entry
    /// belongs to the same trigger
    pub fn is_well_ordered(&self) -> bool {
        self.atomic_list
            .windows(2)
            .all(|w| w[0].unix_time_ms <= w[1].unix_time_ms)
            && self
                .atomic_list
                .iter()
                .all(|r| r.trigger_id == self.trigger_id)
    }
}
