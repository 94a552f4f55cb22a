use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    payloads::*, Contract, FsmAtomicReport, FsmEvent, FsmFullReport, SchemaError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    pub src: String,
    pub dst: String,
    pub message_type: String,
    pub message_id: Uuid,
}

/// Every message the agent accepts, tagged on the wire by `TypeName`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "TypeName")]
pub enum Payload {
    #[serde(rename = "fsm.event")]
    FsmEvent(FsmEvent),
    #[serde(rename = "fsm.atomic.report")]
    FsmAtomicReport(FsmAtomicReport),
    #[serde(rename = "fsm.full.report")]
    FsmFullReport(FsmFullReport),
    #[serde(rename = "glitch")]
    Glitch(Glitch),
    #[serde(rename = "problem.event")]
    ProblemEvent(ProblemEvent),
    #[serde(rename = "heartbeat.b")]
    Heartbeat(Heartbeat),
    #[serde(rename = "admin.wakes.up")]
    AdminWakesUp(AdminWakesUp),
    #[serde(rename = "admin.releases.control")]
    AdminReleasesControl(AdminReleasesControl),
    #[serde(rename = "slow.contract.heartbeat")]
    ContractHeartbeat(Contract),
    #[serde(rename = "single.machine.state")]
    SingleMachineState(SingleMachineState),
    #[serde(rename = "sieg.loop.ready")]
    SiegLoopReady(SiegLoopReady),
    #[serde(rename = "power.watts")]
    PowerWatts(PowerWatts),
    #[serde(rename = "dispatch.telegram")]
    DispatchTelegram(DispatchTelegram),
    #[serde(rename = "single.reading")]
    SingleReading(SingleReading),
    #[serde(rename = "snapshot.spaceheat")]
    Snapshot(Snapshot),
    #[serde(rename = "pat.internal.watchdog")]
    PatInternalWatchdog(PatInternalWatchdog),
    #[serde(rename = "internal.shutdown")]
    InternalShutdown(InternalShutdown),
    #[serde(rename = "new.command.tree")]
    NewCommandTree(NewCommandTree),
    #[serde(rename = "link.state.change")]
    LinkStateChange(LinkStateChange),
    #[serde(rename = "actuators.ready")]
    ActuatorsReady(ActuatorsReady),
    #[serde(rename = "actuation.settled")]
    ActuationSettled(ActuationSettled),
    #[serde(rename = "hp.turn.on.wait.expired")]
    HpTurnOnWaitExpired(HpTurnOnWaitExpired),
}

impl Payload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::FsmEvent(_) => "fsm.event",
            Payload::FsmAtomicReport(_) => "fsm.atomic.report",
            Payload::FsmFullReport(_) => "fsm.full.report",
            Payload::Glitch(_) => "glitch",
            Payload::ProblemEvent(_) => "problem.event",
            Payload::Heartbeat(_) => "heartbeat.b",
            Payload::AdminWakesUp(_) => "admin.wakes.up",
            Payload::AdminReleasesControl(_) => "admin.releases.control",
            Payload::ContractHeartbeat(_) => "slow.contract.heartbeat",
            Payload::SingleMachineState(_) => "single.machine.state",
            Payload::SiegLoopReady(_) => "sieg.loop.ready",
            Payload::PowerWatts(_) => "power.watts",
            Payload::DispatchTelegram(_) => "dispatch.telegram",
            Payload::SingleReading(_) => "single.reading",
            Payload::Snapshot(_) => "snapshot.spaceheat",
            Payload::PatInternalWatchdog(_) => "pat.internal.watchdog",
            Payload::InternalShutdown(_) => "internal.shutdown",
            Payload::NewCommandTree(_) => "new.command.tree",
            Payload::LinkStateChange(_) => "link.state.change",
            Payload::ActuatorsReady(_) => "actuators.ready",
            Payload::ActuationSettled(_) => "actuation.settled",
            Payload::HpTurnOnWaitExpired(_) => "hp.turn.on.wait.expired",
        }
    }

    /// Framework and timer messages that never leave the process
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Payload::PatInternalWatchdog(_)
                | Payload::InternalShutdown(_)
                | Payload::NewCommandTree(_)
                | Payload::LinkStateChange(_)
                | Payload::ActuatorsReady(_)
                | Payload::ActuationSettled(_)
                | Payload::HpTurnOnWaitExpired(_)
        )
    }

    /// Telegrams that are superseded by the next one and can be lost
    pub fn is_telegram(&self) -> bool {
        matches!(self, Payload::PowerWatts(_) | Payload::DispatchTelegram(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, payload: Payload) -> Self {
        Self {
            header: Header {
                src: src.into(),
                dst: dst.into(),
                message_type: payload.type_name().to_string(),
                message_id: Uuid::new_v4(),
            },
            payload,
        }
    }

    pub fn src(&self) -> &str {
        &self.header.src
    }

    pub fn dst(&self) -> &str {
        &self.header.dst
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a frame, refusing one whose header disagrees with its payload
    pub fn from_json(bytes: &[u8]) -> Result<Self, SchemaError> {
        let message: Message = serde_json::from_slice(bytes)?;
        if message.header.message_type != message.payload.type_name() {
            return Err(SchemaError::TypeMismatch {
                header: message.header.message_type,
                payload: message.payload.type_name(),
            });
        }
        Ok(message)
    }
}
