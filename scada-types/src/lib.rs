//! Shared schema for the scada agent workspace.
//!
//! Everything that crosses an actor or network boundary is defined here
//! once, with serde derives providing the JSON wire format:
//!
//! 1. [`Message`]s, made of a [`Header`] and a [`Payload`]; the payload enum
//!    lists every message type any actor accepts
//! 2. The records exchanged between bosses and state machines:
//!    [`FsmEvent`], [`FsmAtomicReport`] and [`FsmFullReport`]
//! 3. [`Handle`]s, the dotted paths expressing the chain of command
//! 4. Authority transfer [`Contract`]s between the AtomicTNode and Scada
//! 5. The static [`HardwareLayout`] read at startup

pub mod contract;
pub mod fsm;
pub mod handle;
pub mod layout;
pub mod message;
pub mod payloads;

pub use contract::{Contract, ContractError, ContractParty, ContractStatus};
pub use fsm::{
    new_trigger_id, AboutFsm, FsmAtomicReport, FsmEvent, FsmEventName, FsmEventType,
    FsmFullReport, FsmReportType, TriggerId,
};
pub use handle::Handle;
pub use layout::{ActorClass, HardwareLayout, LayoutError, RelayActorConfig, RelayKind, ShNode};
pub use message::{Header, Message, Payload};
pub use payloads::*;

use thiserror::Error;

/// Destination for framework messages handled by the runtime itself
pub const RUNTIME_NAME: &str = "runtime";
/// Alternate runtime destination used by watchdog pats
pub const WATCHDOG_MANAGER_NAME: &str = "watchdog_manager";
/// Source of messages raised by the link manager
pub const LINK_MANAGER_NAME: &str = "link_manager";

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Json Error")]
    Json(#[from] serde_json::Error),
    #[error("Invalid handle {0}")]
    InvalidHandle(String),
    #[error("Event {event_name} does not belong to {event_type}")]
    EventMismatch {
        event_type: FsmEventType,
        event_name: FsmEventName,
    },
    #[error("Header type {header} does not match payload type {payload}")]
    TypeMismatch {
        header: String,
        payload: &'static str,
    },
}

/// Wall clock in unix milliseconds
pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
