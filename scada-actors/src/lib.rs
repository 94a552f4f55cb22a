//! The `scada-actors` crate holds the behavior of every node the agent
//! hosts. Each one implements [`Node`] and runs inside a [`Hosted`] actix
//! actor on the runtime's event loop:
//! 1. [`Scada`], the primary scada: owns the authoritative
//!    [`CommandTree`], picks the [`CommandMode`] from admin leases, Atn
//!    contracts and the state of the upstream link, and tracks telemetry
//! 2. [`Relay`]s, one per relay on an I²C relay board, each running its
//!    logical state machine and aggregating the reports of every trigger
//!    into an `FsmFullReport` for the boss that issued it
//! 3. [`Multiplexer`]s, each owning one relay board through a
//!    [`PinDriver`] on its own OS thread
//! 4. The [`HpBoss`], which waits for the distribution loop before turning
//!    the heat pump on
//!
//! Commands are only honored from the current boss (see
//! [`authority::check_command`]); everything else becomes a glitch.

pub mod authority;
mod contracts;
mod host;
mod hp_boss;
mod multiplexer;
mod relay;
mod scada;
mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use authority::{AdminLease, AuthorityError, CommandMode, CommandTree, GlitchLimiter};
pub use contracts::ContractManager;
pub use host::{Hosted, Node, DEFAULT_ACTOR_TIMEOUT_S, DEFAULT_PAT_PERIOD};
pub use hp_boss::{HpBoss, HpBossState};
pub use multiplexer::{DriverError, Multiplexer, PinDriver, SimulatedBoard};
pub use relay::{Relay, RelayError, RelayState};
pub use scada::{Scada, DEFAULT_SNAPSHOT_PERIOD};
pub use telemetry::TelemetryTracker;

use scada_types::{ContractError, SchemaError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("Relay Error: {0}")]
    Relay(#[from] RelayError),
    #[error("Authority Error: {0}")]
    Authority(#[from] AuthorityError),
    #[error("Contract Error: {0}")]
    Contract(#[from] ContractError),
    #[error("Driver Error: {0}")]
    Driver(#[from] DriverError),
    #[error("Schema Error")]
    Schema(#[from] SchemaError),
    #[error("No configuration for {0}")]
    NoConfig(String),
    #[error("No handle for {0}")]
    NoHandle(String),
}

impl ActorError {
    /// Errors that mean the actor's own bookkeeping can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, ActorError::Relay(RelayError::UnknownTrigger { .. }))
    }
}
