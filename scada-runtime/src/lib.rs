//! The `scada-runtime` crate hosts the agent's actors on one cooperative
//! event loop (the actix system arbiter) and routes every message between
//! them through a single inbound queue.
//!
//! The [`Runtime`] owns:
//! 1. The actor table, mapping each node name to the recipients of its
//!    [`Envelope`] and [`Shutdown`] messages
//! 2. The inbound queue every actor, timer and link writes into, drained in
//!    arrival order and dispatched by destination (see [`Route`])
//! 3. The internal [`Watchdog`]: every actor pats it within its own
//!    timeout, or the runtime shuts the process down naming the actor
//!
//! Actors never see the runtime. They get an `Arc<dyn ServicesHandle>` to
//! send messages, schedule timers, spawn named tasks, pat the watchdog and
//! publish to remote peers.

mod runtime;
mod services;
mod watchdog;

pub use runtime::{Route, Runtime, RuntimeSettings};
pub use services::{Services, ServicesHandle, TaskHandle, TaskRegistry};
pub use watchdog::{MonitoredName, SystemdNotifier, Watchdog};

use actix::prelude::*;
use thiserror::Error;

/// A routed message delivered to an actor's mailbox
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct Envelope(pub scada_types::Message);

/// Asks an actor to stop
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "()")]
pub struct Shutdown;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Watchdog pats every {seconds_per_pat}s, must be under half of {min_timeout_s}s")]
    WatchdogConfig {
        seconds_per_pat: f64,
        min_timeout_s: f64,
    },
    #[error("Actor {0} registered twice")]
    DuplicateActor(String),
    #[error("Runtime already running")]
    AlreadyRunning,
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
}
