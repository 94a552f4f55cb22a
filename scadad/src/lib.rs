//! The scada daemon: loads settings and the hardware layout, hosts one
//! actor per local node on the runtime, connects the local and cloud
//! links, and runs until something asks for a shutdown. The exit code
//! tells a supervisor why it stopped.

pub mod app;
pub mod config;

pub use app::App;
pub use config::{ConfigError, ScadaSettings};

use scada_actors::{ActorError, DriverError, RelayError};
use scada_link::LinkError;
use scada_runtime::RuntimeError;
use scada_types::{InternalShutdown, LayoutError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScadaError {
    #[error("Config Error: {0}")]
    Config(#[from] ConfigError),
    #[error("Layout Error: {0}")]
    Layout(#[from] LayoutError),
    #[error("Runtime Error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Link Error: {0}")]
    Link(#[from] LinkError),
    #[error("Actor Error: {0}")]
    Actor(#[from] ActorError),
    #[error("Relay Error: {0}")]
    Relay(#[from] RelayError),
    #[error("Driver Error: {0}")]
    Driver(#[from] DriverError),
    #[error("Shutdown: {}", .0.reason)]
    Shutdown(InternalShutdown),
}

impl ScadaError {
    /// Process exit code; anything before the runtime is up is a fatal
    /// init error
    pub fn exit_code(&self) -> i32 {
        match self {
            ScadaError::Shutdown(shutdown) => shutdown.exit_code,
            _ => InternalShutdown::INIT_ERROR,
        }
    }
}

pub type ScadaResult<T> = Result<T, ScadaError>;
