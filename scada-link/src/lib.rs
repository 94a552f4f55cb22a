//! The `scada-link` crate owns the agent's MQTT links: one logical link
//! per broker (the local broker used by the admin plane, and the cloud
//! broker shared with the AtomicTNode).
//!
//! Each [`Link`] runs the lifecycle state machine of [`fsm::transition`]:
//! 1. `connecting` until the broker accepts the connection
//! 2. `awaiting_setup_and_peer` while subscriptions are being acked and
//!    nothing has been heard from the peer yet
//! 3. `awaiting_setup` / `awaiting_peer` once one of the two is done
//! 4. `active` with every subscription acked and the peer heard from;
//!    heartbeats carrying a rolling hex digit keep proving it
//!
//! The [`LinkManager`] fans the client events of every link into one
//! task, forwards decoded inbound messages (and every link state change)
//! to the runtime's inbound queue, and publishes outbound messages on
//! request through [`LinkCommand`]s.

pub mod client;
pub mod codec;
pub mod fsm;
mod heartbeat;
mod link;
mod manager;
mod settings;

pub use client::{ClientError, ClientEvent, MqttClient, RumqttClient};
pub use codec::Qos;
pub use fsm::LinkInput;
pub use heartbeat::HeartbeatTracker;
pub use link::{Link, LinkOutput};
pub use manager::{LinkCommand, LinkManager};
pub use settings::{LinkName, LinkSettings, MqttSettings, TlsSettings};

use scada_types::{LinkState, SchemaError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Input {input:?} not allowed in state {state}")]
    InvalidInput { state: LinkState, input: LinkInput },
    #[error("Link {link} is {state}, not active")]
    NotConnected { link: LinkName, state: LinkState },
    #[error("Bad topic {0}")]
    BadTopic(String),
    #[error("Frame of type {message_type} arrived on topic {topic}")]
    TopicMismatch { topic: String, message_type: String },
    #[error("Schema Error")]
    Schema(#[from] SchemaError),
    #[error("MQTT client Error")]
    Client(#[from] ClientError),
    #[error("Unknown link {0}")]
    UnknownLink(LinkName),
}
