/// Implementations of the MQTT client used by each link. Only
/// `rumqttc` is wired up for now; tests drive links through a recording
/// client instead.
mod rumqtt;
pub use rumqtt::RumqttClient;

use thiserror::Error;

use crate::Qos;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("MQTT client Error {0}")]
    Mqtt(String),
    #[error("Client is closed")]
    Closed,
}

/// What the broker connection reports back to its link
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    ConnectFailed(String),
    /// The broker refused our credentials
    AuthRefused(String),
    SubAck,
    Publish { topic: String, payload: Vec<u8> },
    Disconnected(String),
}

/// Trait to allow different implementations of the broker connection
/// under a link. Calls only queue requests; outcomes come back as
/// [`ClientEvent`]s.
pub trait MqttClient: Send {
    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), ClientError>;
    fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), ClientError>;
    fn disconnect(&self) -> Result<(), ClientError>;
}
