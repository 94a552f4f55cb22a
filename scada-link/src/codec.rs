//! Topic naming and frame encoding for messages on the wire.
//!
//! A message published by `hw1.isone.me.versant.keene.beech.scada` with
//! payload type `fsm.full.report` goes to the topic
//! `hw1-isone-me-versant-keene-beech-scada/fsm-full-report`.
use scada_types::{Message, Payload};

use crate::LinkError;

/// Delivery guarantee requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Telegrams are superseded by the next one, so losing one is fine
pub fn qos_for(payload: &Payload) -> Qos {
    if payload.is_telegram() {
        Qos::AtMostOnce
    } else {
        Qos::AtLeastOnce
    }
}

pub fn topic(src_alias: &str, type_name: &str) -> String {
    format!(
        "{}/{}",
        src_alias.replace('.', "-"),
        type_name.replace('.', "-")
    )
}

/// Subscription filter for everything published by `src_alias`
pub fn topic_filter(src_alias: &str) -> String {
    format!("{}/#", src_alias.replace('.', "-"))
}

/// Split an inbound topic `A/B` into source alias and type name, with
/// dots restored
pub fn decode_topic(topic: &str) -> Result<(String, String), LinkError> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(alias), Some(type_name), None) if !alias.is_empty() && !type_name.is_empty() => {
            Ok((alias.replace('-', "."), type_name.replace('-', ".")))
        }
        _ => Err(LinkError::BadTopic(topic.to_string())),
    }
}

pub fn encode(message: &Message) -> Result<(String, Vec<u8>), LinkError> {
    let topic = topic(message.src(), message.payload.type_name());
    Ok((topic, message.to_json()?))
}

/// Decode an inbound frame, checking it was published where its own
/// header says it should have been
pub fn decode(topic: &str, bytes: &[u8]) -> Result<Message, LinkError> {
    let (_, type_name) = decode_topic(topic)?;
    let message = Message::from_json(bytes)?;
    if message.header.message_type != type_name {
        return Err(LinkError::TopicMismatch {
            topic: topic.to_string(),
            message_type: message.header.message_type,
        });
    }
    Ok(message)
}
