use futures::prelude::*;
use scada_types::{
    now_unix_ms, Glitch, InternalShutdown, LogLevel, Message, Payload, LINK_MANAGER_NAME,
    RUNTIME_NAME,
};
use std::collections::BTreeMap;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    time::Duration,
};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamMap};

use crate::{
    ClientEvent, Link, LinkError, LinkName, LinkOutput, LinkSettings, MqttClient, RumqttClient,
};

/// Requests from the runtime to the link manager
#[derive(Debug)]
pub enum LinkCommand {
    Publish { link: LinkName, message: Message },
    Stop,
}

/// Owns every link, fans their client events into one loop and
/// forwards decoded inbound messages to the runtime's queue
pub struct LinkManager {
    gnode_alias: String,
    primary_scada: String,
    links: BTreeMap<LinkName, Link>,
    events: StreamMap<LinkName, UnboundedReceiverStream<ClientEvent>>,
    inbound: UnboundedSender<Message>,
    tick_rate: Duration,
}

impl LinkManager {
    pub fn new(gnode_alias: &str, primary_scada: &str, inbound: UnboundedSender<Message>) -> Self {
        Self {
            gnode_alias: gnode_alias.to_string(),
            primary_scada: primary_scada.to_string(),
            links: BTreeMap::new(),
            events: StreamMap::new(),
            inbound,
            tick_rate: Duration::from_secs(1),
        }
    }

    /// Add a link driven by an already created client
    pub fn add_link(
        &mut self,
        settings: LinkSettings,
        client: Box<dyn MqttClient>,
        events: UnboundedReceiver<ClientEvent>,
    ) {
        let name = settings.name;
        self.links
            .insert(name, Link::new(settings, &self.gnode_alias, client));
        self.events
            .insert(name, UnboundedReceiverStream::new(events));
    }

    /// Add a link backed by a real broker connection
    pub fn connect(&mut self, settings: LinkSettings) -> Result<(), LinkError> {
        log::info!(
            "Connecting link {} to {}:{}",
            settings.name,
            settings.mqtt.host,
            settings.mqtt.port
        );
        let (client, events) = RumqttClient::start(&settings)?;
        self.add_link(settings, Box::new(client), events);
        Ok(())
    }

    pub fn link(&self, name: LinkName) -> Option<&Link> {
        self.links.get(&name)
    }

    /// Run the manager on its own task, taking requests from `commands`
    pub fn spawn(self, commands: UnboundedReceiver<LinkCommand>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(commands).await;
            log::warn!("Link manager exiting event loop");
        })
    }

    pub async fn run(mut self, mut commands: UnboundedReceiver<LinkCommand>) {
        let names: Vec<LinkName> = self.links.keys().copied().collect();
        for name in names {
            self.with_link(name, |link| {
                link.start()
                    .map_err(|e| log::error!("Link {name} failed to start: {e:}"))
                    .unwrap_or_default()
            });
        }

        let mut tick = tokio::time::interval(self.tick_rate);
        loop {
            tokio::select! {
                Some((name, event)) = self.events.next() => {
                    log::trace!("Link {name} client event {event:?}");
                    let now = now_unix_ms();
                    self.with_link(name, |link| link.on_client_event(event, now));
                }
                command = commands.recv() => {
                    match command {
                        Some(LinkCommand::Publish { link, message }) => {
                            if let Err(e) = self.publish(link, &message) {
                                log::debug!("Not published {}: {e:}", message.payload.type_name());
                            }
                        }
                        Some(LinkCommand::Stop) | None => {
                            self.stop();
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick(now_unix_ms());
                }
            };
        }
    }

    fn with_link<F>(&mut self, name: LinkName, f: F)
    where
        F: FnOnce(&mut Link) -> Vec<LinkOutput>,
    {
        let outputs = match self.links.get_mut(&name) {
            Some(link) => f(link),
            None => {
                log::error!("Event for unknown link {name}");
                return;
            }
        };
        self.handle_outputs(name, outputs);
    }

    pub fn tick(&mut self, now_ms: i64) {
        let names: Vec<LinkName> = self.links.keys().copied().collect();
        for name in names {
            self.with_link(name, |link| link.tick(now_ms));
        }
    }

    pub fn stop(&mut self) {
        let names: Vec<LinkName> = self.links.keys().copied().collect();
        for name in names {
            self.with_link(name, |link| link.stop());
        }
    }

    pub fn publish(&self, name: LinkName, message: &Message) -> Result<(), LinkError> {
        self.links
            .get(&name)
            .ok_or(LinkError::UnknownLink(name))?
            .publish(message)
    }

    fn to_runtime(&self, message: Message) {
        if let Err(e) = self.inbound.send(message) {
            log::error!("Runtime queue closed, dropping {}", e.0.payload.type_name());
        }
    }

    fn handle_outputs(&mut self, name: LinkName, outputs: Vec<LinkOutput>) {
        for output in outputs {
            match output {
                LinkOutput::StateChange(change) => self.to_runtime(Message::new(
                    LINK_MANAGER_NAME,
                    &self.primary_scada,
                    Payload::LinkStateChange(change),
                )),
                LinkOutput::Inbound(message) => self.to_runtime(message),
                LinkOutput::Malformed { summary, details } => {
                    let glitch = Glitch {
                        from_gnode_alias: self.gnode_alias.clone(),
                        node: name.to_string(),
                        log_level: LogLevel::Warning,
                        summary,
                        details,
                        created_ms: now_unix_ms(),
                    };
                    let atn = self
                        .links
                        .get(&LinkName::Upstream)
                        .and_then(Link::peer_alias)
                        .unwrap_or_default();
                    let message =
                        Message::new(&self.gnode_alias, atn, Payload::Glitch(glitch));
                    if let Err(e) = self.publish(LinkName::Upstream, &message) {
                        log::debug!("Glitch for malformed frame not sent upstream: {e:}");
                    }
                }
                LinkOutput::Shutdown { reason, exit_code } => {
                    log::error!("Link {name} requesting shutdown: {reason}");
                    self.to_runtime(Message::new(
                        LINK_MANAGER_NAME,
                        RUNTIME_NAME,
                        Payload::InternalShutdown(InternalShutdown { reason, exit_code }),
                    ));
                }
            }
        }
    }
}
