use scada_types::{InternalShutdown, LinkState, LinkStateChange, Message, Payload};

use crate::{
    codec,
    fsm::{self, LinkInput},
    ClientEvent, HeartbeatTracker, LinkError, LinkName, LinkSettings, MqttClient, Qos,
};

/// What a link asks of its manager after handling an event
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutput {
    StateChange(LinkStateChange),
    Inbound(Message),
    /// An inbound frame that could not be used
    Malformed { summary: String, details: String },
    Shutdown { reason: String, exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq)]
struct Subscription {
    topic: String,
    acked: bool,
}

/// One broker connection and its lifecycle. All methods are
/// synchronous and take the current time, so the whole lifecycle can be
/// driven from tests.
pub struct Link {
    settings: LinkSettings,
    gnode_alias: String,
    state: LinkState,
    subscriptions: Vec<Subscription>,
    heartbeat: HeartbeatTracker,
    client: Box<dyn MqttClient>,
    connect_failures: u32,
    disconnected_since_ms: Option<i64>,
}

impl Link {
    pub fn new(settings: LinkSettings, gnode_alias: &str, client: Box<dyn MqttClient>) -> Self {
        let subscriptions = settings
            .subscriptions
            .iter()
            .map(|topic| Subscription {
                topic: topic.clone(),
                acked: false,
            })
            .collect();
        let heartbeat =
            HeartbeatTracker::new(settings.heartbeat_interval_s, settings.response_timeout_s);
        Self {
            settings,
            gnode_alias: gnode_alias.to_string(),
            state: LinkState::NotStarted,
            subscriptions,
            heartbeat,
            client,
            connect_failures: 0,
            disconnected_since_ms: None,
        }
    }

    pub fn name(&self) -> LinkName {
        self.settings.name
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peer_alias(&self) -> Option<&str> {
        self.settings.peer_alias.as_deref()
    }

    pub fn pending_subscriptions(&self) -> usize {
        self.subscriptions.iter().filter(|s| !s.acked).count()
    }

    fn apply(&mut self, input: LinkInput, outputs: &mut Vec<LinkOutput>) -> Result<(), LinkError> {
        let next = fsm::transition(self.state, input)?;
        if next == self.state {
            return Ok(());
        }
        log::info!(
            "Link {}: {} -> {} on {input:?}",
            self.settings.name,
            self.state,
            next
        );
        if matches!(next, LinkState::Active | LinkState::AwaitingSetup) {
            self.heartbeat.clear_deadline();
        }
        if next == LinkState::Active {
            self.disconnected_since_ms = None;
        }
        outputs.push(LinkOutput::StateChange(LinkStateChange {
            link: self.settings.name.to_string(),
            old_state: self.state,
            new_state: next,
        }));
        self.state = next;
        Ok(())
    }

    /// Like `apply`, for inputs raised by broker traffic where a
    /// rejected input is only worth a log line
    fn apply_logged(&mut self, input: LinkInput, outputs: &mut Vec<LinkOutput>) {
        if let Err(e) = self.apply(input, outputs) {
            log::warn!("Link {}: {e:}", self.settings.name);
        }
    }

    pub fn start(&mut self) -> Result<Vec<LinkOutput>, LinkError> {
        let mut outputs = vec![];
        self.apply(LinkInput::Start, &mut outputs)?;
        Ok(outputs)
    }

    pub fn stop(&mut self) -> Vec<LinkOutput> {
        let mut outputs = vec![];
        if self.state == LinkState::Stopped {
            return outputs;
        }
        self.apply_logged(LinkInput::Stop, &mut outputs);
        self.client
            .disconnect()
            .map_err(|e| log::debug!("Link {} disconnect: {e:}", self.settings.name))
            .ok();
        outputs
    }

    pub fn on_client_event(&mut self, event: ClientEvent, now_ms: i64) -> Vec<LinkOutput> {
        let mut outputs = vec![];
        if self.state == LinkState::Stopped {
            return outputs;
        }
        match event {
            ClientEvent::Connected => self.on_connected(&mut outputs),
            ClientEvent::ConnectFailed(reason) => {
                log::warn!("Link {} connect failed: {reason}", self.settings.name);
                self.connect_failures += 1;
                let input = if self.state == LinkState::Connecting {
                    LinkInput::MqttConnectFailed
                } else {
                    LinkInput::MqttDisconnected
                };
                self.apply_logged(input, &mut outputs);
                if self.connect_failures > self.settings.max_connect_retries {
                    outputs.push(LinkOutput::Shutdown {
                        reason: format!(
                            "Link {} gave up after {} connect attempts",
                            self.settings.name, self.connect_failures
                        ),
                        exit_code: InternalShutdown::CONNECT_RETRIES_EXHAUSTED,
                    });
                }
            }
            ClientEvent::AuthRefused(reason) => {
                log::error!("Link {} refused by broker: {reason}", self.settings.name);
                outputs.push(LinkOutput::Shutdown {
                    reason: format!("Link {} refused by broker: {reason}", self.settings.name),
                    exit_code: InternalShutdown::PROTOCOL_ERROR,
                });
            }
            ClientEvent::Disconnected(reason) => {
                log::warn!("Link {} disconnected: {reason}", self.settings.name);
                if self.disconnected_since_ms.is_none() {
                    self.disconnected_since_ms = Some(now_ms);
                }
                self.apply_logged(LinkInput::MqttDisconnected, &mut outputs);
            }
            ClientEvent::SubAck => self.on_suback(&mut outputs),
            ClientEvent::Publish { topic, payload } => {
                self.on_publish(&topic, &payload, now_ms, &mut outputs)
            }
        }
        outputs
    }

    fn on_connected(&mut self, outputs: &mut Vec<LinkOutput>) {
        self.connect_failures = 0;
        self.apply_logged(LinkInput::MqttConnected, outputs);
        self.heartbeat.reset();

        // subscriptions do not survive a reconnect
        for subscription in self.subscriptions.iter_mut() {
            subscription.acked = false;
            if let Err(e) = self.client.subscribe(&subscription.topic, Qos::AtLeastOnce) {
                log::error!(
                    "Link {} failed to subscribe to {}: {e:}",
                    self.settings.name,
                    subscription.topic
                );
            }
        }
        if self.subscriptions.is_empty() {
            self.setup_complete(outputs);
        }
    }

    fn on_suback(&mut self, outputs: &mut Vec<LinkOutput>) {
        let Some(oldest) = self.subscriptions.iter_mut().find(|s| !s.acked) else {
            log::debug!("Link {} ignoring unexpected suback", self.settings.name);
            return;
        };
        oldest.acked = true;
        let pending = self.pending_subscriptions();
        if pending == 0 {
            self.setup_complete(outputs);
        } else {
            self.apply_logged(LinkInput::SubAck { pending }, outputs);
        }
    }

    fn setup_complete(&mut self, outputs: &mut Vec<LinkOutput>) {
        self.apply_logged(LinkInput::SubAck { pending: 0 }, outputs);
        if self.settings.peer_alias.is_none() {
            self.apply_logged(LinkInput::MessageFromPeer, outputs);
        }
    }

    fn on_publish(&mut self, topic: &str, payload: &[u8], now_ms: i64, outputs: &mut Vec<LinkOutput>) {
        let message = match codec::decode(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Link {} dropping frame on {topic}: {e:}", self.settings.name);
                outputs.push(LinkOutput::Malformed {
                    summary: "bad_frame".to_string(),
                    details: format!("{} topic {topic}: {e:}", self.settings.name),
                });
                return;
            }
        };

        let from_peer = self.settings.peer_alias.as_deref() == Some(message.src());
        if from_peer {
            self.apply_logged(LinkInput::MessageFromPeer, outputs);
        }
        match &message.payload {
            Payload::Heartbeat(heartbeat) if from_peer => {
                if !self.heartbeat.received(heartbeat, now_ms) {
                    log::debug!(
                        "Link {} heartbeat {} did not echo our digit",
                        self.settings.name,
                        heartbeat.your_last_hex
                    );
                }
            }
            _ => outputs.push(LinkOutput::Inbound(message)),
        }
    }

    /// Periodic upkeep: heartbeats, echo deadlines and the disconnect budget
    pub fn tick(&mut self, now_ms: i64) -> Vec<LinkOutput> {
        let mut outputs = vec![];
        if let Some(since) = self.disconnected_since_ms {
            let budget_ms = (self.settings.disconnect_budget_s * 1000) as i64;
            if self.state != LinkState::Stopped && now_ms - since > budget_ms {
                outputs.push(LinkOutput::Shutdown {
                    reason: format!(
                        "Link {} disconnected for more than {}s",
                        self.settings.name, self.settings.disconnect_budget_s
                    ),
                    exit_code: InternalShutdown::DISCONNECT_BUDGET_EXCEEDED,
                });
            }
        }

        let Some(peer) = self.settings.peer_alias.clone() else {
            return outputs;
        };
        let connected = matches!(
            self.state,
            LinkState::AwaitingSetupAndPeer
                | LinkState::AwaitingSetup
                | LinkState::AwaitingPeer
                | LinkState::Active
        );
        if !connected {
            return outputs;
        }

        if matches!(self.state, LinkState::Active | LinkState::AwaitingSetup)
            && self.heartbeat.timed_out(now_ms)
        {
            log::warn!("Link {} heartbeat echo timed out", self.settings.name);
            self.heartbeat.clear_deadline();
            self.apply_logged(LinkInput::ResponseTimeout, &mut outputs);
        }

        if self.heartbeat.due(now_ms) {
            let heartbeat = self.heartbeat.next(now_ms);
            let message = Message::new(&self.gnode_alias, peer, Payload::Heartbeat(heartbeat));
            if let Err(e) = self.publish(&message) {
                log::warn!("Link {} heartbeat not sent: {e:}", self.settings.name);
            }
        }
        outputs
    }

    /// Publish on this link. Only heartbeats go out before the link is
    /// active.
    pub fn publish(&self, message: &Message) -> Result<(), LinkError> {
        let is_heartbeat = matches!(message.payload, Payload::Heartbeat(_));
        if self.state != LinkState::Active && !is_heartbeat {
            return Err(LinkError::NotConnected {
                link: self.settings.name,
                state: self.state,
            });
        }
        let (topic, bytes) = codec::encode(message)?;
        self.client
            .publish(&topic, codec::qos_for(&message.payload), bytes)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{ClientError, MqttSettings};
    use scada_types::{Heartbeat, SiegLoopReady};
    use std::sync::{Arc, Mutex};

    pub(crate) const PEER: &str = "hw1.isone.me.versant.keene.beech";
    pub(crate) const ME: &str = "hw1.isone.me.versant.keene.beech.scada";

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Subscribe(String),
        Publish(String, Qos),
        Disconnect,
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingClient {
        pub calls: Arc<Mutex<Vec<Call>>>,
    }

    impl MqttClient for RecordingClient {
        fn subscribe(&self, topic: &str, _qos: Qos) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(Call::Subscribe(topic.into()));
            Ok(())
        }

        fn publish(&self, topic: &str, qos: Qos, _payload: Vec<u8>) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(Call::Publish(topic.into(), qos));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(Call::Disconnect);
            Ok(())
        }
    }

    pub(crate) fn upstream_settings() -> LinkSettings {
        LinkSettings::new(LinkName::Upstream, "scada-test", MqttSettings::default())
            .with_peer(PEER)
            .subscribe(codec::topic_filter(PEER))
            .subscribe(format!("{}/#", ME.replace('.', "-")))
    }

    fn upstream() -> (Link, RecordingClient) {
        let client = RecordingClient::default();
        (
            Link::new(upstream_settings(), ME, Box::new(client.clone())),
            client,
        )
    }

    pub(crate) fn peer_frame(payload: Payload) -> ClientEvent {
        let message = Message::new(PEER, ME, payload);
        let (topic, payload) = codec::encode(&message).unwrap();
        ClientEvent::Publish { topic, payload }
    }

    fn states(outputs: &[LinkOutput]) -> Vec<LinkState> {
        outputs
            .iter()
            .filter_map(|o| match o {
                LinkOutput::StateChange(c) => Some(c.new_state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn subscription_cycle() {
        let (mut link, client) = upstream();
        assert_eq!(states(&link.start().unwrap()), vec![LinkState::Connecting]);

        let out = link.on_client_event(ClientEvent::Connected, 0);
        assert_eq!(states(&out), vec![LinkState::AwaitingSetupAndPeer]);
        assert_eq!(link.pending_subscriptions(), 2);
        assert_eq!(
            client
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| matches!(c, Call::Subscribe(_)))
                .count(),
            2
        );

        let out = link.on_client_event(ClientEvent::SubAck, 10);
        assert!(states(&out).is_empty());
        assert_eq!(link.state(), LinkState::AwaitingSetupAndPeer);

        let out = link.on_client_event(ClientEvent::SubAck, 20);
        assert_eq!(states(&out), vec![LinkState::AwaitingPeer]);

        let out = link.on_client_event(peer_frame(Payload::SiegLoopReady(SiegLoopReady {})), 30);
        assert_eq!(states(&out), vec![LinkState::Active]);
        assert!(matches!(out.last(), Some(LinkOutput::Inbound(_))));
    }

    #[test]
    fn peer_before_setup() {
        let (mut link, _) = upstream();
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        let out = link.on_client_event(peer_frame(Payload::SiegLoopReady(SiegLoopReady {})), 1);
        assert_eq!(states(&out), vec![LinkState::AwaitingSetup]);
        link.on_client_event(ClientEvent::SubAck, 2);
        assert_eq!(link.state(), LinkState::AwaitingSetup);
        let out = link.on_client_event(ClientEvent::SubAck, 3);
        assert_eq!(states(&out), vec![LinkState::Active]);
    }

    #[test]
    fn link_without_peer_is_active_after_setup() {
        let client = RecordingClient::default();
        let settings = LinkSettings::new(LinkName::Local, "scada-test", MqttSettings::default())
            .subscribe("admin/#");
        let mut link = Link::new(settings, ME, Box::new(client));
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        let out = link.on_client_event(ClientEvent::SubAck, 1);
        assert_eq!(states(&out), vec![LinkState::AwaitingPeer, LinkState::Active]);
    }

    #[test]
    fn reconnect_reasserts_subscriptions() {
        let (mut link, client) = upstream();
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        link.on_client_event(ClientEvent::SubAck, 0);
        link.on_client_event(ClientEvent::SubAck, 0);
        link.on_client_event(peer_frame(Payload::SiegLoopReady(SiegLoopReady {})), 0);
        assert_eq!(link.state(), LinkState::Active);

        let out = link.on_client_event(ClientEvent::Disconnected("gone".into()), 100);
        assert_eq!(states(&out), vec![LinkState::Connecting]);
        client.calls.lock().unwrap().clear();
        link.on_client_event(ClientEvent::Connected, 200);
        assert_eq!(link.pending_subscriptions(), 2);
        assert_eq!(client.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn publish_requires_active_except_heartbeats() {
        let (mut link, client) = upstream();
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        let msg = Message::new(ME, PEER, Payload::SiegLoopReady(SiegLoopReady {}));
        assert!(matches!(
            link.publish(&msg),
            Err(LinkError::NotConnected { .. })
        ));

        // heartbeat goes out while still awaiting setup
        link.tick(0);
        assert!(client
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, Call::Publish(t, _) if t.ends_with("/heartbeat-b"))));
    }

    #[test]
    fn missed_echo_drops_to_awaiting_peer() {
        let (mut link, _) = upstream();
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        link.on_client_event(ClientEvent::SubAck, 0);
        link.on_client_event(ClientEvent::SubAck, 0);
        link.on_client_event(peer_frame(Payload::SiegLoopReady(SiegLoopReady {})), 0);
        assert_eq!(link.state(), LinkState::Active);

        link.tick(1_000);
        let out = link.tick(1_000 + 65_000);
        assert_eq!(states(&out), vec![LinkState::AwaitingPeer]);

        // any peer heartbeat brings it back
        let out = link.on_client_event(
            peer_frame(Payload::Heartbeat(Heartbeat {
                my_hex: '3',
                your_last_hex: 'x',
                send_time_unix_ms: 0,
                last_received_time_unix_ms: 0,
                starting_over: false,
            })),
            70_000,
        );
        assert_eq!(states(&out), vec![LinkState::Active]);
        assert!(!out.iter().any(|o| matches!(o, LinkOutput::Inbound(_))));
    }

    #[test]
    fn retries_exhausted() {
        let mut settings = upstream_settings();
        settings.max_connect_retries = 2;
        let mut link = Link::new(settings, ME, Box::new(RecordingClient::default()));
        link.start().unwrap();
        for _ in 0..2 {
            let out = link.on_client_event(ClientEvent::ConnectFailed("refused".into()), 0);
            assert!(!out.iter().any(|o| matches!(o, LinkOutput::Shutdown { .. })));
        }
        let out = link.on_client_event(ClientEvent::ConnectFailed("refused".into()), 0);
        assert!(out.contains(&LinkOutput::Shutdown {
            reason: "Link gridworks gave up after 3 connect attempts".into(),
            exit_code: 1
        }));
    }

    #[test]
    fn disconnect_budget() {
        let mut settings = upstream_settings();
        settings.disconnect_budget_s = 10;
        let mut link = Link::new(settings, ME, Box::new(RecordingClient::default()));
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        link.on_client_event(ClientEvent::Disconnected("gone".into()), 1_000);
        assert!(link.tick(11_000).is_empty());
        let out = link.tick(11_001);
        assert!(matches!(
            out.as_slice(),
            [LinkOutput::Shutdown { exit_code: 2, .. }]
        ));
    }

    #[test]
    fn auth_refusal_is_a_protocol_error() {
        let (mut link, _) = upstream();
        link.start().unwrap();
        let out = link.on_client_event(ClientEvent::AuthRefused("NotAuthorized".into()), 0);
        assert!(matches!(
            out.as_slice(),
            [LinkOutput::Shutdown { exit_code: 3, .. }]
        ));
    }

    #[test]
    fn malformed_frames_are_reported() {
        let (mut link, _) = upstream();
        link.start().unwrap();
        link.on_client_event(ClientEvent::Connected, 0);
        let out = link.on_client_event(
            ClientEvent::Publish {
                topic: "a/b/c".into(),
                payload: b"{}".to_vec(),
            },
            0,
        );
        assert!(matches!(out.as_slice(), [LinkOutput::Malformed { .. }]));
        assert_eq!(link.state(), LinkState::AwaitingSetupAndPeer);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut link, client) = upstream();
        link.start().unwrap();
        assert_eq!(states(&link.stop()), vec![LinkState::Stopped]);
        assert!(link.stop().is_empty());
        assert_eq!(
            client
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == Call::Disconnect)
                .count(),
            1
        );
    }
}
