use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::Duration,
};

use crate::{
    client::{ClientError, ClientEvent, MqttClient},
    LinkSettings, MqttSettings, Qos,
};

// Requests queued between the client handle and its event loop
const REQUEST_CAPACITY: usize = 100;

/// [`MqttClient`] over a `rumqttc` connection. The event loop is polled
/// on a dedicated task that converts broker traffic into
/// [`ClientEvent`]s and keeps reconnecting until the client is dropped.
pub struct RumqttClient {
    client: AsyncClient,
    poll_task: tokio::task::JoinHandle<()>,
}

impl RumqttClient {
    pub fn start(
        settings: &LinkSettings,
    ) -> Result<(Self, UnboundedReceiver<ClientEvent>), ClientError> {
        let options = Self::options(&settings.client_id, &settings.mqtt)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (sender, receiver) = unbounded_channel();
        let reconnect_delay = Duration::from_millis(settings.reconnect_delay_ms);
        let name = settings.name;

        let poll_task = tokio::spawn(async move {
            let mut connected = false;
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected = true;
                        Some(ClientEvent::Connected)
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => Some(ClientEvent::SubAck),
                    Ok(Event::Incoming(Packet::Publish(publish))) => Some(ClientEvent::Publish {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }),
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected = false;
                        Some(ClientEvent::Disconnected("broker sent disconnect".to_string()))
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        log::debug!("Link {name} disconnect requested, stopping poll task");
                        Self::forward(&sender, ClientEvent::Disconnected("requested".into()));
                        break;
                    }
                    Ok(_) => None,
                    Err(ConnectionError::ConnectionRefused(code))
                        if matches!(
                            code,
                            ConnectReturnCode::BadUserNamePassword
                                | ConnectReturnCode::NotAuthorized
                        ) =>
                    {
                        connected = false;
                        if !Self::forward(&sender, ClientEvent::AuthRefused(format!("{code:?}"))) {
                            break;
                        }
                        tokio::time::sleep(reconnect_delay).await;
                        None
                    }
                    Err(e) => {
                        let event = if connected {
                            ClientEvent::Disconnected(e.to_string())
                        } else {
                            ClientEvent::ConnectFailed(e.to_string())
                        };
                        connected = false;
                        if !Self::forward(&sender, event) {
                            break;
                        }
                        tokio::time::sleep(reconnect_delay).await;
                        None
                    }
                };

                if let Some(event) = event {
                    if !Self::forward(&sender, event) {
                        break;
                    }
                }
            }
            log::debug!("Link {name} poll task exiting");
        });

        Ok((Self { client, poll_task }, receiver))
    }

    fn forward(sender: &UnboundedSender<ClientEvent>, event: ClientEvent) -> bool {
        sender.send(event).is_ok()
    }

    fn options(client_id: &str, mqtt: &MqttSettings) -> Result<MqttOptions, ClientError> {
        let mut options = MqttOptions::new(client_id, mqtt.host.clone(), mqtt.port);
        options.set_keep_alive(Duration::from_secs(mqtt.keepalive_s));
        if let Some(username) = &mqtt.username {
            options.set_credentials(username.clone(), mqtt.password.clone().unwrap_or_default());
        }

        if let Some(ca_path) = &mqtt.tls.ca_cert {
            let ca = std::fs::read(ca_path).map_err(|e| {
                log::error!("Unable to read CA cert at {}: {e:}", ca_path.display());
                e
            })?;
            let client_auth = match (&mqtt.tls.cert, &mqtt.tls.key) {
                (Some(cert), Some(key)) => Some((std::fs::read(cert)?, std::fs::read(key)?)),
                _ => None,
            };
            if mqtt.tls.ciphers.is_some() {
                log::warn!("Cipher selection is not supported, using the TLS defaults");
            }
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }
        Ok(options)
    }

    fn qos(qos: Qos) -> QoS {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

impl MqttClient for RumqttClient {
    fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), ClientError> {
        self.client
            .try_subscribe(topic, Self::qos(qos))
            .map_err(|e| ClientError::Mqtt(e.to_string()))
    }

    fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), ClientError> {
        self.client
            .try_publish(topic, Self::qos(qos), false, payload)
            .map_err(|e| ClientError::Mqtt(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), ClientError> {
        self.client
            .try_disconnect()
            .map_err(|e| ClientError::Mqtt(e.to_string()))
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        self.poll_task.abort();
    }
}
