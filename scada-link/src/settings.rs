use std::{fmt, path::PathBuf};

/// The two brokers the agent talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkName {
    /// Broker on the local network, used by the admin plane
    Local,
    /// Cloud broker shared with the AtomicTNode
    Upstream,
}

impl LinkName {
    pub const ALL: [LinkName; 2] = [LinkName::Local, LinkName::Upstream];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkName::Local => "local",
            LinkName::Upstream => "gridworks",
        }
    }
}

impl fmt::Display for LinkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ciphers: Option<String>,
}

impl TlsSettings {
    pub fn enabled(&self) -> bool {
        self.ca_cert.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keepalive_s: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsSettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive_s: 60,
            username: None,
            password: None,
            tls: TlsSettings::default(),
        }
    }
}

/// Everything one link needs beyond the broker connection itself
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub name: LinkName,
    pub client_id: String,
    pub mqtt: MqttSettings,
    /// Alias of the peer whose traffic proves the link is up. A link
    /// without a peer is active as soon as its subscriptions are acked.
    pub peer_alias: Option<String>,
    pub subscriptions: Vec<String>,
    pub heartbeat_interval_s: u64,
    pub response_timeout_s: u64,
    pub max_connect_retries: u32,
    pub disconnect_budget_s: u64,
    pub reconnect_delay_ms: u64,
}

impl LinkSettings {
    pub fn new(name: LinkName, client_id: impl Into<String>, mqtt: MqttSettings) -> Self {
        Self {
            name,
            client_id: client_id.into(),
            mqtt,
            peer_alias: None,
            subscriptions: vec![],
            heartbeat_interval_s: 30,
            response_timeout_s: 65,
            max_connect_retries: 20,
            disconnect_budget_s: 600,
            reconnect_delay_ms: 2000,
        }
    }

    pub fn with_peer(mut self, peer_alias: impl Into<String>) -> Self {
        self.peer_alias = Some(peer_alias.into());
        self
    }

    pub fn subscribe(mut self, topic: impl Into<String>) -> Self {
        self.subscriptions.push(topic.into());
        self
    }
}
