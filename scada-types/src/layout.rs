//! The static hardware layout: who the agent is, which nodes exist, which
//! actor drives each of them, and the components those actors own.
//!
//! Loaded once at startup and never mutated afterwards. Everyone else
//! gets a read-only reference (`Arc<HardwareLayout>`).
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path};
use thiserror::Error;
use uuid::Uuid;

use crate::{handle, AboutFsm, FsmEventName, FsmEventType, Handle};

/// Upper bound for the heat pump's wait on the loop-ready signal
pub const MAX_HP_TURN_ON_TIMEOUT_S: u64 = 120;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Layout json Error")]
    Json(#[from] serde_json::Error),
    #[error("Invalid node name {0}")]
    InvalidName(String),
    #[error("Duplicate node {0}")]
    DuplicateNode(String),
    #[error("Handle {handle} does not end with the name of node {name}")]
    HandleMismatch { name: String, handle: Handle },
    #[error("Unknown node {0}")]
    UnknownNode(String),
    #[error("Node {name} is not a {expected:?}")]
    WrongActorClass { name: String, expected: ActorClass },
    #[error("Expected exactly one primary scada node, found {0}")]
    PrimaryScadaCount(usize),
    #[error("No multiplexer node for component {0}")]
    MissingComponent(String),
    #[error("Relay {0} has no relay config")]
    MissingRelayConfig(String),
    #[error("Relay {relay} cannot de-energize on {event}")]
    BadDeEnergizingEvent { relay: String, event: FsmEventName },
    #[error("Heat pump turn on timeout {0}s exceeds the maximum")]
    TurnOnTimeoutTooLong(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GNode {
    pub alias: String,
    pub g_node_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorClass {
    PrimaryScada,
    Relay,
    I2cRelayMultiplexer,
    HpBoss,
    Auto,
    HomeAlone,
    Atn,
    Admin,
    NoActor,
}

impl ActorClass {
    /// Classes hosted as actors inside this process
    pub fn is_local_actor(&self) -> bool {
        matches!(
            self,
            ActorClass::PrimaryScada
                | ActorClass::Relay
                | ActorClass::I2cRelayMultiplexer
                | ActorClass::HpBoss
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShNode {
    pub name: String,
    pub handle: Option<Handle>,
    pub actor_class: ActorClass,
    pub role: String,
    pub display_name: Option<String>,
    pub component_id: Option<String>,
}

impl ShNode {
    /// Handle as configured; a node without one is sidelined
    pub fn layout_handle(&self) -> Handle {
        self.handle
            .clone()
            .unwrap_or_else(|| Handle::from_name(&self.name))
    }
}

/// The pair of logical states a relay moves between, and their labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayKind {
    SimpleRelay,
    StoreFlowRelay,
    SlowValve,
}

impl RelayKind {
    pub fn event_type(&self) -> FsmEventType {
        match self {
            RelayKind::SimpleRelay => FsmEventType::ChangeRelayState,
            RelayKind::StoreFlowRelay => FsmEventType::ChangeStoreFlowRelay,
            RelayKind::SlowValve => FsmEventType::ChangeValveState,
        }
    }

    pub fn about_fsm(&self) -> AboutFsm {
        match self {
            RelayKind::SimpleRelay => AboutFsm::RelayState,
            RelayKind::StoreFlowRelay => AboutFsm::StoreFlowDirection,
            RelayKind::SlowValve => AboutFsm::ValveState,
        }
    }

    /// Label of the state an event leads to
    pub fn state_label(&self, event: FsmEventName) -> &'static str {
        match event {
            FsmEventName::OpenRelay => "RelayOpen",
            FsmEventName::CloseRelay => "RelayClosed",
            FsmEventName::DischargeStore => "ValvedtoDischargeStore",
            FsmEventName::ChargeStore => "ValvedtoChargeStore",
            FsmEventName::OpenValve => "ValveOpen",
            FsmEventName::CloseValve => "ValveClosed",
            _ => "Unknown",
        }
    }

    /// Label while a slow actuator is on its way to the state `event` leads to
    pub fn transit_label(&self, event: FsmEventName) -> &'static str {
        match event {
            FsmEventName::OpenRelay => "RelayOpening",
            FsmEventName::CloseRelay => "RelayClosing",
            FsmEventName::DischargeStore => "ValvingtoDischargeStore",
            FsmEventName::ChargeStore => "ValvingtoChargeStore",
            FsmEventName::OpenValve => "ValveOpening",
            FsmEventName::CloseValve => "ValveClosing",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayActorConfig {
    pub actor_name: String,
    pub relay_idx: u8,
    pub kind: RelayKind,
    pub de_energizing_event: FsmEventName,
    /// Physical actuation time for slow valves
    pub actuation_ms: Option<u64>,
}

impl RelayActorConfig {
    pub fn energizing_event(&self) -> FsmEventName {
        let [a, b] = self.kind.event_type().event_names();
        if a == self.de_energizing_event {
            b
        } else {
            a
        }
    }

    pub fn is_slow(&self) -> bool {
        self.actuation_ms.is_some_and(|ms| ms > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct I2cRelayComponent {
    pub component_id: String,
    pub display_name: Option<String>,
    pub bus: String,
    pub config_list: Vec<RelayActorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HpBossConfig {
    pub actor_name: String,
    pub hp_relay_name: String,
    pub turn_on_timeout_s: u64,
}

/// Components whose drivers live outside the core, kept as raw attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OtherComponent {
    pub component_id: String,
    pub type_name: String,
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataChannel {
    pub name: String,
    pub about_node_name: String,
    pub captured_by_node_name: String,
    pub telemetry_name: String,
    pub unit: String,
    pub capture_period_s: Option<u64>,
}

impl DataChannel {
    pub const DEFAULT_CAPTURE_PERIOD_S: u64 = 60;

    pub fn capture_period_s(&self) -> u64 {
        self.capture_period_s
            .unwrap_or(Self::DEFAULT_CAPTURE_PERIOD_S)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HardwareLayout {
    pub my_scada_g_node: GNode,
    pub my_atomic_t_node_g_node: GNode,
    pub my_terminal_asset_g_node: GNode,
    pub sh_nodes: Vec<ShNode>,
    #[serde(default)]
    pub i2c_relay_components: Vec<I2cRelayComponent>,
    #[serde(default)]
    pub hp_boss_configs: Vec<HpBossConfig>,
    #[serde(default)]
    pub other_components: Vec<OtherComponent>,
    #[serde(default)]
    pub data_channels: Vec<DataChannel>,
}

impl HardwareLayout {
    pub fn load(path: &Path) -> Result<Self, LayoutError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Unable to read layout at {}: {e:}", path.display());
            e
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, LayoutError> {
        let layout: HardwareLayout = serde_json::from_str(contents)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn scada_alias(&self) -> &str {
        &self.my_scada_g_node.alias
    }

    pub fn atn_alias(&self) -> &str {
        &self.my_atomic_t_node_g_node.alias
    }

    pub fn node(&self, name: &str) -> Option<&ShNode> {
        self.sh_nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes_of_class(&self, class: ActorClass) -> impl Iterator<Item = &ShNode> {
        self.sh_nodes.iter().filter(move |n| n.actor_class == class)
    }

    fn single_of_class(&self, class: ActorClass) -> Option<&ShNode> {
        self.nodes_of_class(class).next()
    }

    pub fn primary_scada(&self) -> Option<&ShNode> {
        self.single_of_class(ActorClass::PrimaryScada)
    }

    pub fn admin(&self) -> Option<&ShNode> {
        self.single_of_class(ActorClass::Admin)
    }

    pub fn atn(&self) -> Option<&ShNode> {
        self.single_of_class(ActorClass::Atn)
    }

    /// Component and config driving a relay actor
    pub fn relay_config(&self, relay_name: &str) -> Option<(&I2cRelayComponent, &RelayActorConfig)> {
        self.i2c_relay_components.iter().find_map(|component| {
            component
                .config_list
                .iter()
                .find(|c| c.actor_name == relay_name)
                .map(|c| (component, c))
        })
    }

    pub fn relay_component(&self, component_id: &str) -> Option<&I2cRelayComponent> {
        self.i2c_relay_components
            .iter()
            .find(|c| c.component_id == component_id)
    }

    /// Name of the multiplexer node owning the bus a relay sits on
    pub fn multiplexer_for_relay(&self, relay_name: &str) -> Option<&ShNode> {
        let (component, _) = self.relay_config(relay_name)?;
        self.nodes_of_class(ActorClass::I2cRelayMultiplexer)
            .find(|n| n.component_id.as_deref() == Some(component.component_id.as_str()))
    }

    pub fn hp_boss_config(&self, actor_name: &str) -> Option<&HpBossConfig> {
        self.hp_boss_configs
            .iter()
            .find(|c| c.actor_name == actor_name)
    }

    pub fn data_channel(&self, name: &str) -> Option<&DataChannel> {
        self.data_channels.iter().find(|c| c.name == name)
    }

    fn require_class(&self, name: &str, class: ActorClass) -> Result<(), LayoutError> {
        let node = self
            .node(name)
            .ok_or_else(|| LayoutError::UnknownNode(name.to_string()))?;
        if node.actor_class != class {
            return Err(LayoutError::WrongActorClass {
                name: name.to_string(),
                expected: class,
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let mut seen = HashSet::new();
        for node in &self.sh_nodes {
            if !handle::is_valid_name(&node.name) {
                return Err(LayoutError::InvalidName(node.name.clone()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(LayoutError::DuplicateNode(node.name.clone()));
            }
            if let Some(h) = &node.handle {
                if h.leaf() != handle::last_segment(&node.name) {
                    return Err(LayoutError::HandleMismatch {
                        name: node.name.clone(),
                        handle: h.clone(),
                    });
                }
            }
        }

        let primaries = self.nodes_of_class(ActorClass::PrimaryScada).count();
        if primaries != 1 {
            return Err(LayoutError::PrimaryScadaCount(primaries));
        }

        for component in &self.i2c_relay_components {
            if !self
                .nodes_of_class(ActorClass::I2cRelayMultiplexer)
                .any(|n| n.component_id.as_deref() == Some(component.component_id.as_str()))
            {
                return Err(LayoutError::MissingComponent(component.component_id.clone()));
            }
            for config in &component.config_list {
                self.require_class(&config.actor_name, ActorClass::Relay)?;
                if !config.kind.event_type().accepts(config.de_energizing_event) {
                    return Err(LayoutError::BadDeEnergizingEvent {
                        relay: config.actor_name.clone(),
                        event: config.de_energizing_event,
                    });
                }
            }
        }

        for relay in self.nodes_of_class(ActorClass::Relay) {
            if self.relay_config(&relay.name).is_none() {
                return Err(LayoutError::MissingRelayConfig(relay.name.clone()));
            }
        }

        for hp in &self.hp_boss_configs {
            self.require_class(&hp.actor_name, ActorClass::HpBoss)?;
            self.require_class(&hp.hp_relay_name, ActorClass::Relay)?;
            if hp.turn_on_timeout_s > MAX_HP_TURN_ON_TIMEOUT_S {
                return Err(LayoutError::TurnOnTimeoutTooLong(hp.turn_on_timeout_s));
            }
        }

        for channel in &self.data_channels {
            for name in [&channel.about_node_name, &channel.captured_by_node_name] {
                if self.node(name).is_none() {
                    return Err(LayoutError::UnknownNode(name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// A small but complete layout used across the workspace's tests
#[cfg(any(test, feature = "test-fixtures"))]
pub fn test_layout_json() -> &'static str {
    r#"{
  "MyScadaGNode": {"Alias": "hw1.isone.me.versant.keene.beech.scada", "GNodeId": "0384ef21-648b-4455-b917-58a1172d7fc1"},
  "MyAtomicTNodeGNode": {"Alias": "hw1.isone.me.versant.keene.beech", "GNodeId": "46ac6cb1-2f9a-4c36-a10b-2e2fb4ab1a2b"},
  "MyTerminalAssetGNode": {"Alias": "hw1.isone.me.versant.keene.beech.ta", "GNodeId": "a4f6c0c2-6bb4-4a38-ae05-1d1d4a6f4f6f"},
  "ShNodes": [
    {"Name": "s", "ActorClass": "PrimaryScada", "Role": "Scada", "DisplayName": "Primary scada"},
    {"Name": "auto", "Handle": "auto", "ActorClass": "Auto", "Role": "Boss"},
    {"Name": "home", "Handle": "auto.home", "ActorClass": "HomeAlone", "Role": "Boss"},
    {"Name": "a", "Handle": "a", "ActorClass": "Atn", "Role": "Boss"},
    {"Name": "admin", "ActorClass": "Admin", "Role": "Boss"},
    {"Name": "relay-multiplexer", "Handle": "auto.relay-multiplexer", "ActorClass": "I2cRelayMultiplexer", "Role": "RelayMultiplexer", "ComponentId": "relay-board"},
    {"Name": "vdc-relay", "Handle": "auto.home.vdc-relay", "ActorClass": "Relay", "Role": "Relay", "DisplayName": "24V DC relay"},
    {"Name": "store-charge-discharge-relay", "Handle": "auto.home.store-charge-discharge-relay", "ActorClass": "Relay", "Role": "Relay"},
    {"Name": "zone-valve", "Handle": "auto.home.zone-valve", "ActorClass": "Relay", "Role": "Relay"},
    {"Name": "hp-boss", "Handle": "auto.home.hp-boss", "ActorClass": "HpBoss", "Role": "Boss"},
    {"Name": "hp-scada-ops-relay", "Handle": "auto.home.hp-boss.hp-scada-ops-relay", "ActorClass": "Relay", "Role": "Relay"},
    {"Name": "hp-odu-pwr", "ActorClass": "NoActor", "Role": "PowerMeter"}
  ],
  "I2cRelayComponents": [
    {"ComponentId": "relay-board", "DisplayName": "Relay board", "Bus": "/dev/i2c-1", "ConfigList": [
      {"ActorName": "vdc-relay", "RelayIdx": 1, "Kind": "SimpleRelay", "DeEnergizingEvent": "CloseRelay"},
      {"ActorName": "store-charge-discharge-relay", "RelayIdx": 2, "Kind": "StoreFlowRelay", "DeEnergizingEvent": "DischargeStore"},
      {"ActorName": "zone-valve", "RelayIdx": 3, "Kind": "SlowValve", "DeEnergizingEvent": "CloseValve", "ActuationMs": 15000},
      {"ActorName": "hp-scada-ops-relay", "RelayIdx": 4, "Kind": "SimpleRelay", "DeEnergizingEvent": "OpenRelay"}
    ]}
  ],
  "HpBossConfigs": [
    {"ActorName": "hp-boss", "HpRelayName": "hp-scada-ops-relay", "TurnOnTimeoutS": 120}
  ],
  "OtherComponents": [
    {"ComponentId": "pwr-meter", "TypeName": "electric.meter.component", "DisplayName": "Power meter", "ModbusHost": "192.168.1.20"}
  ],
  "DataChannels": [
    {"Name": "hp-odu-pwr", "AboutNodeName": "hp-odu-pwr", "CapturedByNodeName": "s", "TelemetryName": "PowerW", "Unit": "W", "CapturePeriodS": 10}
  ]
}"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_test_layout() {
        let layout = HardwareLayout::from_json(test_layout_json()).unwrap();
        assert_eq!(layout.primary_scada().unwrap().name, "s");
        assert_eq!(
            layout.multiplexer_for_relay("vdc-relay").unwrap().name,
            "relay-multiplexer"
        );
        let (_, cfg) = layout.relay_config("vdc-relay").unwrap();
        assert_eq!(cfg.energizing_event(), FsmEventName::OpenRelay);
        let (_, valve) = layout.relay_config("zone-valve").unwrap();
        assert!(valve.is_slow());
        assert_eq!(layout.other_components[0].attributes["ModbusHost"], "192.168.1.20");
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(test_layout_json().as_bytes()).unwrap();
        let layout = HardwareLayout::load(file.path()).unwrap();
        assert_eq!(layout.atn_alias(), "hw1.isone.me.versant.keene.beech");
        assert!(matches!(
            HardwareLayout::load(Path::new("/nonexistent/layout.json")),
            Err(LayoutError::Io(_))
        ));
    }

    #[test]
    fn rejects_handle_name_mismatch() {
        let json = test_layout_json().replace(
            r#""Handle": "auto.home.vdc-relay""#,
            r#""Handle": "auto.home.other-relay""#,
        );
        assert!(matches!(
            HardwareLayout::from_json(&json),
            Err(LayoutError::HandleMismatch { .. })
        ));
    }

    #[test]
    fn rejects_foreign_de_energizing_event() {
        let json = test_layout_json().replace(
            r#""DeEnergizingEvent": "CloseRelay""#,
            r#""DeEnergizingEvent": "ChargeStore""#,
        );
        assert!(matches!(
            HardwareLayout::from_json(&json),
            Err(LayoutError::BadDeEnergizingEvent { .. })
        ));
    }

    #[test]
    fn rejects_slow_heat_pump_timeout() {
        let json = test_layout_json().replace(r#""TurnOnTimeoutS": 120"#, r#""TurnOnTimeoutS": 121"#);
        assert!(matches!(
            HardwareLayout::from_json(&json),
            Err(LayoutError::TurnOnTimeoutTooLong(121))
        ));
    }
}
