use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::{Handle, TriggerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

/// Upstream-bound record of a protocol or authority violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Glitch {
    pub from_gnode_alias: String,
    pub node: String,
    pub log_level: LogLevel,
    pub summary: String,
    pub details: String,
    pub created_ms: i64,
}

/// Driver or runtime trouble worth telling the cloud about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProblemEvent {
    pub src: String,
    pub problem_type: LogLevel,
    pub summary: String,
    pub details: String,
    pub time_created_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    pub my_hex: char,
    pub your_last_hex: char,
    pub send_time_unix_ms: i64,
    pub last_received_time_unix_ms: i64,
    pub starting_over: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdminWakesUp {
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdminReleasesControl {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SingleMachineState {
    pub machine_handle: Handle,
    pub state_enum: String,
    pub state: String,
    pub unix_ms: i64,
    pub cause: Option<TriggerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SiegLoopReady {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PatInternalWatchdog {
    pub src: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InternalShutdown {
    pub reason: String,
    pub exit_code: i32,
}

impl InternalShutdown {
    pub const CLEAN: i32 = 0;
    pub const CONNECT_RETRIES_EXHAUSTED: i32 = 1;
    pub const DISCONNECT_BUDGET_EXCEEDED: i32 = 2;
    pub const PROTOCOL_ERROR: i32 = 3;
    pub const INIT_ERROR: i32 = 4;
    pub const WATCHDOG_TIMEOUT: i32 = 5;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewCommandTree {
    pub handles: BTreeMap<String, Handle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    NotStarted,
    Connecting,
    AwaitingSetupAndPeer,
    AwaitingSetup,
    AwaitingPeer,
    Active,
    Stopped,
}

impl LinkState {
    pub const ALL: [LinkState; 7] = [
        LinkState::NotStarted,
        LinkState::Connecting,
        LinkState::AwaitingSetupAndPeer,
        LinkState::AwaitingSetup,
        LinkState::AwaitingPeer,
        LinkState::Active,
        LinkState::Stopped,
    ];
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::NotStarted => "not_started",
            LinkState::Connecting => "connecting",
            LinkState::AwaitingSetupAndPeer => "awaiting_setup_and_peer",
            LinkState::AwaitingSetup => "awaiting_setup",
            LinkState::AwaitingPeer => "awaiting_peer",
            LinkState::Active => "active",
            LinkState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinkStateChange {
    pub link: String,
    pub old_state: LinkState,
    pub new_state: LinkState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PowerWatts {
    pub watts: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatchTelegram {
    pub about_node: String,
    pub on: bool,
    pub send_time_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SingleReading {
    pub channel_name: String,
    pub value: i64,
    pub scada_read_time_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub from_gnode_alias: String,
    pub snapshot_time_unix_ms: i64,
    pub readings: Vec<SingleReading>,
}

/// A multiplexer's bus is initialized and pins can be driven
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActuatorsReady {}

/// Self-addressed timer message for slow valves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActuationSettled {
    pub relay_name: String,
    pub trigger_id: TriggerId,
}

/// Self-addressed timer message for the heat pump boss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HpTurnOnWaitExpired {
    pub attempt: u64,
}
