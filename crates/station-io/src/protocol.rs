//! Line-delimited JSON messages spoken on the command bridge.

use crate::monitor::LoggedEvent;
use serde::{Deserialize, Serialize};
use station_core::hardware::HardwareError;
use station_core::runner::{CommandError, StationSnapshot};
use station_core::torque::{SetpointUpdate, TaskParams, TorqueError};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn is_supported(&self) -> bool {
        self.major == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayAction {
    On,
    Off,
    Pulse,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello {
        #[serde(default = "ProtocolVersion::v1")]
        protocol_version: ProtocolVersion,
        #[serde(default)]
        client_id: Option<String>,
    },
    Status,
    Relay {
        name: String,
        action: RelayAction,
        /// Pulse length; the bridge default applies when absent.
        #[serde(default)]
        ms: Option<u64>,
    },
    Start,
    Stop,
    TorqueStatus,
    TorqueRestart,
    /// Reads the global setpoints, writing `set` first when present.
    TorqueGlobals {
        #[serde(default)]
        set: Option<SetpointUpdate>,
    },
    /// Reads one task block, or writes the given fields of it.
    TorqueTask {
        task: u16,
        #[serde(default)]
        set: Option<TaskParams>,
    },
    /// Recent driver and operator events, newest first.
    Events {
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, String> {
        serde_json::from_str(line).map_err(|e| e.to_string())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Status => "status",
            Request::Relay { .. } => "relay",
            Request::Start => "start",
            Request::Stop => "stop",
            Request::TorqueStatus => "torque_status",
            Request::TorqueRestart => "torque_restart",
            Request::TorqueGlobals { .. } => "torque_globals",
            Request::TorqueTask { .. } => "torque_task",
            Request::Events { .. } => "events",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub unix_us: u64,
    pub watch_mode: &'static str,
    #[serde(flatten)]
    pub snapshot: StationSnapshot,
}

#[derive(Debug, Serialize)]
pub struct AckMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub request: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
}

impl AckMsg {
    pub fn new(request: &'static str) -> Self {
        Self {
            msg_type: "ack",
            request,
            status: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TorqueMsg<T> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub request: &'static str,
    pub data: T,
}

impl<T: Serialize> TorqueMsg<T> {
    pub fn new(request: &'static str, data: T) -> Self {
        Self {
            msg_type: "torque",
            request,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventsMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub events: Vec<LoggedEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Busy,
    UnknownChannel,
    BadRequest,
    Transport,
    Unavailable,
}

impl From<&CommandError> for ErrorCode {
    fn from(err: &CommandError) -> Self {
        match err {
            CommandError::Busy => ErrorCode::Busy,
            CommandError::Hardware(HardwareError::UnknownChannel(_)) => ErrorCode::UnknownChannel,
            CommandError::Hardware(HardwareError::Transport { .. }) => ErrorCode::Transport,
            CommandError::Launch(_) => ErrorCode::Unavailable,
        }
    }
}

impl From<&TorqueError> for ErrorCode {
    fn from(err: &TorqueError) -> Self {
        match err {
            TorqueError::Transport(_) => ErrorCode::Transport,
            TorqueError::TaskBaseNotConfigured => ErrorCode::BadRequest,
            TorqueError::Unavailable(_) => ErrorCode::Unavailable,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            msg_type: "error",
            code,
            message: message.into(),
        }
    }
}

/// Serializes `msg` as one newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Vec<u8> {
    let mut line = serde_json::to_vec(msg).unwrap_or_else(|e| {
        format!(r#"{{"type":"error","code":"transport","message":"encode failed: {e}"}}"#)
            .into_bytes()
    });
    line.push(b'\n');
    line
}
