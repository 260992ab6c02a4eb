//! JSON bodies carried inside protocol frames, one schema per message kind.

use serde::{Deserialize, Serialize};

use crate::alert::AlertRecord;
use crate::cache::{CacheEntry, Snapshot};
use crate::config::{BoardPoint, SetPoint};
use crate::protocol::ProtocolError;
use crate::threads::logic::LogicStatus;
use crate::threads::registry::ThreadStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub point_id: String,
    pub value: f64,
    /// Cache version, present on telemetry forwarded to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl Reading {
    pub fn new(point_id: impl Into<String>, value: f64) -> Self {
        Self {
            point_id: point_id.into(),
            value,
            version: None,
        }
    }
}

impl From<&CacheEntry> for Reading {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            point_id: entry.point_id.clone(),
            value: entry.value,
            version: Some(entry.version),
        }
    }
}

/// BoardTelemetry body. Timestamp 0 means "stamp on arrival".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub timestamp_ms: u64,
    pub readings: Vec<Reading>,
}

/// BoardCommand body, also the element type of the outgoing command queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardCommand {
    pub point_id: String,
    pub value: f64,
}

impl BoardCommand {
    pub fn new(point_id: impl Into<String>, value: f64) -> Self {
        Self {
            point_id: point_id.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    Hello { version: u16 },
    Ping,
    ReadPoint { point_id: String },
    /// Last unscaled value the board reported for a point.
    ReadRaw { point_id: String },
    ReadAll,
    ListPoints,
    ListSetPoints,
    GetSetPoint { name: String },
    SetSetPoint { name: String, target: f64 },
    ForcePoint { point_id: String, value: f64 },
    UnforcePoint { point_id: String },
    /// Manual command to an output point, queued for the board.
    WriteOutput { point_id: String, value: f64 },
    LogicStatus,
    Threads,
    Health,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub alerts: Vec<AlertRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Hello { version: u16 },
    Pong,
    Point(CacheEntry),
    Raw { point_id: String, raw: f64 },
    Snapshot(Snapshot),
    Points(Vec<BoardPoint>),
    SetPoints(Vec<SetPoint>),
    SetPoint(SetPoint),
    LogicStatus(LogicStatus),
    Threads(Vec<ThreadStatus>),
    Health(HealthReport),
    Ack,
    Failed { reason: String },
}

impl Reply {
    pub fn failed(reason: impl Into<String>) -> Self {
        Reply::Failed {
            reason: reason.into(),
        }
    }
}

/// ClientSubscribe body. An empty list subscribes to every point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub point_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Malformed,
    Truncated,
    UnknownType,
    UnexpectedType,
    BadRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&ProtocolError> for ErrorPayload {
    fn from(err: &ProtocolError) -> Self {
        let code = match err {
            ProtocolError::Malformed(_) => ErrorCode::Malformed,
            ProtocolError::Truncated { .. } => ErrorCode::Truncated,
            ProtocolError::UnknownType(_) => ErrorCode::UnknownType,
            ProtocolError::UnexpectedType(_) => ErrorCode::UnexpectedType,
            ProtocolError::BadPayload(_) => ErrorCode::BadRequest,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_shape() {
        let json = serde_json::to_string(&Query::SetSetPoint {
            name: "zone1_heat".into(),
            target: 20.5,
        })
        .unwrap();
        assert_eq!(json, r#"{"SetSetPoint":{"name":"zone1_heat","target":20.5}}"#);
        assert_eq!(serde_json::to_string(&Query::Ping).unwrap(), r#""Ping""#);
    }

    #[test]
    fn test_board_telemetry_defaults() {
        let payload: TelemetryPayload =
            serde_json::from_str(r#"{"readings":[{"point_id":"space_temp","value":6150}]}"#)
                .unwrap();
        assert_eq!(payload.timestamp_ms, 0);
        assert_eq!(payload.readings[0].version, None);
    }

    #[test]
    fn test_error_payload_codes() {
        let payload = ErrorPayload::from(&ProtocolError::Malformed("too long".into()));
        assert_eq!(payload.code, ErrorCode::Malformed);
        assert!(payload.message.contains("too long"));
    }
}
