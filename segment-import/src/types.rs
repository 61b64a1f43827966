//! Core types for the segment import library
//!
//! This module defines the typed messages emitted by the log decoder, the rows
//! accumulated for storage, and the error type shared by every stage of an
//! import.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result type for import operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// Errors that can occur while decoding, loading definitions or storing a segment
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Compressed log input is not supported ({format}); decompress the file first")]
    CompressedInput { format: &'static str },

    #[error("Truncated frame header at byte offset {offset}: expected {expected} bytes, found {available}")]
    TruncatedHeader {
        offset: u64,
        expected: usize,
        available: usize,
    },

    #[error("Truncated frame at byte offset {offset}: payload declares {declared} bytes, found {available}")]
    TruncatedFrame {
        offset: u64,
        declared: usize,
        available: usize,
    },

    #[error("Corrupt frame header at byte offset {offset}: {reason}")]
    CorruptHeader { offset: u64, reason: String },

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid formula: {0}")]
    InvalidFormula(String),

    #[error("Invalid segment path: {0}")]
    InvalidSegmentPath(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(i64),

    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Invalid transaction state: {0}")]
    TransactionState(String),

    #[error("Foreign key violation: {rows} rows in {table} reference a missing parent")]
    ForeignKeyViolation { table: String, rows: u64 },

    #[error("Storage error while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Import cancelled after {messages_processed} messages")]
    Cancelled { messages_processed: u64 },

    #[error("Import deadline exceeded after {messages_processed} messages")]
    DeadlineExceeded { messages_processed: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for ImportError {
    fn from(source: rusqlite::Error) -> Self {
        ImportError::Storage {
            context: "executing a database statement".to_string(),
            source,
        }
    }
}

impl ImportError {
    /// True for errors that abort decoding of the whole log
    pub fn is_fatal_decode(&self) -> bool {
        matches!(
            self,
            ImportError::CompressedInput { .. }
                | ImportError::TruncatedHeader { .. }
                | ImportError::TruncatedFrame { .. }
                | ImportError::CorruptHeader { .. }
        )
    }

    /// True when the import stopped because the caller asked it to
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ImportError::Cancelled { .. } | ImportError::DeadlineExceeded { .. }
        )
    }
}

/// Kind of a free-text log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Error,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Info => "info",
            LogKind::Error => "error",
        }
    }
}

impl FromStr for LogKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(LogKind::Info),
            "error" => Ok(LogKind::Error),
            other => Err(ImportError::ValueOutOfRange(format!(
                "unknown log kind '{other}'"
            ))),
        }
    }
}

/// Camera a video file and its frame index belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Camera {
    /// Forward road camera
    Fcamera,
    /// Low resolution road camera
    Qcamera,
    /// Wide angle road camera
    Ecamera,
    /// Driver facing camera
    Dcamera,
}

impl Camera {
    pub const ALL: [Camera; 4] = [Camera::Fcamera, Camera::Qcamera, Camera::Ecamera, Camera::Dcamera];

    /// Camera for the index byte used in encode-index frames
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Camera::Fcamera),
            1 => Some(Camera::Qcamera),
            2 => Some(Camera::Ecamera),
            3 => Some(Camera::Dcamera),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            Camera::Fcamera => 0,
            Camera::Qcamera => 1,
            Camera::Ecamera => 2,
            Camera::Dcamera => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Camera::Fcamera => "fcamera",
            Camera::Qcamera => "qcamera",
            Camera::Ecamera => "ecamera",
            Camera::Dcamera => "dcamera",
        }
    }

    /// File name of this camera's video next to the log
    pub fn file_name(&self) -> &'static str {
        match self {
            Camera::Fcamera => "fcamera.hevc",
            Camera::Qcamera => "qcamera.ts",
            Camera::Ecamera => "ecamera.hevc",
            Camera::Dcamera => "dcamera.hevc",
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Camera {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        Camera::ALL
            .iter()
            .copied()
            .find(|camera| camera.as_str() == s)
            .ok_or_else(|| ImportError::ValueOutOfRange(format!("unknown camera '{s}'")))
    }
}

/// Raw CAN frame as embedded in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCanFrame {
    /// Bus address (arbitration ID)
    pub address: u32,
    /// Source bus number
    pub bus: u8,
    /// Frame data bytes (0-8 bytes)
    pub data: Vec<u8>,
}

impl RawCanFrame {
    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

/// Value of a field inside a vehicle-state record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Enum(u16),
}

impl FieldValue {
    /// Collapse to the uniform numeric representation stored per sample
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Float(v) => *v,
            FieldValue::Integer(v) => *v as f64,
            FieldValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            FieldValue::Enum(v) => f64::from(*v),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{:.3}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Enum(v) => write!(f, "enum({})", v),
        }
    }
}

/// A named field of a vehicle-state record
#[derive(Debug, Clone, PartialEq)]
pub struct StateField {
    pub name: String,
    pub value: FieldValue,
}

/// A GPS fix carrying wall-clock time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    /// Unix time in milliseconds, 0 when the receiver has no time lock
    pub unix_timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f32,
    pub has_fix: bool,
}

impl GpsFix {
    /// True when the fix carries usable wall-clock time
    pub fn has_wall_time(&self) -> bool {
        self.unix_timestamp_ms > 0
    }
}

/// Type-specific payload of a decoded log message
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Recording metadata written at logger start
    InitData {
        wall_time_ns: u64,
        dongle_id: String,
        version: String,
    },
    GpsLocation(GpsFix),
    /// Structured vehicle-state record whose numeric fields are signals
    VehicleState {
        message_type: String,
        fields: Vec<StateField>,
    },
    /// Raw CAN traffic observed since the previous CAN message
    Can(Vec<RawCanFrame>),
    /// Video frame index entry
    EncodeIndex {
        camera: Camera,
        frame_id: u32,
        timestamp_sof: u64,
    },
    Text { kind: LogKind, text: String },
}

/// One decoded message from the binary log
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    /// Byte offset of the frame header in the log
    pub offset: u64,
    /// Monotonic time in nanoseconds since device boot
    pub mono_time_ns: u64,
    pub payload: MessagePayload,
}

impl LogMessage {
    /// Message-type tag, stable across imports
    pub fn message_type(&self) -> &str {
        match &self.payload {
            MessagePayload::InitData { .. } => "initData",
            MessagePayload::GpsLocation(_) => "gpsLocation",
            MessagePayload::VehicleState { message_type, .. } => message_type,
            MessagePayload::Can(_) => "can",
            MessagePayload::EncodeIndex { camera, .. } => match camera {
                Camera::Fcamera => "roadEncodeIdx",
                Camera::Qcamera => "qRoadEncodeIdx",
                Camera::Ecamera => "wideRoadEncodeIdx",
                Camera::Dcamera => "driverEncodeIdx",
            },
            MessagePayload::Text { kind: LogKind::Info, .. } => "logMessage",
            MessagePayload::Text { kind: LogKind::Error, .. } => "errorLogMessage",
        }
    }
}

/// A decoded CAN signal with its physical value
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Signal name from the bus definition
    pub name: String,
    /// Physical value (raw * scale + offset)
    pub value: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Raw value before scaling (useful for debugging)
    pub raw_value: i64,
}

/// One row of the sample table
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSample {
    pub time_ns: u64,
    pub signal_name: String,
    pub value: f64,
}

/// One row of the raw CAN table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrameRow {
    pub time_ns: u64,
    pub address: u32,
    pub bus: u8,
    pub data: Vec<u8>,
}

/// Source metadata parsed from a structured log line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSource {
    pub daemon: Option<String>,
    pub levelnum: Option<i64>,
    pub filename: Option<String>,
    pub funcname: Option<String>,
    pub lineno: Option<i64>,
    pub dongle_id: Option<String>,
    pub version: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

/// One row of the log-message table
#[derive(Debug, Clone, PartialEq)]
pub struct LogTextRow {
    pub time_ns: u64,
    pub kind: LogKind,
    pub source: LogSource,
    pub message: String,
}

/// One row of the video frame timestamp table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameRow {
    pub camera: Camera,
    pub frame_number: u32,
    pub timestamp_sof: u64,
}

/// Inclusive monotonic time range in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ns: u64,
    pub end_ns: u64,
}

impl TimeRange {
    pub fn new(start_ns: u64, end_ns: u64) -> Self {
        Self { start_ns, end_ns }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self {
            start_ns: 0,
            end_ns: i64::MAX as u64,
        }
    }

    pub fn contains(&self, time_ns: u64) -> bool {
        time_ns >= self.start_ns && time_ns <= self.end_ns
    }
}
