use crate::timesync::{ClockAlignment, WallClockSource};
use crate::types::{Camera, CanFrameRow, LogTextRow, SignalSample, VideoFrameRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Segment attributes written on upsert
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    pub route_id: String,
    pub segment_number: u32,
    pub dongle_id: Option<String>,
    /// Definition files the CAN samples were decoded with
    pub dbc_file: Option<String>,
    pub clock: ClockAlignment,
    pub log_path: Option<String>,
    pub video_paths: BTreeMap<Camera, String>,
    pub thumbnail_path: Option<String>,
    pub total_events: u64,
}

impl SegmentHeader {
    pub fn new(route_id: impl Into<String>, segment_number: u32) -> Self {
        Self {
            route_id: route_id.into(),
            segment_number,
            dongle_id: None,
            dbc_file: None,
            clock: ClockAlignment::unavailable(),
            log_path: None,
            video_paths: BTreeMap::new(),
            thumbnail_path: None,
            total_events: 0,
        }
    }

    /// Unix seconds at which segment 0 of the route started
    pub fn route_start_timestamp(&self) -> Option<i64> {
        self.clock
            .gps_timestamp_s
            .map(|gps| gps - i64::from(self.segment_number) * 60)
    }
}

/// Rows owned by one segment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentChildren {
    pub samples: Vec<SignalSample>,
    pub can_frames: Vec<CanFrameRow>,
    pub log_messages: Vec<LogTextRow>,
    pub video_frames: Vec<VideoFrameRow>,
}

impl SegmentChildren {
    pub fn counts(&self) -> ChildRowCounts {
        ChildRowCounts {
            samples: self.samples.len() as u64,
            can_frames: self.can_frames.len() as u64,
            log_messages: self.log_messages.len() as u64,
            video_frames: self.video_frames.len() as u64,
        }
    }
}

/// Row counts per child table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChildRowCounts {
    pub samples: u64,
    pub can_frames: u64,
    pub log_messages: u64,
    pub video_frames: u64,
}

impl ChildRowCounts {
    pub fn total(&self) -> u64 {
        self.samples + self.can_frames + self.log_messages + self.video_frames
    }
}

/// Result of a segment upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub segment_id: i64,
    pub route_created: bool,
    /// True when an existing segment was updated in place
    pub replaced_existing: bool,
    pub removed: ChildRowCounts,
    pub inserted: ChildRowCounts,
}

/// Result of a route deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionOutcome {
    pub route_id: String,
    pub route_existed: bool,
    pub segments: u64,
    pub removed: ChildRowCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRecord {
    pub route_id: String,
    pub dongle_id: Option<String>,
    pub dbc_file: Option<String>,
    pub start_timestamp: Option<i64>,
    pub total_segments: u64,
    pub total_events: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentRecord {
    pub segment_id: i64,
    pub route_id: String,
    pub segment_number: u32,
    pub start_time_ns: Option<u64>,
    pub end_time_ns: Option<u64>,
    pub duration_secs: Option<f64>,
    pub wall_time_offset_ns: i64,
    pub wall_clock_source: WallClockSource,
    pub gps_timestamp: Option<i64>,
    pub log_path: Option<String>,
    pub video_paths: BTreeMap<Camera, String>,
    pub thumbnail_path: Option<String>,
    pub total_events: u64,
    pub imported_at: DateTime<Utc>,
}

impl SegmentRecord {
    pub fn clock(&self) -> ClockAlignment {
        ClockAlignment {
            start_mono_ns: self.start_time_ns,
            end_mono_ns: self.end_time_ns,
            wall_time_offset_ns: self.wall_time_offset_ns,
            source: self.wall_clock_source,
            gps_timestamp_s: self.gps_timestamp,
        }
    }
}

/// A signal computed on query from a formula over stored signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomSignal {
    pub signal_name: String,
    pub formula: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A decoded sample as returned by range queries
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplePoint {
    pub time_ns: u64,
    pub value: f64,
}

/// Per-signal summary of one segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSummary {
    pub signal_name: String,
    pub samples: u64,
    pub first_time_ns: u64,
    pub last_time_ns: u64,
    pub unit: Option<String>,
}

/// Row counts across the whole store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub routes: u64,
    pub segments: u64,
    pub rows: ChildRowCounts,
    pub structured_definitions: u64,
    pub can_definitions: u64,
    pub custom_signals: u64,
}
