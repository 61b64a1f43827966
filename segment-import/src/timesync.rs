//! Clock alignment for one segment
//!
//! Every message carries monotonic time since device boot. The synchronizer
//! watches the message stream once and derives a single wall-clock offset so
//! that `real_time = monotonic_time + offset`. Video frame timestamps are in
//! the monotonic domain already and need no conversion.

use crate::types::{LogMessage, MessagePayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Init data is only trusted near the start of the log
pub const INIT_DATA_SEARCH_MESSAGES: u64 = 100;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Where the wall-clock offset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WallClockSource {
    Gps,
    InitData,
    /// No source found; the stored offset is the zero sentinel
    Unavailable,
}

impl WallClockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WallClockSource::Gps => "gps",
            WallClockSource::InitData => "init_data",
            WallClockSource::Unavailable => "none",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "gps" => WallClockSource::Gps,
            "init_data" => WallClockSource::InitData,
            _ => WallClockSource::Unavailable,
        }
    }
}

impl fmt::Display for WallClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of clock alignment for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockAlignment {
    pub start_mono_ns: Option<u64>,
    pub end_mono_ns: Option<u64>,
    pub wall_time_offset_ns: i64,
    pub source: WallClockSource,
    /// Unix seconds of the first GPS fix with wall time
    pub gps_timestamp_s: Option<i64>,
}

impl ClockAlignment {
    pub fn unavailable() -> Self {
        Self {
            start_mono_ns: None,
            end_mono_ns: None,
            wall_time_offset_ns: 0,
            source: WallClockSource::Unavailable,
            gps_timestamp_s: None,
        }
    }

    pub fn has_wall_clock(&self) -> bool {
        self.source != WallClockSource::Unavailable
    }

    /// Wall-clock nanoseconds for a monotonic timestamp, if known
    pub fn real_time_ns(&self, mono_time_ns: u64) -> Option<i64> {
        if !self.has_wall_clock() {
            return None;
        }
        wall_time_ns(mono_time_ns, self.wall_time_offset_ns)
    }

    pub fn real_time(&self, mono_time_ns: u64) -> Option<DateTime<Utc>> {
        self.real_time_ns(mono_time_ns).and_then(to_datetime)
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_mono_ns, self.end_mono_ns) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start) as f64 / NANOS_PER_SEC as f64),
            _ => None,
        }
    }
}

/// `mono + offset`, or None on overflow
pub fn wall_time_ns(mono_time_ns: u64, offset_ns: i64) -> Option<i64> {
    i64::try_from(mono_time_ns).ok()?.checked_add(offset_ns)
}

/// Convert unix nanoseconds to a UTC timestamp
pub fn to_datetime(unix_ns: i64) -> Option<DateTime<Utc>> {
    let secs = unix_ns.div_euclid(NANOS_PER_SEC);
    let nanos = unix_ns.rem_euclid(NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Observes messages in source order and derives the segment clock
#[derive(Debug)]
pub struct TimeSynchronizer {
    gps_window_ns: u64,
    messages_seen: u64,
    first_mono_ns: Option<u64>,
    start_mono_ns: Option<u64>,
    end_mono_ns: Option<u64>,
    gps_offset_ns: Option<i64>,
    init_offset_ns: Option<i64>,
    gps_timestamp_s: Option<i64>,
}

impl TimeSynchronizer {
    pub fn new(gps_search_window: Duration) -> Self {
        Self {
            gps_window_ns: u64::try_from(gps_search_window.as_nanos()).unwrap_or(u64::MAX),
            messages_seen: 0,
            first_mono_ns: None,
            start_mono_ns: None,
            end_mono_ns: None,
            gps_offset_ns: None,
            init_offset_ns: None,
            gps_timestamp_s: None,
        }
    }

    pub fn observe(&mut self, message: &LogMessage) {
        self.messages_seen += 1;
        let mono = message.mono_time_ns;
        let first = *self.first_mono_ns.get_or_insert(mono);
        self.start_mono_ns = Some(self.start_mono_ns.map_or(mono, |s| s.min(mono)));
        self.end_mono_ns = Some(self.end_mono_ns.map_or(mono, |e| e.max(mono)));

        match &message.payload {
            MessagePayload::InitData { wall_time_ns, .. }
                if self.init_offset_ns.is_none()
                    && *wall_time_ns > 0
                    && self.messages_seen <= INIT_DATA_SEARCH_MESSAGES =>
            {
                self.init_offset_ns = i64::try_from(*wall_time_ns)
                    .ok()
                    .zip(i64::try_from(mono).ok())
                    .and_then(|(wall, mono)| wall.checked_sub(mono));
            }
            MessagePayload::GpsLocation(fix) if fix.has_wall_time() => {
                if self.gps_timestamp_s.is_none() {
                    self.gps_timestamp_s = Some(fix.unix_timestamp_ms / 1000);
                }
                if self.gps_offset_ns.is_none() && mono.saturating_sub(first) <= self.gps_window_ns {
                    self.gps_offset_ns = fix
                        .unix_timestamp_ms
                        .checked_mul(NANOS_PER_MILLI)
                        .zip(i64::try_from(mono).ok())
                        .and_then(|(wall, mono)| wall.checked_sub(mono));
                    if let Some(offset) = self.gps_offset_ns {
                        log::debug!("GPS fix at t={} anchors wall clock (offset {} ns)", mono, offset);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn messages_seen(&self) -> u64 {
        self.messages_seen
    }

    /// Pick the best wall-clock source seen so far
    pub fn finish(&self) -> ClockAlignment {
        let (wall_time_offset_ns, source) = match (self.gps_offset_ns, self.init_offset_ns) {
            (Some(offset), _) => (offset, WallClockSource::Gps),
            (None, Some(offset)) => (offset, WallClockSource::InitData),
            (None, None) => (0, WallClockSource::Unavailable),
        };

        if source == WallClockSource::Unavailable {
            log::info!("No wall-clock source in segment; real time will be unknown");
        } else {
            log::debug!("Wall clock from {} (offset {} ns)", source, wall_time_offset_ns);
        }

        ClockAlignment {
            start_mono_ns: self.start_mono_ns,
            end_mono_ns: self.end_mono_ns,
            wall_time_offset_ns,
            source,
            gps_timestamp_s: self.gps_timestamp_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GpsFix, LogKind};

    const SEC: u64 = 1_000_000_000;

    fn message(mono_time_ns: u64, payload: MessagePayload) -> LogMessage {
        LogMessage {
            offset: 0,
            mono_time_ns,
            payload,
        }
    }

    fn text(mono_time_ns: u64) -> LogMessage {
        message(
            mono_time_ns,
            MessagePayload::Text {
                kind: LogKind::Info,
                text: String::new(),
            },
        )
    }

    fn gps(mono_time_ns: u64, unix_timestamp_ms: i64) -> LogMessage {
        message(
            mono_time_ns,
            MessagePayload::GpsLocation(GpsFix {
                unix_timestamp_ms,
                latitude: 0.0,
                longitude: 0.0,
                altitude: 0.0,
                speed: 0.0,
                has_fix: unix_timestamp_ms > 0,
            }),
        )
    }

    fn init(mono_time_ns: u64, wall_time_ns: u64) -> LogMessage {
        message(
            mono_time_ns,
            MessagePayload::InitData {
                wall_time_ns,
                dongle_id: "d".to_string(),
                version: "v".to_string(),
            },
        )
    }

    #[test]
    fn test_gps_offset_applies_to_every_sample() {
        let mut sync = TimeSynchronizer::new(Duration::from_secs(60));
        sync.observe(&text(100));
        sync.observe(&gps(250, 1_700_000_000_000));
        sync.observe(&text(400));

        let clock = sync.finish();
        let offset = 1_700_000_000_000 * 1_000_000 - 250;
        assert_eq!(clock.source, WallClockSource::Gps);
        assert_eq!(clock.wall_time_offset_ns, offset);
        assert_eq!(clock.real_time_ns(250), Some(250 + offset));
        assert_eq!(clock.real_time_ns(100), Some(100 + offset));
        assert_eq!(clock.start_mono_ns, Some(100));
        assert_eq!(clock.end_mono_ns, Some(400));
        assert_eq!(clock.gps_timestamp_s, Some(1_700_000_000));
    }

    #[test]
    fn test_no_source_is_unavailable() {
        let mut sync = TimeSynchronizer::new(Duration::from_secs(60));
        for t in [100, 250, 400] {
            sync.observe(&text(t));
        }

        let clock = sync.finish();
        assert_eq!(clock.source, WallClockSource::Unavailable);
        assert_eq!(clock.wall_time_offset_ns, 0);
        assert!(clock.real_time(250).is_none());
        assert_eq!(clock.start_mono_ns, Some(100));
    }

    #[test]
    fn test_gps_without_time_is_ignored() {
        let mut sync = TimeSynchronizer::new(Duration::from_secs(60));
        sync.observe(&gps(10, 0));
        sync.observe(&init(20, 5_000));

        let clock = sync.finish();
        assert_eq!(clock.source, WallClockSource::InitData);
        assert_eq!(clock.wall_time_offset_ns, 4_980);
        assert!(clock.gps_timestamp_s.is_none());
    }

    #[test]
    fn test_gps_outside_window_falls_back_to_init() {
        let mut sync = TimeSynchronizer::new(Duration::from_secs(60));
        sync.observe(&init(SEC, 10 * SEC));
        sync.observe(&gps(90 * SEC, 1_700_000_000_000));

        let clock = sync.finish();
        assert_eq!(clock.source, WallClockSource::InitData);
        assert_eq!(clock.wall_time_offset_ns, 9 * SEC as i64);
        // The late fix still records the segment GPS time
        assert_eq!(clock.gps_timestamp_s, Some(1_700_000_000));
    }

    #[test]
    fn test_late_init_data_is_ignored() {
        let mut sync = TimeSynchronizer::new(Duration::from_secs(60));
        for t in 0..INIT_DATA_SEARCH_MESSAGES {
            sync.observe(&text(t));
        }
        sync.observe(&init(200, 10 * SEC));

        assert_eq!(sync.finish().source, WallClockSource::Unavailable);
    }

    #[test]
    fn test_real_time_conversion() {
        let clock = ClockAlignment {
            start_mono_ns: Some(0),
            end_mono_ns: Some(60 * SEC),
            wall_time_offset_ns: 1_700_000_000 * SEC as i64,
            source: WallClockSource::Gps,
            gps_timestamp_s: Some(1_700_000_000),
        };
        let dt = clock.real_time(SEC / 2).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 500);
        assert_eq!(clock.duration_secs(), Some(60.0));
    }

    #[test]
    fn test_source_names() {
        for source in [WallClockSource::Gps, WallClockSource::InitData, WallClockSource::Unavailable] {
            assert_eq!(WallClockSource::from_str_lossy(source.as_str()), source);
        }
    }
}
