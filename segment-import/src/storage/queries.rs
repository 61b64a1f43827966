use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::bulk::with_write_transaction;
use super::models::{SamplePoint, SignalSummary, StoreStats, ChildRowCounts};
use super::segments::insert_samples;
use super::{get_u64, to_i64, with_identity, Store, StorageResultExt};
use crate::signals::{can_signal_identity, is_stored_signal_name, BusDefinitionSet};
use crate::types::{
    Camera, CanFrameRow, LogKind, LogSource, LogTextRow, Result, SignalSample, TimeRange,
    VideoFrameRow,
};

/// Prefix shared by every stored CAN signal identity
const CAN_SIGNAL_PATTERN: &str = "CAN\\_0x%";

/// Result of re-deriving a segment's CAN samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RematerializeOutcome {
    pub segment_id: i64,
    pub removed: u64,
    pub inserted: u64,
}

/// Decode stored raw frames into samples with the given definitions
pub(crate) fn decode_frames(frames: &[CanFrameRow], definitions: &BusDefinitionSet) -> Vec<SignalSample> {
    frames
        .iter()
        .flat_map(|frame| {
            definitions
                .decode(frame.address, &frame.data)
                .into_iter()
                .map(move |signal| SignalSample {
                    time_ns: frame.time_ns,
                    signal_name: can_signal_identity(frame.address, &signal.name),
                    value: signal.value,
                })
        })
        .collect()
}

impl Store {
    /// Samples of one signal within an inclusive time range, in time order
    ///
    /// Names of custom signals are computed from their formula.
    pub fn query_signal_range(&self, segment_id: i64, signal_name: &str, range: TimeRange) -> Result<Vec<SamplePoint>> {
        if !is_stored_signal_name(signal_name) {
            if let Some(custom) = self.get_custom_signal(signal_name)? {
                return self.calculate_custom_signal(segment_id, &custom, range);
            }
        }
        self.query_stored_range(segment_id, signal_name, range)
    }

    pub(crate) fn query_stored_range(&self, segment_id: i64, signal_name: &str, range: TimeRange) -> Result<Vec<SamplePoint>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT time_ns, value FROM timeseries_data
                 WHERE segment_id = ?1 AND signal_name = ?2 AND time_ns BETWEEN ?3 AND ?4
                 ORDER BY time_ns, rowid",
            )
            .storage_context(|| "preparing signal range query")?;
        let rows = stmt
            .query_map(
                params![
                    segment_id,
                    signal_name,
                    to_i64(range.start_ns, "start_ns")?,
                    to_i64(range.end_ns, "end_ns")?
                ],
                |row| {
                    Ok(SamplePoint {
                        time_ns: get_u64(row, "time_ns")?,
                        value: row.get("value")?,
                    })
                },
            )
            .storage_context(|| format!("querying {signal_name} in segment {segment_id}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| format!("reading {signal_name} samples"))
    }

    /// Every signal stored for a segment with its sample count and unit
    pub fn list_signals(&self, segment_id: i64) -> Result<Vec<SignalSummary>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT t.signal_name AS signal_name,
                        COUNT(*) AS samples,
                        MIN(t.time_ns) AS first_time_ns,
                        MAX(t.time_ns) AS last_time_ns,
                        COALESCE(s.unit, c.unit) AS unit
                 FROM timeseries_data t
                 LEFT JOIN structured_signal_definitions s ON s.full_name = t.signal_name
                 LEFT JOIN can_signal_definitions c ON c.full_name = t.signal_name
                 WHERE t.segment_id = ?1
                 GROUP BY t.signal_name
                 ORDER BY t.signal_name",
            )
            .storage_context(|| "preparing signal listing")?;
        let rows = stmt
            .query_map([segment_id], |row| {
                Ok(SignalSummary {
                    signal_name: row.get("signal_name")?,
                    samples: get_u64(row, "samples")?,
                    first_time_ns: get_u64(row, "first_time_ns")?,
                    last_time_ns: get_u64(row, "last_time_ns")?,
                    unit: row.get("unit")?,
                })
            })
            .storage_context(|| format!("listing signals of segment {segment_id}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| "reading signal listing")
    }

    /// Raw CAN frames, optionally restricted to one address
    pub fn query_can_frames(&self, segment_id: i64, address: Option<u32>, range: TimeRange) -> Result<Vec<CanFrameRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT time_ns, address, bus, data FROM can_messages
                 WHERE segment_id = ?1 AND (?2 IS NULL OR address = ?2)
                   AND time_ns BETWEEN ?3 AND ?4
                 ORDER BY time_ns, rowid",
            )
            .storage_context(|| "preparing CAN frame query")?;
        let rows = stmt
            .query_map(
                params![
                    segment_id,
                    address,
                    to_i64(range.start_ns, "start_ns")?,
                    to_i64(range.end_ns, "end_ns")?
                ],
                |row| {
                    Ok(CanFrameRow {
                        time_ns: get_u64(row, "time_ns")?,
                        address: row.get("address")?,
                        bus: row.get("bus")?,
                        data: row.get("data")?,
                    })
                },
            )
            .storage_context(|| format!("querying CAN frames of segment {segment_id}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| "reading CAN frames")
    }

    pub fn query_log_messages(&self, segment_id: i64, kind: Option<LogKind>, range: TimeRange) -> Result<Vec<LogTextRow>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT time_ns, kind, daemon, levelnum, filename, funcname, lineno,
                        dongle_id, version, branch, commit_hash, message
                 FROM log_messages
                 WHERE segment_id = ?1 AND (?2 IS NULL OR kind = ?2)
                   AND time_ns BETWEEN ?3 AND ?4
                 ORDER BY time_ns, rowid",
            )
            .storage_context(|| "preparing log message query")?;
        let rows = stmt
            .query_map(
                params![
                    segment_id,
                    kind.map(|k| k.as_str()),
                    to_i64(range.start_ns, "start_ns")?,
                    to_i64(range.end_ns, "end_ns")?
                ],
                |row| {
                    let kind: String = row.get("kind")?;
                    Ok(LogTextRow {
                        time_ns: get_u64(row, "time_ns")?,
                        kind: if kind == "error" { LogKind::Error } else { LogKind::Info },
                        source: LogSource {
                            daemon: row.get("daemon")?,
                            levelnum: row.get("levelnum")?,
                            filename: row.get("filename")?,
                            funcname: row.get("funcname")?,
                            lineno: row.get("lineno")?,
                            dongle_id: row.get("dongle_id")?,
                            version: row.get("version")?,
                            branch: row.get("branch")?,
                            commit: row.get("commit_hash")?,
                        },
                        message: row.get("message")?,
                    })
                },
            )
            .storage_context(|| format!("querying log messages of segment {segment_id}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| "reading log messages")
    }

    /// Source timestamp of one video frame
    pub fn query_frame_timestamp(&self, segment_id: i64, camera: Camera, frame_number: u32) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn()
            .query_row(
                "SELECT timestamp_sof FROM video_frame_timestamps
                 WHERE segment_id = ?1 AND camera = ?2 AND frame_number = ?3",
                params![segment_id, camera.as_str(), frame_number],
                |row| row.get(0),
            )
            .optional()
            .storage_context(|| format!("reading {camera} frame {frame_number}"))?;
        Ok(value.and_then(|v| u64::try_from(v).ok()))
    }

    /// The last frame of `camera` captured at or before `mono_time_ns`
    pub fn frame_at_or_before(&self, segment_id: i64, camera: Camera, mono_time_ns: u64) -> Result<Option<VideoFrameRow>> {
        self.conn()
            .query_row(
                "SELECT frame_number, timestamp_sof FROM video_frame_timestamps
                 WHERE segment_id = ?1 AND camera = ?2 AND timestamp_sof <= ?3
                 ORDER BY timestamp_sof DESC, frame_number DESC
                 LIMIT 1",
                params![segment_id, camera.as_str(), to_i64(mono_time_ns, "mono_time_ns")?],
                |row| {
                    Ok(VideoFrameRow {
                        camera,
                        frame_number: row.get("frame_number")?,
                        timestamp_sof: get_u64(row, "timestamp_sof")?,
                    })
                },
            )
            .optional()
            .storage_context(|| format!("locating {camera} frame at t={mono_time_ns}"))
    }

    /// Decode stored raw frames on demand without touching the sample table
    pub fn decode_can_range(
        &self,
        segment_id: i64,
        definitions: &BusDefinitionSet,
        range: TimeRange,
    ) -> Result<Vec<SignalSample>> {
        let frames = self.query_can_frames(segment_id, None, range)?;
        Ok(decode_frames(&frames, definitions))
    }

    /// Replace a segment's decoded CAN samples with ones derived from its raw
    /// frames and the given definitions, in one transaction
    pub fn rematerialize_can_signals(&self, segment_id: i64, definitions: &BusDefinitionSet) -> Result<RematerializeOutcome> {
        let segment = self.get_segment(segment_id)?;
        let _route_lock = self.lock_route(&segment.route_id);

        let frames = self.query_can_frames(segment_id, None, TimeRange::all())?;
        let samples = decode_frames(&frames, definitions);

        let outcome = with_write_transaction(self.conn(), |tx| {
            let removed = tx
                .execute(
                    "DELETE FROM timeseries_data
                     WHERE segment_id = ?1 AND signal_name LIKE ?2 ESCAPE '\\'",
                    params![segment_id, CAN_SIGNAL_PATTERN],
                )
                .storage_context(|| "removing decoded CAN samples")?;
            insert_samples(tx, segment_id, &samples)?;

            if let Some(label) = definitions.source_label() {
                tx.execute(
                    "UPDATE routes SET dbc_file = ?2 WHERE route_id = ?1",
                    params![segment.route_id, label],
                )
                .storage_context(|| "recording definition source on route")?;
            }

            Ok(RematerializeOutcome {
                segment_id,
                removed: removed as u64,
                inserted: samples.len() as u64,
            })
        })
        .map_err(|e| with_identity(e, &format!("rematerializing CAN signals of segment {segment_id}")))?;

        log::info!(
            "Rematerialized CAN signals of segment {}: {} removed, {} inserted",
            segment_id,
            outcome.removed,
            outcome.inserted
        );
        Ok(outcome)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |table: &str| -> Result<u64> {
            let value: i64 = self
                .conn()
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .storage_context(|| format!("counting {table}"))?;
            Ok(value.max(0) as u64)
        };

        Ok(StoreStats {
            routes: count("routes")?,
            segments: count("segments")?,
            rows: ChildRowCounts {
                samples: count("timeseries_data")?,
                can_frames: count("can_messages")?,
                log_messages: count("log_messages")?,
                video_frames: count("video_frame_timestamps")?,
            },
            structured_definitions: count("structured_signal_definitions")?,
            can_definitions: count("can_signal_definitions")?,
            custom_signals: count("custom_signals")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{ByteOrder, MessageDefinition, SignalDefinition};
    use crate::storage::{SegmentChildren, SegmentHeader};

    fn speed_definitions(factor: f64) -> BusDefinitionSet {
        let mut set = BusDefinitionSet::new();
        set.add_source(
            "speed.dbc",
            vec![MessageDefinition {
                id: 0x3E8,
                name: "VehicleSpeed".into(),
                size: 8,
                sender: None,
                signals: vec![SignalDefinition::new("Speed", 0, 16, ByteOrder::BigEndian)
                    .with_scaling(factor, 0.0)],
                is_multiplexed: false,
                multiplexer_signal: None,
                source: "speed.dbc".into(),
            }],
        )
        .unwrap();
        set
    }

    fn seeded_store() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let children = SegmentChildren {
            samples: vec![
                SignalSample { time_ns: 300, signal_name: "carState.vEgo".into(), value: 3.0 },
                SignalSample { time_ns: 100, signal_name: "carState.vEgo".into(), value: 1.0 },
                SignalSample { time_ns: 200, signal_name: "carState.vEgo".into(), value: 2.0 },
                SignalSample { time_ns: 100, signal_name: "CAN_0x3E8_Speed".into(), value: 466.0 },
            ],
            can_frames: vec![
                CanFrameRow { time_ns: 100, address: 0x3E8, bus: 0, data: vec![0x12, 0x34, 0, 0, 0, 0, 0, 0] },
                CanFrameRow { time_ns: 150, address: 0x123, bus: 1, data: vec![0xFF] },
            ],
            log_messages: vec![
                LogTextRow { time_ns: 110, kind: LogKind::Info, source: LogSource::default(), message: "up".into() },
                LogTextRow { time_ns: 120, kind: LogKind::Error, source: LogSource::default(), message: "down".into() },
            ],
            video_frames: vec![
                VideoFrameRow { camera: Camera::Fcamera, frame_number: 0, timestamp_sof: 100 },
                VideoFrameRow { camera: Camera::Fcamera, frame_number: 1, timestamp_sof: 150 },
                VideoFrameRow { camera: Camera::Fcamera, frame_number: 2, timestamp_sof: 200 },
                VideoFrameRow { camera: Camera::Dcamera, frame_number: 0, timestamp_sof: 95 },
            ],
        };
        let outcome = store.upsert_segment(&SegmentHeader::new("d--1", 0), &children).unwrap();
        (store, outcome.segment_id)
    }

    #[test]
    fn test_query_signal_range_is_ordered() {
        let (store, id) = seeded_store();
        let points = store.query_signal_range(id, "carState.vEgo", TimeRange::new(100, 250)).unwrap();
        let times: Vec<u64> = points.iter().map(|p| p.time_ns).collect();
        assert_eq!(times, vec![100, 200]);
        assert_eq!(points[1].value, 2.0);
        assert!(store.query_signal_range(id, "missing", TimeRange::all()).unwrap().is_empty());
    }

    #[test]
    fn test_list_signals() {
        let (store, id) = seeded_store();
        let signals = store.list_signals(id).unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[1].signal_name, "carState.vEgo");
        assert_eq!(signals[1].samples, 3);
        assert_eq!(signals[1].first_time_ns, 100);
        assert_eq!(signals[1].last_time_ns, 300);
    }

    #[test]
    fn test_frame_lookups() {
        let (store, id) = seeded_store();
        assert_eq!(store.query_frame_timestamp(id, Camera::Fcamera, 1).unwrap(), Some(150));
        assert_eq!(store.query_frame_timestamp(id, Camera::Ecamera, 1).unwrap(), None);

        let frame = store.frame_at_or_before(id, Camera::Fcamera, 199).unwrap().unwrap();
        assert_eq!(frame.frame_number, 1);
        let frame = store.frame_at_or_before(id, Camera::Fcamera, 200).unwrap().unwrap();
        assert_eq!(frame.frame_number, 2);
        assert!(store.frame_at_or_before(id, Camera::Fcamera, 99).unwrap().is_none());
    }

    #[test]
    fn test_can_and_log_filters() {
        let (store, id) = seeded_store();
        let frames = store.query_can_frames(id, Some(0x123), TimeRange::all()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bus, 1);
        assert_eq!(store.query_can_frames(id, None, TimeRange::all()).unwrap().len(), 2);

        let errors = store.query_log_messages(id, Some(LogKind::Error), TimeRange::all()).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "down");
    }

    #[test]
    fn test_decode_on_demand() {
        let (store, id) = seeded_store();
        let samples = store.decode_can_range(id, &speed_definitions(0.1), TimeRange::all()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].signal_name, "CAN_0x3E8_Speed");
        assert!((samples[0].value - 466.0).abs() < 1e-9);
    }

    #[test]
    fn test_rematerialize_replaces_can_samples_only() {
        let (store, id) = seeded_store();
        let outcome = store.rematerialize_can_signals(id, &speed_definitions(1.0)).unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.inserted, 1);

        let speed = store.query_signal_range(id, "CAN_0x3E8_Speed", TimeRange::all()).unwrap();
        assert_eq!(speed[0].value, 4660.0);
        assert_eq!(store.query_signal_range(id, "carState.vEgo", TimeRange::all()).unwrap().len(), 3);
        assert_eq!(
            store.get_route("d--1").unwrap().unwrap().dbc_file.as_deref(),
            Some("speed.dbc")
        );
    }

    #[test]
    fn test_stats() {
        let (store, _) = seeded_store();
        let stats = store.stats().unwrap();
        assert_eq!(stats.routes, 1);
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.rows.samples, 4);
        assert_eq!(stats.rows.video_frames, 4);
    }
}
