use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;

use super::bulk::with_write_transaction;
use super::models::{ChildRowCounts, SegmentChildren, SegmentHeader, SegmentRecord, UpsertOutcome};
use super::routes::{refresh_route_aggregates, upsert_route};
use super::{
    get_datetime, get_opt_u64, get_u64, opt_to_i64, to_i64, with_identity, Store,
    StorageResultExt, CHILD_TABLES,
};
use crate::timesync::WallClockSource;
use crate::types::{Camera, ImportError, Result};

/// Bound on `?` placeholders in one set-membership predicate
const MAX_IDS_PER_STATEMENT: usize = 900;

const SEGMENT_COLUMNS: &str = "segment_id, route_id, segment_number, start_time_ns, end_time_ns,
    duration_secs, wall_time_offset_ns, wall_clock_source, gps_timestamp, log_path,
    fcamera_path, ecamera_path, qcamera_path, dcamera_path, thumbnail_path, total_events,
    imported_at";

fn row_to_segment(row: &Row) -> rusqlite::Result<SegmentRecord> {
    let mut video_paths = BTreeMap::new();
    for camera in Camera::ALL {
        let column = format!("{}_path", camera.as_str());
        if let Some(path) = row.get::<_, Option<String>>(column.as_str())? {
            video_paths.insert(camera, path);
        }
    }
    let source: String = row.get("wall_clock_source")?;
    let segment_number: i64 = row.get("segment_number")?;

    Ok(SegmentRecord {
        segment_id: row.get("segment_id")?,
        route_id: row.get("route_id")?,
        segment_number: u32::try_from(segment_number)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(2, segment_number))?,
        start_time_ns: get_opt_u64(row, "start_time_ns")?,
        end_time_ns: get_opt_u64(row, "end_time_ns")?,
        duration_secs: row.get("duration_secs")?,
        wall_time_offset_ns: row.get("wall_time_offset_ns")?,
        wall_clock_source: WallClockSource::from_str_lossy(&source),
        gps_timestamp: row.get("gps_timestamp")?,
        log_path: row.get("log_path")?,
        video_paths,
        thumbnail_path: row.get("thumbnail_path")?,
        total_events: get_u64(row, "total_events")?,
        imported_at: get_datetime(row, "imported_at")?,
    })
}

impl Store {
    /// Insert a segment or replace an existing one with the same
    /// `(route_id, segment_number)`, together with all of its rows
    ///
    /// Either the new header and children are committed together or the
    /// stored segment is left exactly as it was.
    pub fn upsert_segment(&self, header: &SegmentHeader, children: &SegmentChildren) -> Result<UpsertOutcome> {
        let identity = format!(
            "upserting segment {} of route {}",
            header.segment_number, header.route_id
        );
        let _route_lock = self.lock_route(&header.route_id);
        let imported_at = Utc::now();

        let outcome = with_write_transaction(self.conn(), |tx| {
            let route_created = upsert_route(tx, header, imported_at)?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT segment_id FROM segments WHERE route_id = ?1 AND segment_number = ?2",
                    params![header.route_id, header.segment_number],
                    |row| row.get(0),
                )
                .optional()
                .storage_context(|| "looking up existing segment")?;

            let (segment_id, removed) = match existing {
                Some(segment_id) => {
                    let removed = delete_children(tx, &[segment_id])?;
                    update_segment_header(tx, segment_id, header, imported_at)?;
                    (segment_id, removed)
                }
                None => (insert_segment_header(tx, header, imported_at)?, ChildRowCounts::default()),
            };

            let inserted = insert_children(tx, segment_id, children)?;
            refresh_route_aggregates(tx, &header.route_id)?;

            Ok(UpsertOutcome {
                segment_id,
                route_created,
                replaced_existing: existing.is_some(),
                removed,
                inserted,
            })
        })
        .map_err(|e| with_identity(e, &identity))?;

        log::info!(
            "{} segment {} of route {} (id {}): {} rows inserted, {} replaced",
            if outcome.replaced_existing { "Updated" } else { "Inserted" },
            header.segment_number,
            header.route_id,
            outcome.segment_id,
            outcome.inserted.total(),
            outcome.removed.total()
        );
        Ok(outcome)
    }

    pub fn get_segment(&self, segment_id: i64) -> Result<SegmentRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE segment_id = ?1"),
                [segment_id],
                row_to_segment,
            )
            .optional()
            .storage_context(|| format!("reading segment {segment_id}"))?
            .ok_or(ImportError::SegmentNotFound(segment_id))
    }

    pub fn find_segment(&self, route_id: &str, segment_number: u32) -> Result<Option<SegmentRecord>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {SEGMENT_COLUMNS} FROM segments WHERE route_id = ?1 AND segment_number = ?2"
                ),
                params![route_id, segment_number],
                row_to_segment,
            )
            .optional()
            .storage_context(|| format!("finding segment {segment_number} of route {route_id}"))
    }

    /// Segments of a route ordered by segment number
    pub fn list_segments(&self, route_id: &str) -> Result<Vec<SegmentRecord>> {
        let mut stmt = self
            .conn()
            .prepare_cached(&format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE route_id = ?1 ORDER BY segment_number"
            ))
            .storage_context(|| "preparing segment listing")?;
        let rows = stmt
            .query_map([route_id], row_to_segment)
            .storage_context(|| format!("listing segments of route {route_id}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| format!("reading segments of route {route_id}"))
    }

    /// Wall-clock time of a monotonic timestamp within a segment, if the
    /// segment has a wall-clock source
    pub fn segment_wall_time(&self, segment_id: i64, mono_time_ns: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_segment(segment_id)?.clock().real_time(mono_time_ns))
    }
}

fn segment_params(header: &SegmentHeader) -> Result<(Option<i64>, Option<i64>, i64)> {
    Ok((
        opt_to_i64(header.clock.start_mono_ns, "start_time_ns")?,
        opt_to_i64(header.clock.end_mono_ns, "end_time_ns")?,
        to_i64(header.total_events, "total_events")?,
    ))
}

fn insert_segment_header(tx: &Transaction<'_>, header: &SegmentHeader, imported_at: DateTime<Utc>) -> Result<i64> {
    let (start, end, total_events) = segment_params(header)?;
    tx.execute(
        "INSERT INTO segments (
            route_id, segment_number, start_time_ns, end_time_ns, duration_secs,
            wall_time_offset_ns, wall_clock_source, gps_timestamp, log_path,
            fcamera_path, ecamera_path, qcamera_path, dcamera_path, thumbnail_path,
            total_events, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            header.route_id,
            header.segment_number,
            start,
            end,
            header.clock.duration_secs(),
            header.clock.wall_time_offset_ns,
            header.clock.source.as_str(),
            header.clock.gps_timestamp_s,
            header.log_path,
            header.video_paths.get(&Camera::Fcamera),
            header.video_paths.get(&Camera::Ecamera),
            header.video_paths.get(&Camera::Qcamera),
            header.video_paths.get(&Camera::Dcamera),
            header.thumbnail_path,
            total_events,
            imported_at.to_rfc3339(),
        ],
    )
    .storage_context(|| "inserting segment header")?;
    Ok(tx.last_insert_rowid())
}

fn update_segment_header(
    tx: &Transaction<'_>,
    segment_id: i64,
    header: &SegmentHeader,
    imported_at: DateTime<Utc>,
) -> Result<()> {
    let (start, end, total_events) = segment_params(header)?;
    tx.execute(
        "UPDATE segments SET
            start_time_ns = ?2, end_time_ns = ?3, duration_secs = ?4,
            wall_time_offset_ns = ?5, wall_clock_source = ?6, gps_timestamp = ?7,
            log_path = ?8, fcamera_path = ?9, ecamera_path = ?10, qcamera_path = ?11,
            dcamera_path = ?12, thumbnail_path = ?13, total_events = ?14, imported_at = ?15
         WHERE segment_id = ?1",
        params![
            segment_id,
            start,
            end,
            header.clock.duration_secs(),
            header.clock.wall_time_offset_ns,
            header.clock.source.as_str(),
            header.clock.gps_timestamp_s,
            header.log_path,
            header.video_paths.get(&Camera::Fcamera),
            header.video_paths.get(&Camera::Ecamera),
            header.video_paths.get(&Camera::Qcamera),
            header.video_paths.get(&Camera::Dcamera),
            header.thumbnail_path,
            total_events,
            imported_at.to_rfc3339(),
        ],
    )
    .storage_context(|| format!("updating segment header {segment_id}"))?;
    Ok(())
}

/// Delete every child row of the given segments, one statement per table
/// and id chunk
pub(crate) fn delete_children(tx: &Transaction<'_>, segment_ids: &[i64]) -> Result<ChildRowCounts> {
    let mut removed = [0u64; CHILD_TABLES.len()];

    for chunk in segment_ids.chunks(MAX_IDS_PER_STATEMENT) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        for (slot, table) in removed.iter_mut().zip(CHILD_TABLES) {
            let deleted = tx
                .execute(
                    &format!("DELETE FROM {table} WHERE segment_id IN ({placeholders})"),
                    params_from_iter(chunk.iter()),
                )
                .storage_context(|| format!("deleting rows from {table}"))?;
            *slot += deleted as u64;
        }
    }

    log::debug!(
        "Removed child rows of {} segments: {:?}",
        segment_ids.len(),
        removed
    );
    Ok(ChildRowCounts {
        samples: removed[0],
        can_frames: removed[1],
        log_messages: removed[2],
        video_frames: removed[3],
    })
}

fn insert_children(tx: &Transaction<'_>, segment_id: i64, children: &SegmentChildren) -> Result<ChildRowCounts> {
    insert_samples(tx, segment_id, &children.samples)?;

    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO can_messages (segment_id, time_ns, address, bus, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .storage_context(|| "preparing CAN insert")?;
        for frame in &children.can_frames {
            stmt.execute(params![
                segment_id,
                to_i64(frame.time_ns, "time_ns")?,
                frame.address,
                frame.bus,
                frame.data,
            ])
            .storage_context(|| "inserting CAN frame")?;
        }
    }

    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO log_messages (
                    segment_id, time_ns, kind, daemon, levelnum, filename, funcname, lineno,
                    dongle_id, version, branch, commit_hash, message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .storage_context(|| "preparing log message insert")?;
        for row in &children.log_messages {
            let source = &row.source;
            stmt.execute(params![
                segment_id,
                to_i64(row.time_ns, "time_ns")?,
                row.kind.as_str(),
                source.daemon,
                source.levelnum,
                source.filename,
                source.funcname,
                source.lineno,
                source.dongle_id,
                source.version,
                source.branch,
                source.commit,
                row.message,
            ])
            .storage_context(|| "inserting log message")?;
        }
    }

    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO video_frame_timestamps (segment_id, camera, frame_number, timestamp_sof)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (segment_id, camera, frame_number)
                 DO UPDATE SET timestamp_sof = excluded.timestamp_sof",
            )
            .storage_context(|| "preparing video frame insert")?;
        for frame in &children.video_frames {
            stmt.execute(params![
                segment_id,
                frame.camera.as_str(),
                frame.frame_number,
                to_i64(frame.timestamp_sof, "timestamp_sof")?,
            ])
            .storage_context(|| "inserting video frame timestamp")?;
        }
    }

    let counts = children.counts();
    log::debug!("Inserted child rows for segment {}: {:?}", segment_id, counts);
    Ok(counts)
}

pub(crate) fn insert_samples(
    tx: &Transaction<'_>,
    segment_id: i64,
    samples: &[crate::types::SignalSample],
) -> Result<()> {
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO timeseries_data (segment_id, time_ns, signal_name, value)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .storage_context(|| "preparing sample insert")?;
    for sample in samples {
        stmt.execute(params![
            segment_id,
            to_i64(sample.time_ns, "time_ns")?,
            sample.signal_name,
            sample.value,
        ])
        .storage_context(|| "inserting signal sample")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timesync::ClockAlignment;
    use crate::types::{CanFrameRow, LogKind, LogSource, LogTextRow, SignalSample, VideoFrameRow};

    fn header(route: &str, number: u32) -> SegmentHeader {
        let mut header = SegmentHeader::new(route, number);
        header.clock = ClockAlignment {
            start_mono_ns: Some(100),
            end_mono_ns: Some(400),
            wall_time_offset_ns: 1_000,
            source: WallClockSource::Gps,
            gps_timestamp_s: Some(1_700_000_060),
        };
        header.total_events = 3;
        header
    }

    fn children(tag: f64) -> SegmentChildren {
        SegmentChildren {
            samples: vec![
                SignalSample { time_ns: 100, signal_name: "carState.vEgo".into(), value: tag },
                SignalSample { time_ns: 200, signal_name: "carState.vEgo".into(), value: tag + 1.0 },
            ],
            can_frames: vec![CanFrameRow { time_ns: 150, address: 0x3E8, bus: 0, data: vec![1, 2] }],
            log_messages: vec![LogTextRow {
                time_ns: 120,
                kind: LogKind::Info,
                source: LogSource::default(),
                message: "hello".into(),
            }],
            video_frames: vec![VideoFrameRow { camera: Camera::Fcamera, frame_number: 0, timestamp_sof: 90 }],
        }
    }

    fn count(store: &Store, table: &str) -> i64 {
        store
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_insert_then_update_in_place() {
        let store = Store::open_in_memory().unwrap();
        let first = store.upsert_segment(&header("d--1", 0), &children(1.0)).unwrap();
        assert!(first.route_created);
        assert!(!first.replaced_existing);

        let second = store.upsert_segment(&header("d--1", 0), &children(5.0)).unwrap();
        assert_eq!(second.segment_id, first.segment_id);
        assert!(second.replaced_existing);
        assert_eq!(second.removed, first.inserted);

        assert_eq!(count(&store, "segments"), 1);
        assert_eq!(count(&store, "timeseries_data"), 2);
        assert_eq!(count(&store, "video_frame_timestamps"), 1);

        let record = store.get_segment(first.segment_id).unwrap();
        assert_eq!(record.wall_clock_source, WallClockSource::Gps);
        assert_eq!(record.start_time_ns, Some(100));
        assert_eq!(record.total_events, 3);
    }

    #[test]
    fn test_failed_upsert_keeps_previous_rows() {
        let store = Store::open_in_memory().unwrap();
        let first = store.upsert_segment(&header("d--1", 0), &children(1.0)).unwrap();

        store
            .conn()
            .execute_batch(
                "CREATE TRIGGER reject_frames BEFORE INSERT ON video_frame_timestamps
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let mut changed = header("d--1", 0);
        changed.total_events = 99;
        let err = store.upsert_segment(&changed, &children(7.0)).unwrap_err();
        assert!(err.to_string().contains("upserting segment 0 of route d--1"));

        let record = store.get_segment(first.segment_id).unwrap();
        assert_eq!(record.total_events, 3);
        let value: f64 = store
            .conn()
            .query_row("SELECT value FROM timeseries_data ORDER BY time_ns LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, 1.0);
        assert!(store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn test_list_and_find_segments() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_segment(&header("d--1", 2), &SegmentChildren::default()).unwrap();
        store.upsert_segment(&header("d--1", 0), &SegmentChildren::default()).unwrap();
        store.upsert_segment(&header("d--2", 0), &SegmentChildren::default()).unwrap();

        let numbers: Vec<u32> = store
            .list_segments("d--1")
            .unwrap()
            .iter()
            .map(|s| s.segment_number)
            .collect();
        assert_eq!(numbers, vec![0, 2]);
        assert!(store.find_segment("d--1", 2).unwrap().is_some());
        assert!(store.find_segment("d--1", 1).unwrap().is_none());
        assert!(matches!(store.get_segment(999), Err(ImportError::SegmentNotFound(999))));
    }

    #[test]
    fn test_segment_wall_time() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store.upsert_segment(&header("d--1", 0), &SegmentChildren::default()).unwrap();
        let wall = store.segment_wall_time(outcome.segment_id, 1_000_000_000).unwrap().unwrap();
        assert_eq!(wall.timestamp(), 1);

        let mut no_clock = header("d--1", 1);
        no_clock.clock = ClockAlignment::unavailable();
        let outcome = store.upsert_segment(&no_clock, &SegmentChildren::default()).unwrap();
        assert!(store.segment_wall_time(outcome.segment_id, 10).unwrap().is_none());
    }
}
