use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use super::bulk::with_bulk_mutation;
use super::models::{DeletionOutcome, RouteRecord, SegmentHeader};
use super::segments::delete_children;
use super::{get_datetime, get_u64, with_identity, Store, StorageResultExt};
use crate::types::Result;

fn row_to_route(row: &Row) -> rusqlite::Result<RouteRecord> {
    Ok(RouteRecord {
        route_id: row.get("route_id")?,
        dongle_id: row.get("dongle_id")?,
        dbc_file: row.get("dbc_file")?,
        start_timestamp: row.get("start_timestamp")?,
        total_segments: get_u64(row, "total_segments")?,
        total_events: get_u64(row, "total_events")?,
        created_at: get_datetime(row, "created_at")?,
    })
}

/// Insert the route row or fill in attributes it is missing
///
/// Returns true when the route did not exist before.
pub(crate) fn upsert_route(tx: &Transaction<'_>, header: &SegmentHeader, now: DateTime<Utc>) -> Result<bool> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM routes WHERE route_id = ?1",
            [&header.route_id],
            |_| Ok(()),
        )
        .optional()
        .storage_context(|| "looking up route")?
        .is_some();

    tx.execute(
        "INSERT INTO routes (route_id, dongle_id, dbc_file, start_timestamp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (route_id) DO UPDATE SET
            dongle_id = COALESCE(excluded.dongle_id, routes.dongle_id),
            dbc_file = COALESCE(excluded.dbc_file, routes.dbc_file),
            start_timestamp = COALESCE(routes.start_timestamp, excluded.start_timestamp)",
        params![
            header.route_id,
            header.dongle_id,
            header.dbc_file,
            header.route_start_timestamp(),
            now.to_rfc3339(),
        ],
    )
    .storage_context(|| "upserting route")?;

    Ok(!exists)
}

pub(crate) fn refresh_route_aggregates(tx: &Transaction<'_>, route_id: &str) -> Result<()> {
    tx.execute(
        "UPDATE routes SET
            total_segments = (SELECT COUNT(*) FROM segments WHERE route_id = ?1),
            total_events = (SELECT COALESCE(SUM(total_events), 0) FROM segments WHERE route_id = ?1)
         WHERE route_id = ?1",
        [route_id],
    )
    .storage_context(|| "refreshing route aggregates")?;
    Ok(())
}

impl Store {
    /// Delete a route, its segments and every row they own
    ///
    /// Runs as one bulk-mutation transaction: segment ids are collected
    /// once, each child table is cleared with a single set-membership
    /// predicate, then segments and the route go. Foreign-key enforcement is
    /// suspended for the transaction and restored afterwards, also when the
    /// deletion fails and rolls back.
    pub fn delete_route(&self, route_id: &str) -> Result<DeletionOutcome> {
        let _route_lock = self.lock_route(route_id);

        let outcome = with_bulk_mutation(self.conn(), |tx| {
            let route_existed = tx
                .query_row("SELECT 1 FROM routes WHERE route_id = ?1", [route_id], |_| Ok(()))
                .optional()
                .storage_context(|| "looking up route")?
                .is_some();

            let segment_ids: Vec<i64> = {
                let mut stmt = tx
                    .prepare("SELECT segment_id FROM segments WHERE route_id = ?1")
                    .storage_context(|| "preparing segment id query")?;
                let rows = stmt
                    .query_map([route_id], |row| row.get(0))
                    .storage_context(|| "collecting segment ids")?;
                rows.collect::<rusqlite::Result<_>>()
                    .storage_context(|| "reading segment ids")?
            };

            let removed = delete_children(tx, &segment_ids)?;
            let segments = tx
                .execute("DELETE FROM segments WHERE route_id = ?1", [route_id])
                .storage_context(|| "deleting segments")?;
            tx.execute("DELETE FROM routes WHERE route_id = ?1", [route_id])
                .storage_context(|| "deleting route")?;

            Ok(DeletionOutcome {
                route_id: route_id.to_string(),
                route_existed,
                segments: segments as u64,
                removed,
            })
        })
        .map_err(|e| with_identity(e, &format!("deleting route {route_id}")))?;

        if outcome.route_existed {
            log::info!(
                "Deleted route {} ({} segments, {} rows)",
                route_id,
                outcome.segments,
                outcome.removed.total()
            );
        } else {
            log::warn!("Route {} not found; nothing deleted", route_id);
        }
        Ok(outcome)
    }

    pub fn get_route(&self, route_id: &str) -> Result<Option<RouteRecord>> {
        self.conn()
            .query_row(
                "SELECT route_id, dongle_id, dbc_file, start_timestamp, total_segments,
                        total_events, created_at
                 FROM routes WHERE route_id = ?1",
                [route_id],
                row_to_route,
            )
            .optional()
            .storage_context(|| format!("reading route {route_id}"))
    }

    /// All routes, newest first
    pub fn list_routes(&self) -> Result<Vec<RouteRecord>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT route_id, dongle_id, dbc_file, start_timestamp, total_segments,
                        total_events, created_at
                 FROM routes ORDER BY created_at DESC, route_id",
            )
            .storage_context(|| "preparing route listing")?;
        let rows = stmt
            .query_map([], row_to_route)
            .storage_context(|| "listing routes")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| "reading routes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SegmentChildren;
    use crate::types::{SignalSample, VideoFrameRow, Camera};

    fn children() -> SegmentChildren {
        SegmentChildren {
            samples: vec![SignalSample { time_ns: 1, signal_name: "a.b".into(), value: 1.0 }],
            video_frames: vec![VideoFrameRow { camera: Camera::Qcamera, frame_number: 1, timestamp_sof: 1 }],
            ..SegmentChildren::default()
        }
    }

    fn count(store: &Store, sql: &str) -> i64 {
        store.conn().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_route_attributes_coalesce() {
        let store = Store::open_in_memory().unwrap();
        let mut first = SegmentHeader::new("d--1", 1);
        first.dongle_id = Some("d".into());
        first.dbc_file = Some("car.dbc".into());
        first.clock.gps_timestamp_s = Some(1_000);
        store.upsert_segment(&first, &SegmentChildren::default()).unwrap();

        let mut second = SegmentHeader::new("d--1", 2);
        second.total_events = 10;
        second.clock.gps_timestamp_s = Some(5_000);
        store.upsert_segment(&second, &SegmentChildren::default()).unwrap();

        let route = store.get_route("d--1").unwrap().unwrap();
        assert_eq!(route.dongle_id.as_deref(), Some("d"));
        assert_eq!(route.dbc_file.as_deref(), Some("car.dbc"));
        assert_eq!(route.start_timestamp, Some(940));
        assert_eq!(route.total_segments, 2);
        assert_eq!(route.total_events, 10);
    }

    #[test]
    fn test_records_serialize_with_rfc3339_timestamps() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store.upsert_segment(&SegmentHeader::new("d--1", 0), &children()).unwrap();

        let route = serde_json::to_value(store.get_route("d--1").unwrap().unwrap()).unwrap();
        assert_eq!(route["route_id"], "d--1");
        let created_at = route["created_at"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());

        let segment = serde_json::to_value(store.get_segment(outcome.segment_id).unwrap()).unwrap();
        assert_eq!(segment["segment_number"], 0);
    }

    #[test]
    fn test_delete_route_is_isolated() {
        let store = Store::open_in_memory().unwrap();
        for number in 0..3 {
            store.upsert_segment(&SegmentHeader::new("keep", number), &children()).unwrap();
            store.upsert_segment(&SegmentHeader::new("drop", number), &children()).unwrap();
        }

        let outcome = store.delete_route("drop").unwrap();
        assert!(outcome.route_existed);
        assert_eq!(outcome.segments, 3);
        assert_eq!(outcome.removed.samples, 3);
        assert_eq!(outcome.removed.video_frames, 3);

        assert!(store.get_route("drop").unwrap().is_none());
        assert_eq!(store.list_routes().unwrap().len(), 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM segments"), 3);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM timeseries_data"), 3);
        assert!(store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn test_delete_missing_route() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store.delete_route("nothing").unwrap();
        assert!(!outcome.route_existed);
        assert_eq!(outcome.segments, 0);
        assert!(store.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn test_failed_deletion_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_segment(&SegmentHeader::new("r", 0), &children()).unwrap();
        store
            .conn()
            .execute_batch(
                "CREATE TRIGGER keep_segments BEFORE DELETE ON segments
                 BEGIN SELECT RAISE(ABORT, 'segments are pinned'); END;",
            )
            .unwrap();

        let err = store.delete_route("r").unwrap_err();
        assert!(err.to_string().contains("deleting route r"));

        assert!(store.foreign_keys_enabled().unwrap());
        assert!(store.get_route("r").unwrap().is_some());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM timeseries_data"), 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM video_frame_timestamps"), 1);
    }

    #[test]
    fn test_route_recreated_after_delete() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_segment(&SegmentHeader::new("r", 0), &children()).unwrap();
        store.delete_route("r").unwrap();

        let outcome = store.upsert_segment(&SegmentHeader::new("r", 0), &children()).unwrap();
        assert!(outcome.route_created);
        assert!(!outcome.replaced_existing);
        assert_eq!(store.get_route("r").unwrap().unwrap().total_segments, 1);
    }
}
