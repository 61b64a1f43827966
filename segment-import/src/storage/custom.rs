use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::bulk::with_write_transaction;
use super::models::{CustomSignal, SamplePoint};
use super::{Store, StorageResultExt};
use crate::signals::{is_stored_signal_name, Formula};
use crate::types::{ImportError, Result, TimeRange};

fn custom_signal_from_row(row: &Row<'_>) -> rusqlite::Result<CustomSignal> {
    Ok(CustomSignal {
        signal_name: row.get("signal_name")?,
        formula: row.get("formula")?,
        unit: row.get("unit")?,
        description: row.get("description")?,
    })
}

impl Store {
    /// Create or replace a custom signal; returns true when one was replaced
    ///
    /// The name must not look like a stored signal name, so a custom signal
    /// never shadows stored samples. The formula is validated before writing.
    pub fn define_custom_signal(&self, signal: &CustomSignal) -> Result<bool> {
        let name = signal.signal_name.trim();
        if name.is_empty() {
            return Err(ImportError::InvalidSignalDefinition(
                "custom signal name is empty".to_string(),
            ));
        }
        if is_stored_signal_name(name) {
            return Err(ImportError::InvalidSignalDefinition(format!(
                "custom signal name '{name}' has the form of a stored signal name"
            )));
        }
        let formula = Formula::parse(&signal.formula)?;

        let now = Utc::now().to_rfc3339();
        let replaced = with_write_transaction(self.conn(), |tx| {
            let replaced = tx
                .query_row(
                    "SELECT 1 FROM custom_signals WHERE signal_name = ?1",
                    [name],
                    |_| Ok(()),
                )
                .optional()
                .storage_context(|| format!("looking up custom signal {name}"))?
                .is_some();
            tx.execute(
                "INSERT INTO custom_signals (
                    signal_name, formula, unit, description, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (signal_name) DO UPDATE SET
                    formula = excluded.formula,
                    unit = excluded.unit,
                    description = excluded.description,
                    updated_at = excluded.updated_at",
                params![name, formula.source(), signal.unit, signal.description, now],
            )
            .storage_context(|| format!("storing custom signal {name}"))?;
            Ok(replaced)
        })?;

        log::info!(
            "{} custom signal {} = {} (depends on {})",
            if replaced { "Replaced" } else { "Defined" },
            name,
            formula.source(),
            formula.dependencies().join(", ")
        );
        Ok(replaced)
    }

    pub fn get_custom_signal(&self, signal_name: &str) -> Result<Option<CustomSignal>> {
        self.conn()
            .query_row(
                "SELECT signal_name, formula, unit, description
                 FROM custom_signals WHERE signal_name = ?1",
                [signal_name],
                custom_signal_from_row,
            )
            .optional()
            .storage_context(|| format!("looking up custom signal {signal_name}"))
    }

    pub fn list_custom_signals(&self) -> Result<Vec<CustomSignal>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT signal_name, formula, unit, description
                 FROM custom_signals ORDER BY signal_name",
            )
            .storage_context(|| "preparing custom signal listing")?;
        let rows = stmt
            .query_map([], custom_signal_from_row)
            .storage_context(|| "listing custom signals")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| "reading custom signals")
    }

    /// Returns false when no such custom signal existed
    pub fn delete_custom_signal(&self, signal_name: &str) -> Result<bool> {
        let deleted = with_write_transaction(self.conn(), |tx| {
            tx.execute("DELETE FROM custom_signals WHERE signal_name = ?1", [signal_name])
                .storage_context(|| format!("deleting custom signal {signal_name}"))
        })?;
        Ok(deleted > 0)
    }

    /// Evaluate a custom signal over one segment
    ///
    /// Each dependency is read from stored samples in `range`; a dependency
    /// without samples yields an empty result.
    pub fn calculate_custom_signal(
        &self,
        segment_id: i64,
        signal: &CustomSignal,
        range: TimeRange,
    ) -> Result<Vec<SamplePoint>> {
        let formula = Formula::parse(&signal.formula)?;

        let mut series = Vec::with_capacity(formula.dependencies().len());
        for dependency in formula.dependencies() {
            let points = self.query_stored_range(segment_id, dependency, range)?;
            if points.is_empty() {
                log::warn!(
                    "Custom signal {}: no samples of {} in segment {}",
                    signal.signal_name,
                    dependency,
                    segment_id
                );
                return Ok(Vec::new());
            }
            series.push(points);
        }

        let points = formula.evaluate_series(&series)?;
        log::debug!(
            "Calculated {} points of {} in segment {}",
            points.len(),
            signal.signal_name,
            segment_id
        );
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SegmentChildren, SegmentHeader};
    use crate::types::SignalSample;

    fn custom(name: &str, formula: &str) -> CustomSignal {
        CustomSignal {
            signal_name: name.to_string(),
            formula: formula.to_string(),
            unit: Some("km/h".to_string()),
            description: None,
        }
    }

    fn seeded_store() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let sample = |time_ns, signal_name: &str, value| SignalSample {
            time_ns,
            signal_name: signal_name.to_string(),
            value,
        };
        let children = SegmentChildren {
            samples: vec![
                sample(100, "carState.vEgo", 10.0),
                sample(200, "carState.vEgo", 20.0),
                sample(100, "carState.aEgo", 1.0),
                sample(200, "carState.aEgo", 2.0),
                sample(150, "CAN_0x3E8_Speed", 50.0),
            ],
            ..Default::default()
        };
        let outcome = store.upsert_segment(&SegmentHeader::new("d--1", 0), &children).unwrap();
        (store, outcome.segment_id)
    }

    #[test]
    fn test_define_list_replace_delete() {
        let (store, _) = seeded_store();
        assert!(!store.define_custom_signal(&custom("speed_kmh", "carState.vEgo * 3.6")).unwrap());
        assert!(store.define_custom_signal(&custom("speed_kmh", "carState.vEgo * 3.6 + 0")).unwrap());

        let listed = store.list_custom_signals().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].formula, "carState.vEgo * 3.6 + 0");
        assert_eq!(listed[0].unit.as_deref(), Some("km/h"));
        assert_eq!(store.stats().unwrap().custom_signals, 1);

        assert!(store.delete_custom_signal("speed_kmh").unwrap());
        assert!(!store.delete_custom_signal("speed_kmh").unwrap());
        assert!(store.get_custom_signal("speed_kmh").unwrap().is_none());
    }

    #[test]
    fn test_define_rejects_bad_names_and_formulas() {
        let (store, _) = seeded_store();
        assert!(matches!(
            store.define_custom_signal(&custom("carState.fast", "carState.vEgo")),
            Err(ImportError::InvalidSignalDefinition(_))
        ));
        assert!(matches!(
            store.define_custom_signal(&custom("", "carState.vEgo")),
            Err(ImportError::InvalidSignalDefinition(_))
        ));
        assert!(matches!(
            store.define_custom_signal(&custom("broken", "carState.vEgo * unknown")),
            Err(ImportError::InvalidFormula(_))
        ));
        assert!(store.list_custom_signals().unwrap().is_empty());
    }

    #[test]
    fn test_query_signal_range_calculates_custom_signals() {
        let (store, id) = seeded_store();
        store.define_custom_signal(&custom("speed_kmh", "carState.vEgo * 3.6")).unwrap();
        store
            .define_custom_signal(&custom("power", "carState.vEgo * carState.aEgo"))
            .unwrap();

        let speed = store.query_signal_range(id, "speed_kmh", TimeRange::all()).unwrap();
        assert_eq!(speed.len(), 2);
        assert_eq!(speed[0].time_ns, 100);
        assert!((speed[1].value - 72.0).abs() < 1e-9);

        let power = store.query_signal_range(id, "power", TimeRange::new(150, 250)).unwrap();
        assert_eq!(power, vec![SamplePoint { time_ns: 200, value: 40.0 }]);
    }

    #[test]
    fn test_custom_signal_without_overlapping_samples_is_empty() {
        let (store, id) = seeded_store();
        store
            .define_custom_signal(&custom("mixed", "carState.vEgo + CAN_0x3E8_Speed"))
            .unwrap();
        store
            .define_custom_signal(&custom("absent", "carState.vEgo + gpsLocation.speed"))
            .unwrap();

        assert!(store.query_signal_range(id, "mixed", TimeRange::all()).unwrap().is_empty());
        assert!(store.query_signal_range(id, "absent", TimeRange::all()).unwrap().is_empty());
    }
}
