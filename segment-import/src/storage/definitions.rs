use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;

use super::bulk::with_write_transaction;
use super::{Store, StorageResultExt};
use crate::signals::{
    can_signal_identity, guess_definition, BusDefinitionSet, ByteOrder, StructuredSignalDefinition,
    ValueType,
};
use crate::types::Result;

/// Counts from a definition upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DefinitionUpsert {
    pub inserted: u64,
    pub updated: u64,
}

impl DefinitionUpsert {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

fn exists(tx: &Transaction<'_>, table: &str, full_name: &str) -> Result<bool> {
    Ok(tx
        .query_row(
            &format!("SELECT 1 FROM {table} WHERE full_name = ?1"),
            [full_name],
            |_| Ok(()),
        )
        .optional()
        .storage_context(|| format!("looking up {full_name} in {table}"))?
        .is_some())
}

impl Store {
    /// Store structured definitions, replacing any with the same full name
    ///
    /// Loaded definitions overwrite guessed ones and clear their
    /// auto-created flag.
    pub fn upsert_structured_definitions(&self, definitions: &[StructuredSignalDefinition]) -> Result<DefinitionUpsert> {
        let now = Utc::now().to_rfc3339();
        let outcome = with_write_transaction(self.conn(), |tx| {
            let mut outcome = DefinitionUpsert::default();
            for definition in definitions {
                let full_name = definition.full_name();
                if exists(tx, "structured_signal_definitions", &full_name)? {
                    outcome.updated += 1;
                } else {
                    outcome.inserted += 1;
                }
                tx.execute(
                    "INSERT INTO structured_signal_definitions (
                        full_name, message_type, signal_name, data_type, unit, description,
                        auto_created, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
                     ON CONFLICT (full_name) DO UPDATE SET
                        message_type = excluded.message_type,
                        signal_name = excluded.signal_name,
                        data_type = excluded.data_type,
                        unit = excluded.unit,
                        description = excluded.description,
                        auto_created = 0,
                        updated_at = excluded.updated_at",
                    params![
                        full_name,
                        definition.message_type,
                        definition.signal_name,
                        definition.data_type,
                        definition.unit,
                        definition.description,
                        now,
                    ],
                )
                .storage_context(|| format!("storing definition {full_name}"))?;
            }
            Ok(outcome)
        })?;

        log::info!(
            "Stored {} structured definitions ({} new, {} updated)",
            outcome.total(),
            outcome.inserted,
            outcome.updated
        );
        Ok(outcome)
    }

    /// Store every signal of a definition set under its CAN identity
    pub fn upsert_can_definitions(&self, definitions: &BusDefinitionSet) -> Result<DefinitionUpsert> {
        let now = Utc::now().to_rfc3339();
        let outcome = with_write_transaction(self.conn(), |tx| {
            let mut outcome = DefinitionUpsert::default();
            for message in definitions.messages() {
                for signal in &message.signals {
                    let full_name = can_signal_identity(message.id, &signal.name);
                    if exists(tx, "can_signal_definitions", &full_name)? {
                        outcome.updated += 1;
                    } else {
                        outcome.inserted += 1;
                    }
                    let byte_order = match signal.byte_order {
                        ByteOrder::LittleEndian => "little_endian",
                        ByteOrder::BigEndian => "big_endian",
                    };
                    tx.execute(
                        "INSERT INTO can_signal_definitions (
                            full_name, address, message_name, signal_name, start_bit, length,
                            byte_order, is_signed, scale, value_offset, min_value, max_value,
                            unit, source, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                         ON CONFLICT (full_name) DO UPDATE SET
                            address = excluded.address,
                            message_name = excluded.message_name,
                            signal_name = excluded.signal_name,
                            start_bit = excluded.start_bit,
                            length = excluded.length,
                            byte_order = excluded.byte_order,
                            is_signed = excluded.is_signed,
                            scale = excluded.scale,
                            value_offset = excluded.value_offset,
                            min_value = excluded.min_value,
                            max_value = excluded.max_value,
                            unit = excluded.unit,
                            source = excluded.source,
                            updated_at = excluded.updated_at",
                        params![
                            full_name,
                            message.id,
                            message.name,
                            signal.name,
                            signal.start_bit,
                            signal.length,
                            byte_order,
                            signal.value_type == ValueType::Signed,
                            signal.factor,
                            signal.offset,
                            signal.min,
                            signal.max,
                            signal.unit,
                            message.source,
                            now,
                        ],
                    )
                    .storage_context(|| format!("storing CAN definition {full_name}"))?;
                }
            }
            Ok(outcome)
        })?;

        log::info!(
            "Stored {} CAN signal definitions ({} new, {} updated)",
            outcome.total(),
            outcome.inserted,
            outcome.updated
        );
        Ok(outcome)
    }

    /// Guess and store definitions for structured signals of a segment that
    /// have none yet. Existing definitions are never touched.
    pub fn auto_create_missing_definitions(&self, segment_id: i64) -> Result<usize> {
        let missing: Vec<String> = {
            let mut stmt = self
                .conn()
                .prepare_cached(
                    "SELECT DISTINCT t.signal_name FROM timeseries_data t
                     LEFT JOIN structured_signal_definitions s ON s.full_name = t.signal_name
                     WHERE t.segment_id = ?1 AND s.full_name IS NULL
                       AND t.signal_name NOT LIKE 'CAN\\_%' ESCAPE '\\'
                     ORDER BY t.signal_name",
                )
                .storage_context(|| "preparing missing definition query")?;
            let rows = stmt
                .query_map([segment_id], |row| row.get(0))
                .storage_context(|| format!("finding undefined signals of segment {segment_id}"))?;
            rows.collect::<rusqlite::Result<_>>()
                .storage_context(|| "reading undefined signals")?
        };
        if missing.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let created = with_write_transaction(self.conn(), |tx| {
            let mut created = 0;
            for name in &missing {
                let Some(definition) = guess_definition(name) else {
                    log::debug!("No definition guess for {}", name);
                    continue;
                };
                created += tx
                    .execute(
                        "INSERT OR IGNORE INTO structured_signal_definitions (
                            full_name, message_type, signal_name, data_type, unit, description,
                            auto_created, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                        params![
                            name,
                            definition.message_type,
                            definition.signal_name,
                            definition.data_type,
                            definition.unit,
                            definition.description,
                            now,
                        ],
                    )
                    .storage_context(|| format!("creating definition for {name}"))?;
            }
            Ok(created)
        })?;

        if created > 0 {
            log::info!("Auto-created {} signal definitions for segment {}", created, segment_id);
        }
        Ok(created)
    }

    /// Stored structured definitions ordered by full name
    pub fn list_structured_definitions(&self) -> Result<Vec<(StructuredSignalDefinition, bool)>> {
        let mut stmt = self
            .conn()
            .prepare_cached(
                "SELECT message_type, signal_name, data_type, unit, description, auto_created
                 FROM structured_signal_definitions ORDER BY full_name",
            )
            .storage_context(|| "preparing definition listing")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    StructuredSignalDefinition {
                        message_type: row.get("message_type")?,
                        signal_name: row.get("signal_name")?,
                        data_type: row.get("data_type")?,
                        unit: row.get("unit")?,
                        description: row.get("description")?,
                    },
                    row.get::<_, bool>("auto_created")?,
                ))
            })
            .storage_context(|| "listing structured definitions")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .storage_context(|| "reading structured definitions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageDefinition, SignalDefinition};
    use crate::storage::{SegmentChildren, SegmentHeader};
    use crate::types::{SignalSample, TimeRange};

    fn sample(name: &str) -> SignalSample {
        SignalSample { time_ns: 1, signal_name: name.into(), value: 1.0 }
    }

    #[test]
    fn test_auto_create_only_missing() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_structured_definitions(&[StructuredSignalDefinition {
                message_type: "carState".into(),
                signal_name: "vEgo".into(),
                data_type: Some("float".into()),
                unit: Some("km/h".into()),
                description: None,
            }])
            .unwrap();

        let children = SegmentChildren {
            samples: vec![
                sample("carState.vEgo"),
                sample("carState.brakePressed"),
                sample("CAN_0x3E8_Speed"),
            ],
            ..SegmentChildren::default()
        };
        let id = store.upsert_segment(&SegmentHeader::new("r", 0), &children).unwrap().segment_id;

        assert_eq!(store.auto_create_missing_definitions(id).unwrap(), 1);
        assert_eq!(store.auto_create_missing_definitions(id).unwrap(), 0);

        let definitions = store.list_structured_definitions().unwrap();
        assert_eq!(definitions.len(), 2);
        let (brake, auto) = &definitions[0];
        assert_eq!(brake.full_name(), "carState.brakePressed");
        assert_eq!(brake.data_type.as_deref(), Some("bool"));
        assert!(*auto);
        let (speed, auto) = &definitions[1];
        assert_eq!(speed.unit.as_deref(), Some("km/h"));
        assert!(!*auto);

        let signals = store.list_signals(id).unwrap();
        let v_ego = signals.iter().find(|s| s.signal_name == "carState.vEgo").unwrap();
        assert_eq!(v_ego.unit.as_deref(), Some("km/h"));
        assert!(store.query_signal_range(id, "CAN_0x3E8_Speed", TimeRange::all()).unwrap().len() == 1);
    }

    #[test]
    fn test_can_definitions_upsert_counts() {
        let store = Store::open_in_memory().unwrap();
        let mut set = BusDefinitionSet::new();
        set.add_source(
            "car.dbc",
            vec![MessageDefinition {
                id: 0x3E8,
                name: "VehicleSpeed".into(),
                size: 8,
                sender: None,
                signals: vec![
                    SignalDefinition::new("Speed", 0, 16, ByteOrder::BigEndian).with_unit("km/h"),
                    SignalDefinition::new("Counter", 16, 4, ByteOrder::LittleEndian),
                ],
                is_multiplexed: false,
                multiplexer_signal: None,
                source: "car.dbc".into(),
            }],
        )
        .unwrap();

        let first = store.upsert_can_definitions(&set).unwrap();
        assert_eq!(first, DefinitionUpsert { inserted: 2, updated: 0 });
        let second = store.upsert_can_definitions(&set).unwrap();
        assert_eq!(second, DefinitionUpsert { inserted: 0, updated: 2 });
        assert_eq!(store.stats().unwrap().can_definitions, 2);

        let order: String = store
            .conn()
            .query_row(
                "SELECT byte_order FROM can_signal_definitions WHERE full_name = 'CAN_0x3E8_Speed'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(order, "big_endian");
    }

    #[test]
    fn test_loaded_definition_clears_auto_flag() {
        let store = Store::open_in_memory().unwrap();
        let children = SegmentChildren {
            samples: vec![sample("gpsLocation.speed")],
            ..SegmentChildren::default()
        };
        let id = store.upsert_segment(&SegmentHeader::new("r", 0), &children).unwrap().segment_id;
        store.auto_create_missing_definitions(id).unwrap();

        let loaded = StructuredSignalDefinition {
            message_type: "gpsLocation".into(),
            signal_name: "speed".into(),
            data_type: Some("float".into()),
            unit: Some("m/s".into()),
            description: Some("Ground speed".into()),
        };
        let outcome = store.upsert_structured_definitions(&[loaded]).unwrap();
        assert_eq!(outcome.updated, 1);

        let definitions = store.list_structured_definitions().unwrap();
        assert_eq!(definitions.len(), 1);
        assert!(!definitions[0].1);
        assert_eq!(definitions[0].0.description.as_deref(), Some("Ground speed"));
    }
}
