//! Segment Import Library
//!
//! Decodes recorded driving segments and stores them in SQLite for range
//! queries.
//!
//! # Architecture
//!
//! - [`formats`]: reader and writer for the framed binary event log
//! - [`signals`]: DBC bus definitions, structured signal metadata and
//!   formulas for calculated signals
//! - [`timesync`]: monotonic / GPS / init-data clock alignment
//! - [`storage`]: idempotent segment upsert, batched route deletion, queries
//! - [`importer`]: sequences the above for one segment
//!
//! The library never prints. Everything goes through the `log` facade; the
//! binary decides where it ends up.
//!
//! # Example Usage
//!
//! ```no_run
//! use segment_import::{
//!     load_dbc_files, BusDefinitionSet, DefinitionHandle, ImportControl, ImportRequest,
//!     SegmentImporter, StoreHandle,
//! };
//! use std::path::PathBuf;
//!
//! let store = StoreHandle::open("segments.db").unwrap();
//!
//! let mut set = BusDefinitionSet::new();
//! let report = load_dbc_files(&mut set, &[PathBuf::from("car.dbc")]);
//! for (path, err) in &report.rejected {
//!     eprintln!("{}: {}", path.display(), err);
//! }
//!
//! let importer = SegmentImporter::new(store).with_definitions(DefinitionHandle::new(set));
//! let request = ImportRequest::new("/data/0000abcd--5f3a2b1c--0/rlog");
//! let report = importer.import(&request, &ImportControl::new()).unwrap();
//! println!("segment id {}", report.segment_id);
//! ```

pub mod config;
pub mod formats;
pub mod importer;
pub mod message_decoder;
pub mod signals;
pub mod storage;
pub mod timesync;
pub mod types;

// Re-export main types for convenience
pub use config::ImportConfig;
pub use formats::{DecodeStats, LogWriter, RlogReader};
pub use importer::{
    parse_log_text, ImportControl, ImportPhase, ImportProgress, ImportReport, ImportRequest,
    ImportStatus, SegmentIdentity, SegmentImporter,
};
pub use signals::{
    can_signal_identity, load_dbc_files, load_structured_definitions, BusDefinitionSet,
    DbcLoadReport, DefinitionHandle, Formula, StructuredSignalDefinition,
};
pub use storage::{CustomSignal, Store, StoreHandle};
pub use timesync::{ClockAlignment, TimeSynchronizer, WallClockSource};
pub use types::{
    Camera, ImportError, LogKind, LogMessage, MessagePayload, Result, SignalSample, TimeRange,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
