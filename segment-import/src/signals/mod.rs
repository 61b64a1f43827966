//! Bus definitions and structured signal metadata
//!
//! This module contains the DBC loader, the definition set the CAN decoder
//! works from, the metadata for structured-message signals, and formulas
//! for calculated signals.

pub mod database;
pub mod dbc;
pub mod formula;
pub mod structured;

// Re-export key types for convenience
pub use database::{
    can_signal_identity, BusDefinitionSet, ByteOrder, DefinitionHandle, DefinitionStats,
    MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
pub use dbc::{load_dbc_files, parse_dbc_file, parse_dbc_str, DbcLoadReport};
pub use formula::{is_stored_signal_name, Formula};
pub use structured::{guess_definition, load_structured_definitions, StructuredSignalDefinition};
