//! Bus definition set
//!
//! Combines CAN message layouts from one or more DBC files into a single
//! queryable set. The set is an owned value; [`DefinitionHandle`] shares it
//! between importers and allows swapping in a reloaded set.

use crate::message_decoder::MessageDecoder;
use crate::types::{DecodedSignal, ImportError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Widest signal the decoder can extract
pub const MAX_SIGNAL_BITS: u16 = 64;

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// Bus address
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
    /// Source file name
    pub source: String,
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit. Little-endian: position of the LSB (`byte * 8 + bit`).
    /// Big-endian: position of the MSB in MSB-first linear numbering
    /// (byte 0 bit 7 is position 0).
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    pub byte_order: ByteOrder,
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// Plain unsigned little-endian signal with unit scaling
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            multiplexer_info: None,
        }
    }

    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Number of payload bytes a frame needs for this signal to be present
    pub fn required_bytes(&self) -> usize {
        (self.start_bit as usize + self.length as usize + 7) / 8
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Signed,
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// Stable identity under which a decoded CAN signal is stored
pub fn can_signal_identity(address: u32, signal_name: &str) -> String {
    format!("CAN_0x{:03X}_{}", address, signal_name)
}

/// Check a message layout before it is accepted into a set
pub fn validate_message(message: &MessageDefinition) -> Result<()> {
    let mut names = HashSet::new();

    for signal in &message.signals {
        if !names.insert(signal.name.as_str()) {
            return Err(ImportError::InvalidSignalDefinition(format!(
                "duplicate signal '{}' in message {} (0x{:X})",
                signal.name, message.name, message.id
            )));
        }

        if signal.length == 0 {
            return Err(ImportError::InvalidSignalDefinition(format!(
                "signal '{}' in message 0x{:X} has zero length",
                signal.name, message.id
            )));
        }

        let end = u32::from(signal.start_bit) + u32::from(signal.length);
        if signal.length > MAX_SIGNAL_BITS || end > u32::from(MAX_SIGNAL_BITS) {
            return Err(ImportError::InvalidSignalDefinition(format!(
                "signal '{}' in message 0x{:X} spans bits {}..{}, beyond the {}-bit frame",
                signal.name, message.id, signal.start_bit, end, MAX_SIGNAL_BITS
            )));
        }
    }

    for signal in &message.signals {
        if let Some(mux) = &signal.multiplexer_info {
            if !names.contains(mux.multiplexer_signal.as_str()) {
                return Err(ImportError::InvalidSignalDefinition(format!(
                    "signal '{}' in message 0x{:X} refers to missing multiplexer '{}'",
                    signal.name, message.id, mux.multiplexer_signal
                )));
            }
        }
    }

    Ok(())
}

/// A set of bus definitions keyed by address
#[derive(Debug, Clone, Default)]
pub struct BusDefinitionSet {
    messages: HashMap<u32, MessageDefinition>,
    sources: Vec<String>,
}

impl BusDefinitionSet {
    /// Create a new empty definition set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one validated message; a message at the same address is replaced
    pub fn add_message(&mut self, message: MessageDefinition) -> Result<()> {
        validate_message(&message)?;
        self.insert(message);
        Ok(())
    }

    /// Add every message of one source, or none of them if any is invalid
    ///
    /// Within one source every address must be defined once; replacement
    /// only happens across sources or on reload.
    pub fn add_source(&mut self, source: &str, messages: Vec<MessageDefinition>) -> Result<usize> {
        let mut seen: HashMap<u32, &str> = HashMap::new();
        for message in &messages {
            validate_message(message)?;
            if let Some(first) = seen.insert(message.id, &message.name) {
                return Err(ImportError::InvalidSignalDefinition(format!(
                    "{}: address 0x{:X} defined twice ({} and {})",
                    source, message.id, first, message.name
                )));
            }
        }

        let count = messages.len();
        for message in messages {
            self.insert(message);
        }
        if !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }

        log::debug!("Added {} messages from {}", count, source);
        Ok(count)
    }

    fn insert(&mut self, message: MessageDefinition) {
        if let Some(previous) = self.messages.insert(message.id, message) {
            log::debug!(
                "Replaced definition of 0x{:X} ({} from {})",
                previous.id,
                previous.name,
                previous.source
            );
        }
    }

    pub fn get_message(&self, address: u32) -> Option<&MessageDefinition> {
        self.messages.get(&address)
    }

    /// Decode one frame; unknown addresses yield nothing
    pub fn decode(&self, address: u32, data: &[u8]) -> Vec<DecodedSignal> {
        match self.messages.get(&address) {
            Some(message) => MessageDecoder::decode_message(data, message),
            None => Vec::new(),
        }
    }

    /// File names the set was loaded from, in load order
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Comma separated source list, as recorded on a route
    pub fn source_label(&self) -> Option<String> {
        if self.sources.is_empty() {
            None
        } else {
            Some(self.sources.join(","))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages, sorted by address
    pub fn messages(&self) -> Vec<&MessageDefinition> {
        let mut messages: Vec<_> = self.messages.values().collect();
        messages.sort_unstable_by_key(|m| m.id);
        messages
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDefinition)> {
        let mut found: Vec<_> = self
            .messages
            .values()
            .flat_map(|msg| {
                msg.signals
                    .iter()
                    .filter(|sig| sig.name == signal_name)
                    .map(move |sig| (msg.id, sig))
            })
            .collect();
        found.sort_unstable_by_key(|(id, _)| *id);
        found
    }

    pub fn stats(&self) -> DefinitionStats {
        DefinitionStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|m| m.signals.len()).sum(),
            num_sources: self.sources.len(),
        }
    }
}

/// Definition set statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefinitionStats {
    pub num_messages: usize,
    pub num_signals: usize,
    pub num_sources: usize,
}

/// Shared, swappable reference to the current definition set
///
/// Readers take a snapshot and keep decoding with it even if a reload
/// replaces the set meanwhile.
#[derive(Debug, Clone, Default)]
pub struct DefinitionHandle {
    current: Arc<RwLock<Arc<BusDefinitionSet>>>,
}

impl DefinitionHandle {
    pub fn new(set: BusDefinitionSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(set))),
        }
    }

    pub fn snapshot(&self) -> Arc<BusDefinitionSet> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new set, returning the previous one
    pub fn replace(&self, set: BusDefinitionSet) -> Arc<BusDefinitionSet> {
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, Arc::new(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_message(id: u32, source: &str) -> MessageDefinition {
        MessageDefinition {
            id,
            name: "EngineData".to_string(),
            size: 8,
            sender: Some("ECU1".to_string()),
            signals: vec![SignalDefinition::new("EngineSpeed", 0, 16, ByteOrder::LittleEndian)
                .with_unit("rpm")],
            is_multiplexed: false,
            multiplexer_signal: None,
            source: source.to_string(),
        }
    }

    #[test]
    fn test_empty_set() {
        let set = BusDefinitionSet::new();
        let stats = set.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
        assert!(set.source_label().is_none());
        assert!(set.decode(0x123, &[0; 8]).is_empty());
    }

    #[test]
    fn test_add_message() {
        let mut set = BusDefinitionSet::new();
        set.add_source("test.dbc", vec![engine_message(0x123, "test.dbc")]).unwrap();

        let msg = set.get_message(0x123).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.signals[0].name, "EngineSpeed");

        let found = set.find_signal("EngineSpeed");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, 0x123);
        assert_eq!(set.source_label().as_deref(), Some("test.dbc"));
    }

    #[test]
    fn test_reload_replaces_same_address() {
        let mut set = BusDefinitionSet::new();
        set.add_source("a.dbc", vec![engine_message(0x123, "a.dbc")]).unwrap();
        set.add_source("b.dbc", vec![engine_message(0x123, "b.dbc")]).unwrap();
        set.add_source("b.dbc", vec![engine_message(0x123, "b.dbc")]).unwrap();

        assert_eq!(set.stats().num_messages, 1);
        assert_eq!(set.get_message(0x123).unwrap().source, "b.dbc");
        assert_eq!(set.sources(), &["a.dbc".to_string(), "b.dbc".to_string()]);
    }

    #[test]
    fn test_rejects_duplicate_signal() {
        let mut message = engine_message(0x10, "dup.dbc");
        message
            .signals
            .push(SignalDefinition::new("EngineSpeed", 16, 8, ByteOrder::LittleEndian));
        assert!(matches!(
            validate_message(&message),
            Err(ImportError::InvalidSignalDefinition(_))
        ));
    }

    #[test]
    fn test_rejects_bad_layout() {
        let mut message = engine_message(0x10, "bad.dbc");
        message.signals[0].length = 0;
        assert!(validate_message(&message).is_err());

        let mut message = engine_message(0x10, "bad.dbc");
        message.signals[0].start_bit = 60;
        message.signals[0].length = 8;
        assert!(validate_message(&message).is_err());
    }

    #[test]
    fn test_overlapping_signals_accepted() {
        let mut message = engine_message(0x10, "overlap.dbc");
        message
            .signals
            .push(SignalDefinition::new("EngineSpeedLow", 0, 8, ByteOrder::LittleEndian));
        assert!(validate_message(&message).is_ok());
    }

    #[test]
    fn test_invalid_source_adds_nothing() {
        let mut bad = engine_message(0x20, "mixed.dbc");
        bad.signals[0].length = 0;

        let mut set = BusDefinitionSet::new();
        let result = set.add_source("mixed.dbc", vec![engine_message(0x10, "mixed.dbc"), bad]);
        assert!(result.is_err());
        assert!(set.is_empty());
        assert!(set.sources().is_empty());
    }

    #[test]
    fn test_duplicate_address_in_one_source_rejected() {
        let mut second = engine_message(0x3E8, "twice.dbc");
        second.name = "Second".to_string();

        let mut set = BusDefinitionSet::new();
        let result = set.add_source("twice.dbc", vec![engine_message(0x3E8, "twice.dbc"), second]);
        match result {
            Err(ImportError::InvalidSignalDefinition(reason)) => {
                assert!(reason.contains("0x3E8"));
                assert!(reason.contains("EngineData"));
                assert!(reason.contains("Second"));
            }
            other => panic!("expected duplicate address error, got {other:?}"),
        }
        assert!(set.is_empty());
        assert!(set.sources().is_empty());
    }

    #[test]
    fn test_signal_identity() {
        assert_eq!(can_signal_identity(0x3E8, "Speed"), "CAN_0x3E8_Speed");
        assert_eq!(can_signal_identity(0x1F, "Gear"), "CAN_0x01F_Gear");
        assert_eq!(can_signal_identity(0x18DAF110, "X"), "CAN_0x18DAF110_X");
    }

    #[test]
    fn test_handle_swaps_atomically() {
        let mut first = BusDefinitionSet::new();
        first.add_source("a.dbc", vec![engine_message(0x1, "a.dbc")]).unwrap();
        let handle = DefinitionHandle::new(first);

        let held = handle.snapshot();
        let previous = handle.replace(BusDefinitionSet::new());

        assert!(held.get_message(0x1).is_some());
        assert!(previous.get_message(0x1).is_some());
        assert!(handle.snapshot().is_empty());
    }
}
