//! DBC file parser
//!
//! Parses Vector DBC files and converts them into bus definitions.

use crate::signals::database::{
    BusDefinitionSet, ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{ImportError, Result};
use std::path::{Path, PathBuf};

/// Extended-frame flag DBC files set on 29-bit identifiers
const DBC_EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Outcome of loading several DBC files into one set
#[derive(Debug, Default)]
pub struct DbcLoadReport {
    /// Files accepted, with their message count
    pub loaded: Vec<(PathBuf, usize)>,
    /// Files rejected as a whole, with the reason
    pub rejected: Vec<(PathBuf, ImportError)>,
}

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        ImportError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1 (compatible with Windows-1252)
    let dbc_content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("DBC file {:?} is not UTF-8, trying Latin-1 encoding", path);
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc")
        .to_string();

    let messages = parse_dbc_str(&dbc_content, &source_filename)?;

    log::info!("Parsed {} messages from {:?}", messages.len(), path);
    Ok(messages)
}

/// Parse DBC text, tagging every message with `source`
pub fn parse_dbc_str(content: &str, source: &str) -> Result<Vec<MessageDefinition>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        ImportError::DbcParseError(format!("Failed to parse DBC {}: {:?}", source, e))
    })?;

    dbc.messages()
        .iter()
        .map(|dbc_msg| convert_message(dbc_msg, source))
        .collect()
}

/// Load several DBC files into `set`
///
/// A file that fails to parse or validate is rejected as a whole; the
/// remaining files are still loaded.
pub fn load_dbc_files(set: &mut BusDefinitionSet, paths: &[PathBuf]) -> DbcLoadReport {
    let mut report = DbcLoadReport::default();

    for path in paths {
        let result = parse_dbc_file(path).and_then(|messages| {
            let source = messages
                .first()
                .map(|m| m.source.clone())
                .unwrap_or_else(|| path.display().to_string());
            set.add_source(&source, messages)
        });

        match result {
            Ok(count) => report.loaded.push((path.clone(), count)),
            Err(e) => {
                log::warn!("Rejected bus definition file {:?}: {}", path, e);
                report.rejected.push((path.clone(), e));
            }
        }
    }

    report
}

/// Convert a DBC Motorola start bit (MSB, sawtooth numbering) to the
/// MSB-first linear position used by the decoder
pub fn motorola_to_linear(start_bit: u16) -> u16 {
    (start_bit / 8) * 8 + (7 - start_bit % 8)
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc_msg: &can_dbc::Message, source: &str) -> Result<MessageDefinition> {
    let mut is_multiplexed = false;
    let mut multiplexer_signal_name: Option<String> = None;

    // First pass: identify multiplexer signal
    for dbc_sig in dbc_msg.signals() {
        if let can_dbc::MultiplexIndicator::Multiplexor = dbc_sig.multiplexer_indicator() {
            is_multiplexed = true;
            multiplexer_signal_name = Some(dbc_sig.name().to_string());
            break;
        } else if matches!(
            dbc_sig.multiplexer_indicator(),
            can_dbc::MultiplexIndicator::MultiplexedSignal(_)
        ) {
            is_multiplexed = true;
        }
    }

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| convert_signal(dbc_sig, multiplexer_signal_name.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageDefinition {
        id: dbc_msg.message_id().0 & !DBC_EXTENDED_ID_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal: multiplexer_signal_name,
        source: source.to_string(),
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal_name: Option<&str>,
) -> Result<SignalDefinition> {
    let start_bit = u16::try_from(*dbc_sig.start_bit()).map_err(|_| {
        ImportError::InvalidSignalDefinition(format!(
            "signal '{}' has start bit {} out of range",
            dbc_sig.name(),
            dbc_sig.start_bit()
        ))
    })?;
    let length = u16::try_from(*dbc_sig.signal_size()).map_err(|_| {
        ImportError::InvalidSignalDefinition(format!(
            "signal '{}' has length {} out of range",
            dbc_sig.name(),
            dbc_sig.signal_size()
        ))
    })?;

    let (byte_order, start_bit) = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => (ByteOrder::LittleEndian, start_bit),
        can_dbc::ByteOrder::BigEndian => (ByteOrder::BigEndian, motorola_to_linear(start_bit)),
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => Some(MultiplexerInfo {
            multiplexer_signal: multiplexer_signal_name
                .ok_or_else(|| {
                    ImportError::InvalidSignalDefinition(format!(
                        "Multiplexed signal '{}' but no multiplexer found",
                        dbc_sig.name()
                    ))
                })?
                .to_string(),
            multiplexer_values: vec![switch_value as u64],
        }),
        _ => None,
    };

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit,
        length,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        multiplexer_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const POWERTRAIN_DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 1000 VehicleSpeed: 8 ECU1
 SG_ Speed : 7|16@0+ (0.1,0) [0|6553.5] "km/h" ECU2
"#;

    fn write_dbc(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_parse_simple_dbc() {
        let temp_file = write_dbc(POWERTRAIN_DBC);
        let messages = parse_dbc_file(temp_file.path()).unwrap();

        assert_eq!(messages.len(), 2);

        let msg1 = &messages[0];
        assert_eq!(msg1.id, 291);
        assert_eq!(msg1.name, "EngineData");
        assert_eq!(msg1.size, 8);
        assert_eq!(msg1.sender, Some("ECU1".to_string()));
        assert_eq!(msg1.signals.len(), 2);

        let sig1 = &msg1.signals[0];
        assert_eq!(sig1.name, "EngineSpeed");
        assert_eq!(sig1.start_bit, 0);
        assert_eq!(sig1.length, 16);
        assert_eq!(sig1.unit, Some("rpm".to_string()));
        assert_eq!(msg1.signals[1].offset, -40.0);
    }

    #[test]
    fn test_motorola_start_bit_conversion() {
        assert_eq!(motorola_to_linear(7), 0);
        assert_eq!(motorola_to_linear(0), 7);
        assert_eq!(motorola_to_linear(15), 8);
        assert_eq!(motorola_to_linear(12), 11);
    }

    #[test]
    fn test_big_endian_signal_decodes_from_dbc() {
        let messages = parse_dbc_str(POWERTRAIN_DBC, "powertrain.dbc").unwrap();
        let mut set = BusDefinitionSet::new();
        set.add_source("powertrain.dbc", messages).unwrap();

        let speed = &set.get_message(0x3E8).unwrap().signals[0];
        assert_eq!(speed.byte_order, ByteOrder::BigEndian);
        assert_eq!(speed.start_bit, 0);

        let signals = set.decode(0x3E8, &[0x12, 0x34, 0, 0, 0, 0, 0, 0]);
        assert_eq!(signals.len(), 1);
        assert!((signals[0].value - 466.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let dbc_content = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 512 MultiplexedMsg: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" ECU1
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" ECU1
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" ECU1
"#;

        let messages = parse_dbc_str(dbc_content, "mux.dbc").unwrap();

        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert!(msg.is_multiplexed);
        assert_eq!(msg.multiplexer_signal, Some("Mode".to_string()));
        assert_eq!(msg.signals.len(), 3);

        let sig_a = msg.signals.iter().find(|s| s.name == "SignalA").unwrap();
        assert_eq!(
            sig_a.multiplexer_info.as_ref().unwrap().multiplexer_signal,
            "Mode"
        );
    }

    #[test]
    fn test_rejected_file_does_not_block_others() {
        let good = write_dbc(POWERTRAIN_DBC);
        let duplicate = write_dbc(
            r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 100 Broken: 8 ECU1
 SG_ Value : 0|8@1+ (1,0) [0|255] "" ECU1
 SG_ Value : 8|8@1+ (1,0) [0|255] "" ECU1
"#,
        );
        let missing = PathBuf::from("/nonexistent/definitions.dbc");

        let mut set = BusDefinitionSet::new();
        let report = load_dbc_files(
            &mut set,
            &[duplicate.path().to_path_buf(), missing, good.path().to_path_buf()],
        );

        assert_eq!(report.loaded.len(), 1);
        assert_eq!(report.loaded[0].1, 2);
        assert_eq!(report.rejected.len(), 2);
        assert!(matches!(
            report.rejected[0].1,
            ImportError::InvalidSignalDefinition(_)
        ));
        assert!(matches!(report.rejected[1].1, ImportError::DbcParseError(_)));
        assert!(set.get_message(100).is_none());
        assert!(set.get_message(291).is_some());
    }
}
