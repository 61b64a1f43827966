//! Structured-message signal definitions
//!
//! Metadata for `<message_type>.<field>` signals, loaded from a JSON array
//! or guessed from the signal name when nothing was loaded.

use crate::types::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Static metadata for one structured signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredSignalDefinition {
    pub message_type: String,
    pub signal_name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl StructuredSignalDefinition {
    /// Identity under which samples of this signal are stored
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.message_type, self.signal_name)
    }
}

/// Load a JSON array of structured definitions
pub fn load_structured_definitions(path: &Path) -> Result<Vec<StructuredSignalDefinition>> {
    log::info!("Loading structured signal definitions: {:?}", path);
    let content = std::fs::read_to_string(path)?;
    let definitions: Vec<StructuredSignalDefinition> = serde_json::from_str(&content)?;
    log::info!("Loaded {} structured definitions from {:?}", definitions.len(), path);
    Ok(definitions)
}

/// Guess a definition for a stored signal name of the form `<type>.<field>`
pub fn guess_definition(full_name: &str) -> Option<StructuredSignalDefinition> {
    let (message_type, signal_name) = full_name.split_once('.')?;
    if message_type.is_empty() || signal_name.is_empty() {
        return None;
    }

    let lower = signal_name.to_lowercase();
    let (data_type, unit) = guess_type_and_unit(&lower);

    Some(StructuredSignalDefinition {
        message_type: message_type.to_string(),
        signal_name: signal_name.to_string(),
        data_type: Some(data_type.to_string()),
        unit: unit.map(str::to_string),
        description: Some(format!("Auto-generated definition for {}", full_name)),
    })
}

fn guess_type_and_unit(lower: &str) -> (&'static str, Option<&'static str>) {
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["speed", "vego", "velocity"]) {
        ("float", Some("m/s"))
    } else if has(&["accel", "aego"]) {
        ("float", Some("m/s²"))
    } else if has(&["angle", "steer"]) {
        ("float", Some("deg"))
    } else if has(&["temp"]) {
        ("float", Some("°C"))
    } else if has(&["voltage"]) {
        ("float", Some("V"))
    } else if has(&["current"]) {
        ("float", Some("A"))
    } else if has(&["pressed", "enabled", "active", "engaged", "valid", "available"]) {
        ("bool", None)
    } else if has(&["latitude", "longitude"]) {
        ("float", Some("deg"))
    } else if has(&["altitude", "distance"]) {
        ("float", Some("m"))
    } else if has(&["count", "counter", "frame", "gear", "state", "status", "mode"]) {
        ("int", None)
    } else {
        ("float", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_definitions() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"[
                {"message_type": "carState", "signal_name": "vEgo", "unit": "m/s", "description": "Vehicle speed"},
                {"message_type": "carState", "signal_name": "gearShifter"}
            ]"#,
        )
        .unwrap();
        file.flush().unwrap();

        let definitions = load_structured_definitions(file.path()).unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].full_name(), "carState.vEgo");
        assert_eq!(definitions[0].unit.as_deref(), Some("m/s"));
        assert!(definitions[1].data_type.is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        file.flush().unwrap();
        assert!(load_structured_definitions(file.path()).is_err());
    }

    #[test]
    fn test_guess_definition() {
        let speed = guess_definition("carState.vEgo").unwrap();
        assert_eq!(speed.message_type, "carState");
        assert_eq!(speed.unit.as_deref(), Some("m/s"));
        assert_eq!(speed.data_type.as_deref(), Some("float"));

        let brake = guess_definition("carState.brakePressed").unwrap();
        assert_eq!(brake.data_type.as_deref(), Some("bool"));

        let lat = guess_definition("gpsLocation.latitude").unwrap();
        assert_eq!(lat.unit.as_deref(), Some("deg"));

        assert!(guess_definition("noDot").is_none());
        assert!(guess_definition(".field").is_none());
    }
}
