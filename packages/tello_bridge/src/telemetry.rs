//! Telemetry decoder.
//!
//! The device reports its state as `key:value;` pairs in one ASCII datagram,
//! e.g. `pitch:0;roll:0;yaw:0;...;bat:88;baro:12.3;time:0;`. Each datagram is
//! a full snapshot, so decoding is stateless and lossy per field: a corrupt
//! pair is skipped and the rest of the frame survives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Parsed value of a single telemetry field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    fn parse(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Integer(i);
        }
        match raw.parse::<f64>() {
            Ok(f) if f.is_finite() => Self::Float(f),
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryField {
    pub value: FieldValue,
    /// Serialized as `null` for unitless keys.
    pub unit: Option<String>,
    pub description: String,
}

/// One decoded telemetry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub raw: String,
    pub fields: BTreeMap<String, TelemetryField>,
    /// Seconds since the Unix epoch at decode time.
    pub timestamp: f64,
}

impl TelemetryFrame {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).map(|f| &f.value)
    }

    /// Field values without unit or description.
    pub fn parsed(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .map(|(k, f)| (k.clone(), f.value.clone()))
            .collect()
    }
}

/// Known state keys: (key, unit, description).
const KNOWN_FIELDS: &[(&str, Option<&str>, &str)] = &[
    ("mid", None, "Mission Pad ID (-1 if not detected)"),
    ("x", Some("cm"), "X coordinate on Mission Pad (0 if not detected)"),
    ("y", Some("cm"), "Y coordinate on Mission Pad (0 if not detected)"),
    ("z", Some("cm"), "Z coordinate on Mission Pad (0 if not detected)"),
    ("mpry", Some("deg"), "Mission Pad pitch,roll,yaw"),
    ("pitch", Some("deg"), "Attitude pitch in degrees"),
    ("roll", Some("deg"), "Attitude roll in degrees"),
    ("yaw", Some("deg"), "Attitude yaw in degrees"),
    ("vgx", Some("dm/s"), "Speed on X axis"),
    ("vgy", Some("dm/s"), "Speed on Y axis"),
    ("vgz", Some("dm/s"), "Speed on Z axis"),
    ("templ", Some("°C"), "Lowest temperature in °C"),
    ("temph", Some("°C"), "Highest temperature in °C"),
    ("tof", Some("cm"), "Time of flight distance in cm"),
    ("h", Some("cm"), "Height in cm"),
    ("bat", Some("%"), "Battery percentage"),
    ("baro", Some("cm"), "Barometer measurement in cm"),
    ("time", Some("s"), "Motor time in seconds"),
    ("agx", Some("0.001g"), "Acceleration on X axis"),
    ("agy", Some("0.001g"), "Acceleration on Y axis"),
    ("agz", Some("0.001g"), "Acceleration on Z axis"),
];

fn describe(key: &str) -> (Option<String>, String) {
    KNOWN_FIELDS
        .iter()
        .find(|(k, _, _)| *k == key)
        .map(|(_, unit, desc)| (unit.map(str::to_string), desc.to_string()))
        .unwrap_or_else(|| (None, "Unknown parameter".to_string()))
}

/// Decode one telemetry line. Never fails; unusable input yields no fields.
pub fn decode(line: &str) -> TelemetryFrame {
    let mut fields = BTreeMap::new();

    for pair in line.trim().split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once(':') else {
            warn!("Skipping telemetry pair without separator: {:?}", pair);
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            warn!("Skipping incomplete telemetry pair: {:?}", pair);
            continue;
        }
        let (unit, description) = describe(key);
        fields.insert(
            key.to_string(),
            TelemetryField {
                value: FieldValue::parse(value),
                unit,
                description,
            },
        );
    }

    TelemetryFrame {
        raw: line.to_string(),
        fields,
        timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
    }
}

/// Decode a raw datagram. Non-UTF-8 payloads are dropped.
pub fn decode_datagram(bytes: &[u8]) -> Option<TelemetryFrame> {
    match std::str::from_utf8(bytes) {
        Ok(line) => Some(decode(line)),
        Err(_) => {
            debug!("Dropping binary telemetry datagram ({} bytes)", bytes.len());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic() {
        let frame = decode("bat:88;h:120;");
        assert_eq!(frame.fields.len(), 2);
        assert_eq!(frame.get("bat"), Some(&FieldValue::Integer(88)));
        assert_eq!(frame.get("h"), Some(&FieldValue::Integer(120)));
        assert_eq!(frame.fields["bat"].unit.as_deref(), Some("%"));
        assert_eq!(frame.fields["h"].unit.as_deref(), Some("cm"));
        assert_eq!(frame.raw, "bat:88;h:120;");
    }

    #[test]
    fn test_corrupt_pair_is_skipped() {
        let frame = decode("bat:88;h:;");
        assert_eq!(frame.get("bat"), Some(&FieldValue::Integer(88)));
        assert!(!frame.fields.contains_key("h"));
    }

    #[test]
    fn test_missing_separator_and_empty_key() {
        let frame = decode("garbage;:5;tof:10;");
        assert_eq!(frame.fields.len(), 1);
        assert_eq!(frame.get("tof"), Some(&FieldValue::Integer(10)));
    }

    #[test]
    fn test_empty_and_unparsable_lines() {
        assert!(decode("").fields.is_empty());
        assert!(decode("\r\n").fields.is_empty());
        assert!(decode(";;;").fields.is_empty());
        assert!(decode("no pairs here").fields.is_empty());
    }

    #[test]
    fn test_value_types() {
        let frame = decode("baro:-12.57;agx:-1.00;mpry:0,0,0;mid:-1;\r\n");
        assert_eq!(frame.get("baro"), Some(&FieldValue::Float(-12.57)));
        assert_eq!(frame.get("agx"), Some(&FieldValue::Float(-1.0)));
        assert_eq!(
            frame.get("mpry"),
            Some(&FieldValue::Text("0,0,0".to_string()))
        );
        assert_eq!(frame.get("mid"), Some(&FieldValue::Integer(-1)));
    }

    #[test]
    fn test_unknown_key_is_kept_without_unit() {
        let frame = decode("wifi:90;");
        let field = &frame.fields["wifi"];
        assert_eq!(field.value, FieldValue::Integer(90));
        assert!(field.unit.is_none());
        assert_eq!(field.description, "Unknown parameter");
    }

    #[test]
    fn test_full_state_line() {
        let line = "mid:-1;x:0;y:0;z:0;mpry:0,0,0;pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;\
                    templ:83;temph:85;tof:10;h:0;bat:88;baro:194.63;time:0;agx:-2.00;agy:1.00;agz:-999.00;\r\n";
        let frame = decode(line);
        assert_eq!(frame.fields.len(), 21);
        assert_eq!(frame.get("bat").and_then(FieldValue::as_f64), Some(88.0));
        assert_eq!(frame.get("baro").and_then(FieldValue::as_f64), Some(194.63));
    }

    #[test]
    fn test_decode_datagram_drops_binary() {
        assert!(decode_datagram(&[0x00, 0xff, 0x80]).is_none());
        let frame = decode_datagram(b"bat:50;").unwrap();
        assert_eq!(frame.get("bat"), Some(&FieldValue::Integer(50)));
    }

    #[test]
    fn test_field_serialization() {
        let frame = decode("bat:88;");
        let json = serde_json::to_value(&frame.fields["bat"]).unwrap();
        assert_eq!(json["value"], 88);
        assert_eq!(json["unit"], "%");
        assert_eq!(json["description"], "Battery percentage");
    }

    #[test]
    fn test_unitless_fields_serialize_null_unit() {
        let frame = decode("mid:-1;wifi:90;");
        for key in ["mid", "wifi"] {
            let json = serde_json::to_value(&frame.fields[key]).unwrap();
            assert!(json.as_object().unwrap().contains_key("unit"), "{key}");
            assert!(json["unit"].is_null());
        }
    }
}
