//! Typed view of the device's `config.json`.
//!
//! The firmware stores a flat object: `GREEN_FRET: "GP10"`,
//! `GREEN_FRET_led: 0`, `whammy_min: 500`, and so on. Keys this module does
//! not model are carried through untouched on write-back.
pub mod mapping;

pub use mapping::{InputId, InputMapping, LedPhase, LedTarget, MAX_LED_INDEX};

use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const WHAMMY_MIN_KEY: &str = "whammy_min";
pub const WHAMMY_MAX_KEY: &str = "whammy_max";
pub const AXIS_LIMIT: u32 = 65535;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config is not a JSON object")]
    NotAnObject,

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{key} = {value} is outside LED range 0..={max}", max = MAX_LED_INDEX)]
    LedOutOfRange { key: String, value: i64 },

    #[error("whammy bounds {min}..{max} are inverted")]
    InvertedBounds { min: u16, max: u16 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    mappings: BTreeMap<InputId, InputMapping>,
    whammy_min: Option<u16>,
    whammy_max: Option<u16>,
    /// Everything else, preserved verbatim.
    extra: Map<String, Value>,
}

impl DeviceConfig {
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or(ConfigError::NotAnObject)?;
        let mut extra = obj.clone();
        let mut mappings = BTreeMap::new();

        for id in InputId::ALL {
            let Some(pin) = extra.remove(id.key()) else { continue };
            let pin = pin
                .as_str()
                .ok_or_else(|| invalid(id.key(), "pin must be a string"))?
                .to_string();
            let led_index = match extra.remove(&id.led_key()) {
                None | Some(Value::Null) => None,
                Some(v) => {
                    let raw = v.as_i64().ok_or_else(|| invalid(&id.led_key(), "LED index must be an integer"))?;
                    Some(mapping::validate_led_index(&id.led_key(), raw)?)
                }
            };
            mappings.insert(id, InputMapping { pin, led_index });
        }

        let whammy_min = take_axis(&mut extra, WHAMMY_MIN_KEY)?;
        let whammy_max = take_axis(&mut extra, WHAMMY_MAX_KEY)?;

        Ok(Self { mappings, whammy_min, whammy_max, extra })
    }

    pub fn to_json(&self) -> Value {
        let mut obj = self.extra.clone();
        for (id, m) in &self.mappings {
            obj.insert(id.key().to_string(), Value::String(m.pin.clone()));
            if let Some(idx) = m.led_index {
                obj.insert(id.led_key(), Value::from(idx));
            }
        }
        if let Some(min) = self.whammy_min {
            obj.insert(WHAMMY_MIN_KEY.to_string(), Value::from(min));
        }
        if let Some(max) = self.whammy_max {
            obj.insert(WHAMMY_MAX_KEY.to_string(), Value::from(max));
        }
        Value::Object(obj)
    }

    pub fn mapping(&self, id: InputId) -> Option<&InputMapping> {
        self.mappings.get(&id)
    }

    pub fn mappings(&self) -> impl Iterator<Item = (InputId, &InputMapping)> {
        self.mappings.iter().map(|(id, m)| (*id, m))
    }

    pub fn set_mapping(&mut self, id: InputId, mapping: InputMapping) -> Result<(), ConfigError> {
        let mapping = InputMapping::new(mapping.pin, mapping.led_index)?;
        self.mappings.insert(id, mapping);
        Ok(())
    }

    /// Assign a pin, keeping the input's LED index.
    pub fn set_pin(&mut self, id: InputId, pin: impl Into<String>) -> Result<(), ConfigError> {
        let led_index = self.mappings.get(&id).and_then(|m| m.led_index);
        self.set_mapping(id, InputMapping::new(pin, led_index)?)
    }

    /// LED index behind a preview name, if that input has one.
    pub fn led_index_for(&self, target: LedTarget) -> Option<u8> {
        self.mappings.get(&target.input).and_then(|m| m.led_index)
    }

    pub fn whammy_bounds(&self) -> (Option<u16>, Option<u16>) {
        (self.whammy_min, self.whammy_max)
    }

    /// Overwrites whatever bounds were there, manual or calibrated.
    pub fn set_whammy_bounds(&mut self, min: u16, max: u16) -> Result<(), ConfigError> {
        if min > max {
            return Err(ConfigError::InvertedBounds { min, max });
        }
        self.whammy_min = Some(min);
        self.whammy_max = Some(max);
        Ok(())
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), reason: reason.to_string() }
}

fn take_axis(obj: &mut Map<String, Value>, key: &str) -> Result<Option<u16>, ConfigError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
                .ok_or_else(|| invalid(key, "expected a non-negative integer"))?;
            if n > AXIS_LIMIT as u64 {
                return Err(invalid(key, "exceeds 65535"));
            }
            Ok(Some(n as u16))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "GREEN_FRET": "GP10",
            "GREEN_FRET_led": 0,
            "RED_FRET": "GP11",
            "WHAMMY": "GP27",
            "whammy_min": 500,
            "whammy_max": 60000,
            "tilt_wave_enabled": true,
            "led_brightness": 0.4
        })
    }

    #[test]
    fn parses_mappings_and_keeps_unknown_keys() {
        let cfg = DeviceConfig::from_json(&sample()).unwrap();
        assert_eq!(cfg.mapping(InputId::GreenFret), Some(&InputMapping { pin: "GP10".into(), led_index: Some(0) }));
        assert_eq!(cfg.mapping(InputId::RedFret).and_then(|m| m.led_index), None);
        assert_eq!(cfg.whammy_bounds(), (Some(500), Some(60000)));
        assert_eq!(cfg.extra("WHAMMY"), Some(&json!("GP27")));
        assert_eq!(cfg.to_json(), sample());
    }

    #[test]
    fn led_index_is_validated_at_the_boundary() {
        let err = DeviceConfig::from_json(&json!({"GREEN_FRET": "GP10", "GREEN_FRET_led": 9})).unwrap_err();
        assert_eq!(err, ConfigError::LedOutOfRange { key: "GREEN_FRET_led".into(), value: 9 });
        let err = DeviceConfig::from_json(&json!({"GREEN_FRET": 10})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(DeviceConfig::from_json(&json!([1, 2])).unwrap_err(), ConfigError::NotAnObject);
    }

    #[test]
    fn whammy_bounds_overwrite_previous_values() {
        let mut cfg = DeviceConfig::from_json(&sample()).unwrap();
        cfg.set_whammy_bounds(0, 60750).unwrap();
        assert_eq!(cfg.to_json()["whammy_min"], json!(0));
        assert_eq!(cfg.to_json()["whammy_max"], json!(60750));
        assert!(cfg.set_whammy_bounds(10, 5).is_err());
    }

    #[test]
    fn set_pin_keeps_led() {
        let mut cfg = DeviceConfig::from_json(&sample()).unwrap();
        cfg.set_pin(InputId::GreenFret, "GP2").unwrap();
        assert_eq!(cfg.mapping(InputId::GreenFret).unwrap().led_index, Some(0));
        let target = LedTarget::from_preview_name("green-fret-released").unwrap();
        assert_eq!(cfg.led_index_for(target), Some(0));
    }
}
