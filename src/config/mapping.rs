use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Highest LED position on the controller's strip.
pub const MAX_LED_INDEX: u8 = 6;

/// Physical inputs on the guitar, named by their config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputId {
    GreenFret,
    RedFret,
    YellowFret,
    BlueFret,
    OrangeFret,
    StrumUp,
    StrumDown,
    Select,
    Start,
    Tilt,
    Guide,
    Up,
    Down,
    Left,
    Right,
}

impl InputId {
    pub const ALL: [InputId; 15] = [
        InputId::GreenFret,
        InputId::RedFret,
        InputId::YellowFret,
        InputId::BlueFret,
        InputId::OrangeFret,
        InputId::StrumUp,
        InputId::StrumDown,
        InputId::Select,
        InputId::Start,
        InputId::Tilt,
        InputId::Guide,
        InputId::Up,
        InputId::Down,
        InputId::Left,
        InputId::Right,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            InputId::GreenFret => "GREEN_FRET",
            InputId::RedFret => "RED_FRET",
            InputId::YellowFret => "YELLOW_FRET",
            InputId::BlueFret => "BLUE_FRET",
            InputId::OrangeFret => "ORANGE_FRET",
            InputId::StrumUp => "STRUM_UP",
            InputId::StrumDown => "STRUM_DOWN",
            InputId::Select => "SELECT",
            InputId::Start => "START",
            InputId::Tilt => "TILT",
            InputId::Guide => "GUIDE",
            InputId::Up => "UP",
            InputId::Down => "DOWN",
            InputId::Left => "LEFT",
            InputId::Right => "RIGHT",
        }
    }

    /// Key of the LED index entry, e.g. `GREEN_FRET_led`.
    pub fn led_key(&self) -> String {
        format!("{}_led", self.key())
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.key() == key)
    }
}

/// Where an input is wired and which LED (if any) mirrors it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    /// Board pin name such as `GP10`.
    pub pin: String,
    pub led_index: Option<u8>,
}

impl InputMapping {
    pub fn new(pin: impl Into<String>, led_index: Option<u8>) -> Result<Self, ConfigError> {
        let pin = pin.into();
        if pin.trim().is_empty() {
            return Err(ConfigError::InvalidValue { key: "pin".into(), reason: "empty pin name".into() });
        }
        if let Some(idx) = led_index {
            validate_led_index("led_index", idx as i64)?;
        }
        Ok(Self { pin, led_index })
    }
}

pub(crate) fn validate_led_index(key: &str, value: i64) -> Result<u8, ConfigError> {
    if (0..=MAX_LED_INDEX as i64).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ConfigError::LedOutOfRange { key: key.to_string(), value })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedPhase {
    Any,
    Pressed,
    Released,
}

/// An LED addressed by the names the colour editor uses for previews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedTarget {
    pub input: InputId,
    pub phase: LedPhase,
}

impl LedTarget {
    /// `green-fret`, `green-fret-pressed`, `strum-up-active`, ... (case-insensitive).
    pub fn from_preview_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let (base, phase) = if let Some(base) = name.strip_suffix("-pressed") {
            (base, LedPhase::Pressed)
        } else if let Some(base) = name.strip_suffix("-active") {
            (base, LedPhase::Pressed)
        } else if let Some(base) = name.strip_suffix("-released") {
            (base, LedPhase::Released)
        } else {
            (name.as_str(), LedPhase::Any)
        };
        let input = match base {
            "green-fret" => InputId::GreenFret,
            "red-fret" => InputId::RedFret,
            "yellow-fret" => InputId::YellowFret,
            "blue-fret" => InputId::BlueFret,
            "orange-fret" => InputId::OrangeFret,
            "strum-up" => InputId::StrumUp,
            "strum-down" => InputId::StrumDown,
            _ => return None,
        };
        // Frets are pressed/released, strums are active/released.
        let is_strum = matches!(input, InputId::StrumUp | InputId::StrumDown);
        if (is_strum && name.ends_with("-pressed")) || (!is_strum && name.ends_with("-active")) {
            return None;
        }
        Some(Self { input, phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        for id in InputId::ALL {
            assert_eq!(InputId::from_key(id.key()), Some(id));
        }
        assert_eq!(InputId::GreenFret.led_key(), "GREEN_FRET_led");
        assert_eq!(InputId::from_key("WHAMMY"), None);
    }

    #[test]
    fn preview_names_map_to_inputs() {
        let t = LedTarget::from_preview_name("Green-Fret-Pressed").unwrap();
        assert_eq!((t.input, t.phase), (InputId::GreenFret, LedPhase::Pressed));
        let t = LedTarget::from_preview_name("strum-down-active").unwrap();
        assert_eq!((t.input, t.phase), (InputId::StrumDown, LedPhase::Pressed));
        assert_eq!(LedTarget::from_preview_name("orange-fret").map(|t| t.phase), Some(LedPhase::Any));
        assert!(LedTarget::from_preview_name("strum-up-pressed").is_none());
        assert!(LedTarget::from_preview_name("tilt").is_none());
    }

    #[test]
    fn mapping_rejects_led_past_strip_end() {
        assert!(InputMapping::new("GP10", Some(6)).is_ok());
        assert!(matches!(InputMapping::new("GP10", Some(7)), Err(ConfigError::LedOutOfRange { value: 7, .. })));
        assert!(InputMapping::new(" ", None).is_err());
    }
}
