//! Reply classifier for poll traffic.
//!
//! Poll replies carry no request id, so they are told apart purely by
//! prefix. The prefixes below must stay disjoint from each other and from
//! every framed reply, otherwise a poll reply could land in a request buffer.
use crate::live::types::*;

pub const PIN_PREFIX: &str = "PIN:";
pub const WHAMMY_PREFIX: &str = "WHAMMY:";
pub const JOYSTICK_PREFIX: &str = "JOYSTICK:";

pub const POLL_REPLY_PREFIXES: &[&str] = &[PIN_PREFIX, WHAMMY_PREFIX, JOYSTICK_PREFIX];

/// Line starts seen in replies to framed commands.
pub const FRAMED_REPLY_PREFIXES: &[&str] = &[
    "PINDETECT:",
    "VERSION:",
    "DEVICENAME:",
    "SETLED:",
    "ERROR:",
    crate::serial::frame::END_MARKER,
];

/// True if the line belongs to poll traffic, whether or not it parses.
pub fn is_poll_reply(line: &str) -> bool {
    let line = line.trim();
    POLL_REPLY_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Classify one inbound line. `None` for anything that is not a well-formed poll reply.
pub fn classify_reply(line: &str) -> Option<LiveEvent> {
    let line = line.trim();
    if line.starts_with(PIN_PREFIX) {
        parse_pin_response(line)
    } else if line.starts_with(WHAMMY_PREFIX) {
        parse_whammy_response(line)
    } else if line.starts_with(JOYSTICK_PREFIX) {
        parse_joystick_response(line)
    } else {
        None
    }
}

/// Parse PIN response from firmware
/// Format: PIN:<key>:<0|1|ERR>
pub fn parse_pin_response(line: &str) -> Option<LiveEvent> {
    let rest = line.strip_prefix(PIN_PREFIX)?;
    let (key, value) = rest.rsplit_once(':')?;
    if key.is_empty() {
        return None;
    }
    let state = match value {
        "1" => PinState::Pressed,
        "0" => PinState::Released,
        "ERR" => PinState::Error,
        _ => return None,
    };
    Some(LiveEvent::Pin { key: key.to_string(), state })
}

/// Parse WHAMMY response from firmware
/// Format: WHAMMY:<int>
pub fn parse_whammy_response(line: &str) -> Option<LiveEvent> {
    let value = line.strip_prefix(WHAMMY_PREFIX)?.parse::<i32>().ok()?;
    Some(LiveEvent::Whammy { value })
}

/// Parse JOYSTICK response from firmware
/// Format: JOYSTICK:X:<int>:Y:<int>
pub fn parse_joystick_response(line: &str) -> Option<LiveEvent> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() != 5 || parts[0] != "JOYSTICK" || parts[1] != "X" || parts[3] != "Y" {
        return None;
    }
    let x = parts[2].parse::<i32>().ok()?;
    let y = parts[4].parse::<i32>().ok()?;
    Some(LiveEvent::Joystick { x, y })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_poll_reply() {
        assert_eq!(
            classify_reply("PIN:GREEN_FRET:1"),
            Some(LiveEvent::Pin { key: "GREEN_FRET".into(), state: PinState::Pressed })
        );
        assert_eq!(
            classify_reply("PIN:TILT:ERR\r"),
            Some(LiveEvent::Pin { key: "TILT".into(), state: PinState::Error })
        );
        assert_eq!(classify_reply("WHAMMY:-1"), Some(LiveEvent::Whammy { value: -1 }));
        assert_eq!(
            classify_reply("JOYSTICK:X:32000:Y:120"),
            Some(LiveEvent::Joystick { x: 32000, y: 120 })
        );
    }

    #[test]
    fn malformed_poll_replies_do_not_classify() {
        for line in ["PIN:GREEN_FRET", "PIN::1", "PIN:GREEN_FRET:2", "WHAMMY:", "WHAMMY:abc", "JOYSTICK:1:2", "JOYSTICK:X:1:Z:2"] {
            assert_eq!(classify_reply(line), None, "{line}");
            assert!(is_poll_reply(line));
        }
    }

    #[test]
    fn framed_replies_are_never_classified() {
        for line in [
            "PINDETECT:START:GREEN_FRET",
            "PINDETECT:DETECTED:GREEN_FRET:GP10",
            "PINDETECT:NONE:GREEN_FRET",
            "VERSION:2.2",
            "DEVICENAME:My Guitar",
            "SETLED:0:OK",
            "END",
            "{\"WHAMMY\": \"GP27\"}",
        ] {
            assert!(!is_poll_reply(line), "{line}");
            assert_eq!(classify_reply(line), None, "{line}");
        }
    }

    #[test]
    fn prefixes_are_pairwise_disjoint() {
        let all: Vec<&str> = POLL_REPLY_PREFIXES.iter().chain(FRAMED_REPLY_PREFIXES).copied().collect();
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert!(!a.starts_with(b), "{a} overlaps {b}");
                }
            }
        }
    }
}
