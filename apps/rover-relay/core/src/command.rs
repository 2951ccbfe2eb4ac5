use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::STOP_TOKEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("protocol token is empty")]
    Empty,
    #[error("protocol token contains a line break")]
    EmbeddedNewline,
    #[error("protocol token `{0}` has surrounding whitespace")]
    Padded(String),
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("protocol token `{0}` is used for more than one purpose")]
    DuplicateToken(String),
}

/// A single directive relayed to the peripheral.
///
/// The relay treats commands opaquely: any non-empty, single-line token is a
/// valid command. Surrounding whitespace is stripped so that `"F\r"` and `"F"`
/// compare equal for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command(String);

impl Command {
    pub fn new(token: impl AsRef<str>) -> Result<Self, ProtocolError> {
        let token = token.as_ref().trim();
        if token.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if token.contains(['\n', '\r']) {
            return Err(ProtocolError::EmbeddedNewline);
        }
        Ok(Self(token.to_owned()))
    }

    /// The firmware's halt command.
    pub fn stop() -> Self {
        Self(STOP_TOKEN.to_owned())
    }

    /// Caller guarantees `token` is already trimmed, non-empty and single-line.
    pub(crate) fn from_trimmed(token: &str) -> Self {
        Self(token.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encodes the command as a wire line, trailing newline included.
    pub fn to_line(&self) -> String {
        format!("{}\n", self.0)
    }

    /// Interprets the token against the firmware's known command set.
    pub fn directive(&self) -> Option<Directive> {
        Directive::from_token(&self.0)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Command {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<Directive> for Command {
    fn from(directive: Directive) -> Self {
        Self(directive.token())
    }
}

/// Commands understood by the NodeMCU car firmware.
///
/// Only used for diagnostics and by the bundled clients; the relay never
/// rejects a token that does not map to a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Forward,
    Back,
    Left,
    Right,
    Stop,
    BacklightOn,
    BacklightOff,
    Horn,
    Preset(PresetSlot),
}

/// Firmware preset number, always a single decimal digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresetSlot(u8);

impl PresetSlot {
    /// `None` unless `slot` is in `0..=9`.
    pub fn new(slot: u8) -> Option<Self> {
        (slot <= 9).then_some(Self(slot))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Directive {
    pub fn from_token(token: &str) -> Option<Self> {
        let directive = match token {
            "F" => Directive::Forward,
            "B" => Directive::Back,
            "L" => Directive::Left,
            "R" => Directive::Right,
            "S" => Directive::Stop,
            "U" => Directive::BacklightOn,
            "u" => Directive::BacklightOff,
            "H" => Directive::Horn,
            _ => {
                let mut chars = token.chars();
                let digit = chars.next()?.to_digit(10)?;
                if chars.next().is_some() {
                    return None;
                }
                Directive::Preset(PresetSlot::new(u8::try_from(digit).ok()?)?)
            }
        };
        Some(directive)
    }

    pub fn token(self) -> String {
        match self {
            Directive::Forward => "F".into(),
            Directive::Back => "B".into(),
            Directive::Left => "L".into(),
            Directive::Right => "R".into(),
            Directive::Stop => "S".into(),
            Directive::BacklightOn => "U".into(),
            Directive::BacklightOff => "u".into(),
            Directive::Horn => "H".into(),
            Directive::Preset(slot) => slot.get().to_string(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Directive::Forward => "forward",
            Directive::Back => "back",
            Directive::Left => "left",
            Directive::Right => "right",
            Directive::Stop => "stop",
            Directive::BacklightOn => "backlight-on",
            Directive::BacklightOff => "backlight-off",
            Directive::Horn => "horn",
            Directive::Preset(_) => "preset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn command_trims_surrounding_whitespace() {
        let command = Command::new(" F\r").expect("valid command");
        assert_eq!(command.as_str(), "F");
        assert_eq!(command.to_line(), "F\n");
        assert_eq!(command, Command::new("F").unwrap());
    }

    #[test_timeout::timeout]
    fn command_rejects_blank_and_multiline_tokens() {
        assert_eq!(Command::new("   "), Err(ProtocolError::Empty));
        assert_eq!(Command::new("F\nB"), Err(ProtocolError::EmbeddedNewline));
    }

    #[test_timeout::timeout]
    fn unknown_tokens_are_still_commands() {
        let command: Command = "TURBO".parse().expect("opaque token accepted");
        assert_eq!(command.directive(), None);
    }

    #[test_timeout::timeout]
    fn directives_cover_firmware_command_set() {
        assert_eq!(Directive::from_token("u"), Some(Directive::BacklightOff));
        assert_eq!(Directive::from_token("U"), Some(Directive::BacklightOn));
        assert_eq!(
            Directive::from_token("7"),
            Some(Directive::Preset(PresetSlot::new(7).unwrap()))
        );
        assert_eq!(Directive::from_token("77"), None);
        assert_eq!(Command::from(Directive::Stop).as_str(), "S");
        assert_eq!(
            Command::from(Directive::Preset(PresetSlot::new(3).unwrap())).as_str(),
            "3"
        );
    }

    #[test_timeout::timeout]
    fn preset_slots_are_single_digits() {
        assert_eq!(PresetSlot::new(9).map(PresetSlot::get), Some(9));
        assert_eq!(PresetSlot::new(10), None);
        assert_eq!(PresetSlot::new(12), None);
    }
}
