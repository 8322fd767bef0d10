//! Line protocol spoken by the reader firmware.
//!
//! Device -> host:
//!
//! ```text
//! OK            device ready after boot
//! ON:<uid>      tag detected
//! OF:<uid>      tag removed
//! ```
//!
//! Host -> device:
//!
//! ```text
//! D|<line1>|<line2>|<line3>|<line4>|<icon>
//! ```
//!
//! The codec neither truncates nor escapes display text; callers hand it
//! frames that already fit (see [`crate::registry::fit_display_lines`]).

use std::fmt;

use tracing::trace;

use crate::tag::{TagId, TagIdError};

const READY: &str = "OK";
const TAG_ON_PREFIX: &str = "ON:";
const TAG_OFF_PREFIX: &str = "OF:";
const DISPLAY_PREFIX: char = 'D';
const FIELD_SEPARATOR: char = '|';

/// An event decoded from one line of device output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A tag was placed on the reader.
    TagOn(TagId),
    /// The previously reported tag was taken off the reader.
    TagOff(TagId),
    /// The firmware finished booting.
    Ready,
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagOn(id) => write!(f, "{TAG_ON_PREFIX}{id}"),
            Self::TagOff(id) => write!(f, "{TAG_OFF_PREFIX}{id}"),
            Self::Ready => f.write_str(READY),
        }
    }
}

/// Why a line could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unrecognised device line {0:?}")]
    UnknownLine(String),

    #[error("bad tag id in {line:?}: {source}")]
    BadTagId {
        line: String,
        #[source]
        source: TagIdError,
    },
}

/// Decode a device line, reporting why it was rejected.
pub fn decode_strict(line: &str) -> Result<DeviceEvent, DecodeError> {
    let line = line.trim();

    if line == READY {
        return Ok(DeviceEvent::Ready);
    }

    let (prefix, rest) = if let Some(rest) = line.strip_prefix(TAG_ON_PREFIX) {
        (TAG_ON_PREFIX, rest)
    } else if let Some(rest) = line.strip_prefix(TAG_OFF_PREFIX) {
        (TAG_OFF_PREFIX, rest)
    } else {
        return Err(DecodeError::UnknownLine(line.to_owned()));
    };

    let id = TagId::parse(rest).map_err(|source| DecodeError::BadTagId {
        line: line.to_owned(),
        source,
    })?;

    Ok(if prefix == TAG_ON_PREFIX {
        DeviceEvent::TagOn(id)
    } else {
        DeviceEvent::TagOff(id)
    })
}

/// Decode a device line, discarding anything that is not a known message.
///
/// Boot chatter, debug prints and line noise are expected on this link, so a
/// rejected line is only traced.
pub fn decode(line: &str) -> Option<DeviceEvent> {
    match decode_strict(line) {
        Ok(event) => Some(event),
        Err(e) => {
            trace!(error = %e, "discarding device line");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Display frames
// ---------------------------------------------------------------------------

/// Glyph drawn next to the display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IconType {
    #[default]
    None,
    Floppy,
    Steam,
}

impl IconType {
    /// Pick the glyph for a launch command: Steam launches get the Steam
    /// logo, anything else that runs gets a floppy.
    pub fn for_command(command: &str) -> Self {
        let command = command.trim();
        if command.is_empty() {
            Self::None
        } else if command.to_ascii_lowercase().starts_with("steam") {
            Self::Steam
        } else {
            Self::Floppy
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Floppy => 1,
            Self::Steam => 2,
        }
    }
}

/// One full screen of text for the device display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayFrame {
    pub lines: [String; 4],
    pub icon: IconType,
}

impl DisplayFrame {
    pub fn new(lines: [String; 4], icon: IconType) -> Self {
        Self { lines, icon }
    }
}

/// Encode a display update, without the trailing newline.
pub fn encode(frame: &DisplayFrame) -> String {
    let [l1, l2, l3, l4] = &frame.lines;
    format!(
        "{DISPLAY_PREFIX}{FIELD_SEPARATOR}{l1}{FIELD_SEPARATOR}{l2}{FIELD_SEPARATOR}{l3}\
         {FIELD_SEPARATOR}{l4}{FIELD_SEPARATOR}{}",
        frame.icon.code()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TagId {
        TagId::parse(s).unwrap()
    }

    #[test]
    fn decode_ready() {
        assert_eq!(decode("OK\r\n"), Some(DeviceEvent::Ready));
    }

    #[test]
    fn decode_tag_on_lowercases_uid() {
        assert_eq!(
            decode("ON:1D0DC0070D1080"),
            Some(DeviceEvent::TagOn(id("1d0dc0070d1080")))
        );
    }

    #[test]
    fn decode_tag_off() {
        assert_eq!(decode("OF:a1b2c3d4"), Some(DeviceEvent::TagOff(id("a1b2c3d4"))));
    }

    #[test]
    fn decode_discards_unknown_prefixes() {
        assert_eq!(decode("RFIDisk firmware 0.7"), None);
        assert_eq!(decode(""), None);
        assert_eq!(decode("D|echo|||"), None);
    }

    #[test]
    fn decode_discards_bad_uid() {
        assert_eq!(decode("ON:"), None);
        assert!(matches!(
            decode_strict("ON:xyz1"),
            Err(DecodeError::BadTagId { .. })
        ));
    }

    #[test]
    fn encode_display_frame() {
        let frame = DisplayFrame::new(
            [
                "DOOM".to_string(),
                "GZDoom Engine".to_string(),
                "1993".to_string(),
                "id Software".to_string(),
            ],
            IconType::Floppy,
        );
        assert_eq!(encode(&frame), "D|DOOM|GZDoom Engine|1993|id Software|1");
    }

    #[test]
    fn encode_empty_lines() {
        let frame = DisplayFrame::default();
        assert_eq!(encode(&frame), "D|||||0");
    }

    #[test]
    fn icon_for_command() {
        assert_eq!(IconType::for_command(""), IconType::None);
        assert_eq!(IconType::for_command("   "), IconType::None);
        assert_eq!(
            IconType::for_command("Steam steam://rungameid/570"),
            IconType::Steam
        );
        assert_eq!(IconType::for_command("/usr/bin/gzdoom"), IconType::Floppy);
    }

    #[test]
    fn device_event_display_matches_wire_form() {
        assert_eq!(DeviceEvent::TagOn(id("abcd")).to_string(), "ON:abcd");
        assert_eq!(DeviceEvent::TagOff(id("abcd")).to_string(), "OF:abcd");
        assert_eq!(DeviceEvent::Ready.to_string(), "OK");
    }
}
