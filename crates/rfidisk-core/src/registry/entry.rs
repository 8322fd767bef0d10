//! Tag entries and the display text derived from them.

use serde::{Deserialize, Serialize};

use crate::codec::{DisplayFrame, IconType};
use crate::tag::TagId;

/// Maximum characters per display line; the last two lines share the screen
/// with the icon.
pub const DISPLAY_LINE_LIMITS: [usize; 4] = [20, 20, 14, 14];

/// Placeholder text given to auto-created entries.
pub const STUB_LINE1: &str = "new entry";
pub const STUB_LINE2: &str = "configure me";
pub const STUB_LINE3: &str = "edit tags.json";

/// What to do when a tag is inserted or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub id: TagId,
    /// Shell command line run on insertion. Empty means display only.
    pub command: String,
    /// Shell command line run on removal instead of signalling the launched
    /// process tree. Empty means signal the tree.
    pub terminate: String,
    pub line1: String,
    pub line2: String,
    pub line3: String,
    pub line4: String,
}

impl TagEntry {
    /// Placeholder entry for a tag the registry has never seen.
    pub fn stub(id: TagId) -> Self {
        let line4 = id.to_string();
        Self {
            id,
            command: String::new(),
            terminate: String::new(),
            line1: STUB_LINE1.to_string(),
            line2: STUB_LINE2.to_string(),
            line3: STUB_LINE3.to_string(),
            line4,
        }
    }

    pub fn has_command(&self) -> bool {
        !self.command.trim().is_empty()
    }

    pub fn has_terminate_command(&self) -> bool {
        !self.terminate.trim().is_empty()
    }

    /// Whether this entry still carries the auto-created placeholder text.
    pub fn is_stub(&self) -> bool {
        !self.has_command() && self.line1 == STUB_LINE1 && self.line2 == STUB_LINE2
    }

    /// The frame to show while this tag is inserted, already truncated and
    /// sanitised for the wire.
    pub fn display_frame(&self) -> DisplayFrame {
        DisplayFrame::new(
            fit_display_lines([&self.line1, &self.line2, &self.line3, &self.line4]),
            IconType::for_command(&self.command),
        )
    }

    pub(crate) fn from_record(id: TagId, record: TagRecord) -> Self {
        Self {
            id,
            command: record.command,
            terminate: record.terminate,
            line1: record.line1,
            line2: record.line2,
            line3: record.line3,
            line4: record.line4,
        }
    }

    pub(crate) fn to_record(&self) -> TagRecord {
        TagRecord {
            command: self.command.clone(),
            line1: self.line1.clone(),
            line2: self.line2.clone(),
            line3: self.line3.clone(),
            line4: self.line4.clone(),
            terminate: self.terminate.clone(),
        }
    }
}

/// On-disk shape of one entry. The id is the key of the enclosing map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TagRecord {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub line1: String,
    #[serde(default)]
    pub line2: String,
    #[serde(default)]
    pub line3: String,
    #[serde(default)]
    pub line4: String,
    #[serde(default)]
    pub terminate: String,
}

/// Truncate and sanitise four display lines so they can be sent as-is.
///
/// Lines are cut to [`DISPLAY_LINE_LIMITS`] characters. The field separator
/// `|` becomes `_` and line breaks become spaces.
pub fn fit_display_lines(lines: [&str; 4]) -> [String; 4] {
    let mut out: [String; 4] = Default::default();
    for (slot, (line, limit)) in out.iter_mut().zip(lines.iter().zip(DISPLAY_LINE_LIMITS)) {
        *slot = line
            .chars()
            .map(|c| match c {
                '|' => '_',
                '\r' | '\n' => ' ',
                other => other,
            })
            .take(limit)
            .collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TagId {
        TagId::parse(s).unwrap()
    }

    #[test]
    fn fit_truncates_to_line_limits() {
        let long = "abcdefghijklmnopqrstuvwxyz";
        let fitted = fit_display_lines([long, long, long, long]);
        assert_eq!(fitted[0], "abcdefghijklmnopqrst");
        assert_eq!(fitted[1], "abcdefghijklmnopqrst");
        assert_eq!(fitted[2], "abcdefghijklmn");
        assert_eq!(fitted[3], "abcdefghijklmn");
    }

    #[test]
    fn fit_counts_characters_not_bytes() {
        let fitted = fit_display_lines(["ÄÖÜäöüßÄÖÜäöüßÄÖÜäöüß", "", "", ""]);
        assert_eq!(fitted[0].chars().count(), 20);
    }

    #[test]
    fn fit_replaces_separator_and_newlines() {
        let fitted = fit_display_lines(["a|b", "c\nd", "", ""]);
        assert_eq!(fitted[0], "a_b");
        assert_eq!(fitted[1], "c d");
    }

    #[test]
    fn stub_entry_shows_uid() {
        let entry = TagEntry::stub(id("a1b2c3d4"));
        assert!(entry.is_stub());
        assert!(!entry.has_command());
        let frame = entry.display_frame();
        assert_eq!(frame.lines[0], "new entry");
        assert_eq!(frame.lines[3], "a1b2c3d4");
        assert_eq!(frame.icon, IconType::None);
    }

    #[test]
    fn display_frame_picks_icon_from_command() {
        let mut entry = TagEntry::stub(id("a1b2c3d4"));
        entry.command = "steam steam://rungameid/570".to_string();
        assert_eq!(entry.display_frame().icon, IconType::Steam);
        assert!(!entry.is_stub());
    }
}
