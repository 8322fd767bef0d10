//! Tag identifiers as reported by the reader (`ON:<uid>` / `OF:<uid>`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hexadecimal UID of an RFID/NFC tag.
///
/// Always stored lowercase. A valid id is non-empty, has an even number of
/// characters and contains only hex digits (one byte per pair).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(String);

/// Errors produced when parsing a [`TagId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagIdError {
    #[error("tag id is empty")]
    Empty,

    #[error("tag id {0:?} is not valid hex")]
    NotHex(String),
}

impl TagId {
    /// Parse and normalise a tag id.
    pub fn parse(raw: &str) -> Result<Self, TagIdError> {
        let normalised = raw.trim().to_ascii_lowercase();
        if normalised.is_empty() {
            return Err(TagIdError::Empty);
        }
        // hex::decode rejects odd lengths as well as non-hex characters.
        hex::decode(&normalised).map_err(|_| TagIdError::NotHex(raw.to_owned()))?;
        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of bytes in the UID (4 for MIFARE Classic, 7 for NTAG).
    pub fn byte_len(&self) -> usize {
        self.0.len() / 2
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TagId {
    type Err = TagIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TagId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for TagId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TagId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
