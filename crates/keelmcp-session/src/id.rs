//! Session identifiers.
//!
//! A session id is the 22-character base62 encoding of a version-4 UUID:
//! `[0-9A-Za-z]{22}`, no hyphens. The encoding is fixed-width (128 bits
//! always fits in 22 base62 digits), so ids sort and validate bytewise.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Session id length in characters.
pub const SESSION_ID_LEN: usize = 22;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Opaque identifier of one MCP session.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from a random v4 UUID.
    pub fn generate() -> Self {
        Self(encode_base62(Uuid::new_v4().as_u128()))
    }

    /// Validate and wrap an existing id string.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidSessionId`] unless the input is exactly
    /// 22 ASCII alphanumeric characters.
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        if s.len() == SESSION_ID_LEN && s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(s.to_string()))
        } else {
            Err(SessionError::InvalidSessionId(s.to_string()))
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The durable-backend filename for this session.
    pub fn filename(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Recover an id from a durable-backend filename.
    ///
    /// Returns `None` unless the name is `<id>.json` with a valid id.
    pub fn from_filename(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        Self::parse(stem).ok()
    }
}

fn encode_base62(mut value: u128) -> String {
    let mut out = [b'0'; SESSION_ID_LEN];
    let mut index = SESSION_ID_LEN;
    while value > 0 {
        index -= 1;
        out[index] = ALPHABET[(value % 62) as usize];
        value /= 62;
    }
    // Leading positions stay '0' for small values, keeping the width fixed.
    String::from_utf8_lossy(&out).into_owned()
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_match_the_format() {
        for _ in 0..100 {
            let id = SessionId::generate();
            assert_eq!(id.as_str().len(), SESSION_ID_LEN);
            assert!(id.as_str().bytes().all(|b| b.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        use std::collections::HashSet;
        let ids: HashSet<String> = (0..1000)
            .map(|_| SessionId::generate().as_str().to_string())
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(SessionId::parse("short").is_err());
        assert!(SessionId::parse(&"a".repeat(23)).is_err());
        assert!(SessionId::parse(&"a".repeat(22)).is_ok());
        assert!(SessionId::parse("abcdefghij-lmnopqrstuv").is_err());
    }

    #[test]
    fn filename_round_trip() {
        let id = SessionId::generate();
        let name = id.filename();
        assert_eq!(SessionId::from_filename(&name), Some(id));
        assert_eq!(SessionId::from_filename("nope.json"), None);
        assert_eq!(SessionId::from_filename("missing-extension"), None);
    }

    #[test]
    fn encoding_is_fixed_width() {
        assert_eq!(encode_base62(0), "0".repeat(22));
        assert_eq!(encode_base62(61).chars().last(), Some('z'));
        assert_eq!(encode_base62(62).len(), 22);
        // The largest v4 UUID value still fits in 22 digits.
        assert_eq!(encode_base62(u128::MAX).len(), 22);
    }

    #[test]
    fn serde_round_trip_validates() {
        let id = SessionId::generate();
        let wire = serde_json::to_string(&id).unwrap();
        let back: SessionId = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<SessionId>("\"not an id\"").is_err());
    }
}
