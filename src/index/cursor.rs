//! Opaque pagination cursors.
//!
//! A cursor encodes `(sort_key, last_id)` plus a schema version and the
//! index instance epoch. Callers must treat the token as opaque; decoding a
//! token from a different schema version or a previous index instance fails
//! with `InvalidCursor`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use super::IndexError;

const CURSOR_VERSION: u32 = 1;

/// Decoded cursor state. `sort_key` is the ordering key of the last item of
/// the previous page (empty for plain lexicographic listings); `last_id` is
/// that item's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "v")]
    version: u32,
    #[serde(rename = "e")]
    epoch: String,
    #[serde(rename = "k")]
    pub sort_key: String,
    #[serde(rename = "l")]
    pub last_id: String,
}

impl Cursor {
    pub fn new(epoch: &str, sort_key: impl Into<String>, last_id: impl Into<String>) -> Self {
        Self {
            version: CURSOR_VERSION,
            epoch: epoch.to_string(),
            sort_key: sort_key.into(),
            last_id: last_id.into(),
        }
    }

    pub fn encode(&self) -> String {
        // Serialization of a plain struct cannot fail.
        let json = serde_json::to_vec(self).expect("cursor serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode and validate a cursor against the current index epoch.
    pub fn decode(token: &str, epoch: &str) -> Result<Self, IndexError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| IndexError::InvalidCursor)?;
        let cursor: Cursor =
            serde_json::from_slice(&bytes).map_err(|_| IndexError::InvalidCursor)?;
        if cursor.version != CURSOR_VERSION || cursor.epoch != epoch {
            return Err(IndexError::InvalidCursor);
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let c = Cursor::new("epoch-1", "3fd5a2b1", "ns:tool");
        let decoded = Cursor::decode(&c.encode(), "epoch-1").unwrap();
        assert_eq!(decoded, c);
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(matches!(
            Cursor::decode("not base64 at all!!", "e"),
            Err(IndexError::InvalidCursor)
        ));
        let valid_b64 = URL_SAFE_NO_PAD.encode(b"{\"not\": \"a cursor\"}");
        assert!(matches!(
            Cursor::decode(&valid_b64, "e"),
            Err(IndexError::InvalidCursor)
        ));
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let c = Cursor::new("old-epoch", "", "ns:a");
        assert!(matches!(
            Cursor::decode(&c.encode(), "new-epoch"),
            Err(IndexError::InvalidCursor)
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut c = Cursor::new("e", "", "ns:a");
        c.version = 99;
        assert!(matches!(
            Cursor::decode(&c.encode(), "e"),
            Err(IndexError::InvalidCursor)
        ));
    }
}
