use std::str::FromStr;

use data_encoding::BASE32;

use crate::Error;

/// A 20-byte SHA-1 info-hash.
///
/// Parses both encodings that appear in magnet links and media-app history
/// records: 40 hex characters (any case) or 32 base-32 characters. Always
/// renders as lowercase hex, so comparisons are case-insensitive by
/// construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn new(from: [u8; 20]) -> Self {
        Self(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl FromStr for InfoHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        if s.len() == 40 {
            hex::decode_to_slice(s, &mut out)
                .map_err(|e| Error::InfoHash(format!("bad hex {s:?}: {e}")))?;
            Ok(Self(out))
        } else if s.len() == 32 {
            let decoded = BASE32
                .decode(s.to_ascii_uppercase().as_bytes())
                .map_err(|e| Error::InfoHash(format!("bad base32 {s:?}: {e}")))?;
            out.copy_from_slice(&decoded);
            Ok(Self(out))
        } else {
            Err(Error::InfoHash(format!(
                "expected 40 hex or 32 base32 characters, got {} in {s:?}",
                s.len()
            )))
        }
    }
}
