//! Fixed-size byte buffers.

use std::{fmt, str};

use borsh::{BorshDeserialize, BorshSerialize};

/// A 32-byte buffer used for block hashes, merkle roots, checksums and key
/// identities.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Buf32([u8; 32]);

impl Buf32 {
    /// Creates a buffer from a raw array.
    pub const fn new(data: [u8; 32]) -> Self {
        Self(data)
    }

    /// The all-zeroes buffer.
    pub const fn zero() -> Self {
        Self([0; 32])
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn into_inner(self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for Buf32 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<Buf32> for [u8; 32] {
    fn from(value: Buf32) -> Self {
        value.0
    }
}

impl AsRef<[u8]> for Buf32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Buf32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for Buf32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form for logs, full form available via Debug.
        let h = hex::encode(self.0);
        write!(f, "{}..{}", &h[..8], &h[56..])
    }
}

/// Error parsing a [`Buf32`] from a hex string.
#[derive(Debug, thiserror::Error)]
#[error("invalid 32-byte hex string")]
pub struct ParseBufError;

impl str::FromStr for Buf32 {
    type Err = ParseBufError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|_| ParseBufError)?;
        Ok(Self(out))
    }
}

impl serde::Serialize for Buf32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for Buf32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let mut raw = [0u8; 32];
        raw[0] = 0xde;
        raw[31] = 0xad;
        let buf = Buf32::new(raw);

        let s = format!("{buf:?}");
        let parsed: Buf32 = s.parse().unwrap();
        assert_eq!(parsed, buf);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let buf = Buf32::new([7u8; 32]);
        let json = serde_json::to_string(&buf).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(32)));

        let back: Buf32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, buf);
    }

    #[test]
    fn test_zero() {
        assert!(Buf32::zero().is_zero());
        assert!(!Buf32::new([1u8; 32]).is_zero());
    }

    #[test]
    fn test_parse_rejects_bad_len() {
        assert!("abcd".parse::<Buf32>().is_err());
    }
}
