//! Master key fingerprints.
//!
//! A fingerprint is the first four bytes of `HASH160` of the root compressed
//! public key. It identifies "the same physical device" across sessions and
//! is rendered as eight uppercase hex digits.

use core::fmt;
use core::str::FromStr;

use bitcoin::hashes::{Hash, hash160};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Error, Result};

/// A 4-byte BIP32 master key fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 4]);

impl Fingerprint {
    /// Creates a fingerprint from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Computes the fingerprint of a compressed SEC1 public key.
    ///
    /// # Example
    ///
    /// ```
    /// use hw_signer_core::Fingerprint;
    ///
    /// let fp = Fingerprint::from_public_key(&[0x02; 33]);
    /// assert_eq!(fp.to_string().len(), 8);
    /// ```
    #[must_use]
    pub fn from_public_key(compressed: &[u8; 33]) -> Self {
        let digest = hash160::Hash::hash(compressed).to_byte_array();
        Self([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Creates a fingerprint from the integer form some SDKs report.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0
    }

    /// Compares against a caller-supplied hex fingerprint, ignoring case.
    ///
    /// # Example
    ///
    /// ```
    /// use hw_signer_core::Fingerprint;
    ///
    /// let fp = Fingerprint::new([0xDE, 0xAD, 0xBE, 0xEF]);
    /// assert!(fp.matches("deadbeef"));
    /// assert!(!fp.matches("DEADBEE0"));
    /// ```
    #[must_use]
    pub fn matches(self, expected: &str) -> bool {
        self.to_string().eq_ignore_ascii_case(expected.trim())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let bytes: [u8; 4] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::MalformedResponse(format!("fingerprint must be 4 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 4]> for Fingerprint {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
