//! Compact, low-S normalized ECDSA signatures.
//!
//! Signing devices return DER-encoded secp256k1 signatures. Wallet code
//! downstream (PSBT finalization) expects the fixed-width compact form:
//!
//! ```text
//! r (32 bytes, big-endian) || s (32 bytes, big-endian, s <= n/2)
//! ```
//!
//! Use [`crate::crypto::decode_and_normalize`] to build a [`NormalizedSignature`]
//! from device output.
//!
//! # Example
//!
//! ```
//! use hw_signer_core::NormalizedSignature;
//!
//! let sig = NormalizedSignature::from_bytes(&[1u8; 64]).unwrap();
//! assert_eq!(sig.to_hex().len(), 128);
//! ```

use core::fmt;

use bitcoin::secp256k1::ecdsa::Signature as EcdsaSignature;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Error, Result};

/// A 64-byte `r || s` signature with `s` in the lower half of the curve order.
///
/// The low-S invariant is established by [`crate::crypto::decode_and_normalize`];
/// [`NormalizedSignature::from_bytes`] only checks the length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NormalizedSignature {
    /// The R component.
    r: [u8; 32],

    /// The S component, low-S normalized.
    s: [u8; 32],
}

impl NormalizedSignature {
    /// The length of a serialized signature in bytes.
    pub const BYTE_LEN: usize = 64;

    /// Creates a signature from raw components.
    #[must_use]
    pub const fn new(r: [u8; 32], s: [u8; 32]) -> Self {
        Self { r, s }
    }

    /// Creates a signature from a 64-byte `r || s` slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if the slice is not exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::BYTE_LEN {
            return Err(Error::MalformedSignature(format!(
                "expected {} bytes, got {}",
                Self::BYTE_LEN,
                bytes.len()
            )));
        }

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);

        Ok(Self::new(r, s))
    }

    /// Serializes the signature to a 64-byte array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0u8; Self::BYTE_LEN];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    /// Returns the R component.
    #[must_use]
    pub const fn r(&self) -> &[u8; 32] {
        &self.r
    }

    /// Returns the S component.
    #[must_use]
    pub const fn s(&self) -> &[u8; 32] {
        &self.s
    }

    /// Encodes the signature as 128 lowercase hex characters, no prefix.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parses a signature from hex, optionally prefixed with `0x`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HexDecodeFailed`] for invalid hex, or
    /// [`Error::MalformedSignature`] if the decoded bytes are not 64 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        Self::from_bytes(&bytes)
    }

    /// Converts to a `secp256k1` signature for verification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if `r` or `s` is zero or not
    /// below the curve order.
    pub fn to_ecdsa(&self) -> Result<EcdsaSignature> {
        if self.r.iter().all(|b| *b == 0) || self.s.iter().all(|b| *b == 0) {
            return Err(Error::MalformedSignature("r and s must be non-zero".to_string()));
        }
        EcdsaSignature::from_compact(&self.to_bytes())
            .map_err(|e| Error::MalformedSignature(e.to_string()))
    }
}

impl fmt::Display for NormalizedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NormalizedSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NormalizedSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}
