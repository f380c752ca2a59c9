//! Serde helpers for fixed-size byte arrays rendered as lowercase hex.

use serde::{Deserialize, Deserializer, Serializer, de};

/// Serializes `[u8; N]` as a hex string without prefix.
pub(crate) fn serialize<S: Serializer, const N: usize>(
    bytes: &[u8; N],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// Deserializes `[u8; N]` from a hex string, optionally prefixed with `0x`.
pub(crate) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    let bytes = hex::decode(s).map_err(de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| de::Error::invalid_length(b.len(), &"a fixed-size hex byte string"))
}
