//! DER signature decoding and low-S normalization for secp256k1.
//!
//! Signing cards return ECDSA signatures in DER form:
//!
//! ```text
//! 30 lt 02 lr r_bytes 02 ls s_bytes
//! ```
//!
//! where `lt = 4 + lr + ls`. Each integer is big-endian and may carry one
//! leading `0x00` sign-padding byte (33 bytes) or be shorter than 32 bytes.
//! [`decode_and_normalize`] converts this into a fixed-width
//! [`NormalizedSignature`] and applies the BIP-62 low-S rule.
//!
//! # Example
//!
//! ```
//! use hw_signer_core::crypto::decode_and_normalize;
//!
//! // r = 1, s = 2
//! let der = [0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02];
//! let sig = decode_and_normalize(&der).unwrap();
//! assert_eq!(sig.r()[31], 1);
//! assert_eq!(sig.s()[31], 2);
//! ```

use std::cmp::Ordering;

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1};

use crate::error::{Error, Result};
use crate::signature::NormalizedSignature;

/// The order of the secp256k1 curve.
pub const CURVE_ORDER: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE,
    0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C, 0xD0, 0x36, 0x41, 0x41,
];

/// The order of the secp256k1 curve divided by 2 (rounded down).
pub const HALF_CURVE_ORDER: [u8; 32] = [
    0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x5D, 0x57, 0x6E, 0x73, 0x57, 0xA4, 0x50, 0x1D, 0xDF, 0xE9, 0x2F, 0x46, 0x68, 0x1B, 0x20, 0xA0,
];

/// DER tag for a SEQUENCE.
const TAG_SEQUENCE: u8 = 0x30;

/// DER tag for an INTEGER.
const TAG_INTEGER: u8 = 0x02;

/// Decodes a DER signature and normalizes it to low-S compact form.
///
/// # Errors
///
/// Returns [`Error::MalformedSignature`] when a tag byte is wrong, a length
/// runs past the buffer, the total length disagrees with the component
/// lengths, or an integer does not fit in 32 bytes. No partial output is
/// ever produced.
///
/// # Example
///
/// ```
/// use hw_signer_core::crypto::decode_and_normalize;
///
/// let bad = [0x31, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02];
/// assert!(decode_and_normalize(&bad).is_err());
/// ```
pub fn decode_and_normalize(der: &[u8]) -> Result<NormalizedSignature> {
    let (r, s) = parse_der_signature(der)?;
    if compare_bytes(&s, &CURVE_ORDER) != Ordering::Less {
        return Err(malformed("s is not below the curve order"));
    }
    let (r, s, _) = normalize_s(r, s);
    Ok(NormalizedSignature::new(r, s))
}

/// Parses a DER-encoded ECDSA signature into raw `(r, s)` components.
///
/// Both components are right-aligned into 32-byte big-endian buffers. The
/// total length byte must equal `4 + lr + ls` and match the buffer size.
///
/// # Errors
///
/// Returns [`Error::MalformedSignature`] if the DER encoding is malformed.
///
/// # Example
///
/// ```
/// use hw_signer_core::crypto::parse_der_signature;
///
/// // r carries a sign-padding byte
/// let der = [0x30, 0x07, 0x02, 0x02, 0x00, 0x80, 0x02, 0x01, 0x05];
/// let (r, s) = parse_der_signature(&der).unwrap();
/// assert_eq!(r[31], 0x80);
/// assert_eq!(s[31], 0x05);
/// ```
pub fn parse_der_signature(der: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if byte_at(der, 0)? != TAG_SEQUENCE {
        return Err(malformed("wrong first byte, expected SEQUENCE tag 0x30"));
    }
    let total_len = usize::from(byte_at(der, 1)?);

    if byte_at(der, 2)? != TAG_INTEGER {
        return Err(malformed("r should start with INTEGER tag 0x02"));
    }
    let r_len = usize::from(byte_at(der, 3)?);
    let r_start = 4;
    let r_bytes = slice_at(der, r_start, r_len)?;

    let s_tag = r_start + r_len;
    if byte_at(der, s_tag)? != TAG_INTEGER {
        return Err(malformed("s should start with INTEGER tag 0x02"));
    }
    let s_len = usize::from(byte_at(der, s_tag + 1)?);
    let s_start = s_tag + 2;
    let s_bytes = slice_at(der, s_start, s_len)?;

    if total_len != 4 + r_len + s_len {
        return Err(malformed("total length does not match component lengths"));
    }
    if der.len() != 2 + total_len {
        return Err(malformed("trailing or missing bytes after signature"));
    }

    let r = to_fixed_bytes(r_bytes).map_err(|e| malformed(&format!("r {e}")))?;
    let s = to_fixed_bytes(s_bytes).map_err(|e| malformed(&format!("s {e}")))?;

    Ok((r, s))
}

/// Converts a DER integer body to a right-aligned 32-byte buffer.
fn to_fixed_bytes(bytes: &[u8]) -> core::result::Result<[u8; 32], &'static str> {
    let bytes = match bytes {
        [] => return Err("is empty"),
        [0x00, rest @ ..] if bytes.len() == 33 => rest,
        _ if bytes.len() > 32 => return Err("does not fit in 32 bytes"),
        _ => bytes,
    };

    let mut result = [0u8; 32];
    result[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(result)
}

fn byte_at(der: &[u8], index: usize) -> Result<u8> {
    der.get(index)
        .copied()
        .ok_or_else(|| malformed(&format!("truncated at offset {index}")))
}

fn slice_at(der: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    der.get(start..start + len)
        .ok_or_else(|| malformed(&format!("length {len} at offset {start} overflows buffer")))
}

fn malformed(msg: &str) -> Error {
    Error::MalformedSignature(msg.to_string())
}

/// Normalizes a signature to low-S form.
///
/// Per BIP-62, `s` must be at most half the curve order to prevent
/// signature malleability. A high `s` is replaced by `n - s`.
///
/// # Returns
///
/// A tuple `(r, s, flipped)` where `r` is unchanged, `s` is low-S and
/// `flipped` reports whether `s` was negated.
///
/// # Example
///
/// ```
/// use hw_signer_core::crypto::normalize_s;
///
/// let r = [0u8; 32];
/// let s = [0x80u8; 32];
/// let (_, _, flipped) = normalize_s(r, s);
/// assert!(flipped);
/// ```
#[must_use]
pub fn normalize_s(r: [u8; 32], s: [u8; 32]) -> ([u8; 32], [u8; 32], bool) {
    if compare_bytes(&s, &HALF_CURVE_ORDER) == Ordering::Greater {
        (r, subtract_be(&CURVE_ORDER, &s), true)
    } else {
        (r, s, false)
    }
}

/// Returns `n - s` for a non-zero `s` below the curve order.
#[must_use]
pub fn negate_s(s: &[u8; 32]) -> [u8; 32] {
    subtract_be(&CURVE_ORDER, s)
}

/// Encodes `(r, s)` as a minimal DER signature.
///
/// # Example
///
/// ```
/// use hw_signer_core::crypto::{encode_der_signature, parse_der_signature};
///
/// let mut r = [0u8; 32];
/// r[31] = 1;
/// let s = [0x80u8; 32];
/// let der = encode_der_signature(&r, &s);
/// assert_eq!(parse_der_signature(&der).unwrap(), (r, s));
/// ```
#[must_use]
pub fn encode_der_signature(r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
    let r = der_integer(r);
    let s = der_integer(s);

    let mut der = Vec::with_capacity(6 + r.len() + s.len());
    der.push(TAG_SEQUENCE);
    der.push(byte_len(4 + r.len() + s.len()));
    der.push(TAG_INTEGER);
    der.push(byte_len(r.len()));
    der.extend_from_slice(&r);
    der.push(TAG_INTEGER);
    der.push(byte_len(s.len()));
    der.extend_from_slice(&s);
    der
}

/// Minimal big-endian INTEGER body with sign padding.
fn der_integer(value: &[u8; 32]) -> Vec<u8> {
    let start = value.iter().position(|b| *b != 0).unwrap_or(31);
    let mut body = Vec::with_capacity(33);
    if value[start] & 0x80 != 0 {
        body.push(0x00);
    }
    body.extend_from_slice(&value[start..]);
    body
}

/// Lengths here never exceed 70.
fn byte_len(len: usize) -> u8 {
    u8::try_from(len).unwrap_or(u8::MAX)
}

/// Returns `true` when `s` is at most half the curve order.
#[must_use]
pub fn is_low_s(s: &[u8; 32]) -> bool {
    compare_bytes(s, &HALF_CURVE_ORDER) != Ordering::Greater
}

/// Compares two 32-byte arrays as big-endian integers.
fn compare_bytes(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.iter().cmp(b.iter())
}

/// Computes `a - b` for 32-byte big-endian integers with `a >= b`.
fn subtract_be(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    let mut borrow = 0i16;

    for i in (0..32).rev() {
        let mut diff = i16::from(a[i]) - i16::from(b[i]) - borrow;
        if diff < 0 {
            diff += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        result[i] = diff.to_be_bytes()[1];
    }

    result
}

/// Verifies a normalized signature over a 32-byte digest.
#[must_use]
pub fn verify_signature(
    digest: &[u8; 32],
    signature: &NormalizedSignature,
    public_key: &PublicKey,
) -> bool {
    let Ok(sig) = signature.to_ecdsa() else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&Message::from_digest(*digest), &sig, public_key)
        .is_ok()
}

/// Verifies a DER signature over `SHA256(message)`.
///
/// High-S signatures are accepted; they are normalized before verification.
///
/// # Errors
///
/// Returns [`Error::MalformedSignature`] if the DER cannot be decoded.
pub fn verify_der_over_message(
    message: &[u8],
    der_signature: &[u8],
    public_key: &PublicKey,
) -> Result<bool> {
    let signature = decode_and_normalize(der_signature)?;
    let digest = sha256::Hash::hash(message).to_byte_array();
    Ok(verify_signature(&digest, &signature, public_key))
}

/// Recovers the public key that produced `der_signature` over
/// `SHA256(message)` and whose x-coordinate equals `x_coordinate`.
///
/// Cards that only transmit the x-coordinate of a key also return a
/// signature by that key; the full point follows from ECDSA recovery.
///
/// # Errors
///
/// Returns [`Error::MalformedSignature`] if the DER cannot be decoded, or
/// [`Error::InvalidExtendedKey`] if no recovery id yields a matching key.
pub fn recover_public_key(
    message: &[u8],
    der_signature: &[u8],
    x_coordinate: &[u8; 32],
) -> Result<PublicKey> {
    let signature = decode_and_normalize(der_signature)?;
    let digest = sha256::Hash::hash(message).to_byte_array();
    let msg = Message::from_digest(digest);
    let compact = signature.to_bytes();
    let secp = Secp256k1::verification_only();

    for id in 0..4 {
        let Ok(recovery_id) = RecoveryId::from_i32(id) else {
            continue;
        };
        let Ok(recoverable) = RecoverableSignature::from_compact(&compact, recovery_id) else {
            continue;
        };
        if let Ok(key) = secp.recover_ecdsa(&msg, &recoverable)
            && key.serialize()[1..] == x_coordinate[..]
        {
            return Ok(key);
        }
    }

    Err(Error::InvalidExtendedKey(
        "no recovered key matches the reported x-coordinate".to_string(),
    ))
}
