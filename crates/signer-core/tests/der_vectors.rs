//! DER decoding and low-S normalization against real secp256k1 signatures.
//!
//! Signatures are produced by libsecp256k1, serialized with its own DER
//! encoder, and optionally rewritten to the high-S form some cards emit.

// Silence unused crate dependency warnings for test binary
use base64 as _;
use hex as _;
#[cfg(feature = "pcsc")]
use pcsc as _;
use serde as _;
use serde_json as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use hw_signer_core::crypto::{
    CURVE_ORDER, HALF_CURVE_ORDER, decode_and_normalize, encode_der_signature, is_low_s, negate_s,
    verify_signature,
};
use hw_signer_core::{Error, NormalizedSignature};
use pretty_assertions::assert_eq;

fn keypair() -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[0x5C; 32]).unwrap();
    (secret, PublicKey::from_secret_key(&secp, &secret))
}

fn digest(i: u32) -> [u8; 32] {
    sha256::Hash::hash(&i.to_be_bytes()).to_byte_array()
}

/// Signs `digest` and returns `(der, r, s)` with `s` low.
fn sign(secret: &SecretKey, digest: [u8; 32]) -> (Vec<u8>, [u8; 32], [u8; 32]) {
    let secp = Secp256k1::signing_only();
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    let compact = signature.serialize_compact();

    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&compact[..32]);
    s.copy_from_slice(&compact[32..]);
    (signature.serialize_der().to_vec(), r, s)
}

#[test]
fn libsecp_der_decodes_to_compact() {
    let (secret, public) = keypair();

    for i in 0..64 {
        let digest = digest(i);
        let (der, r, s) = sign(&secret, digest);

        let normalized = decode_and_normalize(&der).unwrap();
        assert_eq!(normalized, NormalizedSignature::new(r, s), "digest {i}");
        assert!(verify_signature(&digest, &normalized, &public));
    }
}

#[test]
fn high_s_is_flipped_to_order_minus_s() {
    let (secret, public) = keypair();

    for i in 0..64 {
        let digest = digest(i);
        let (_, r, s) = sign(&secret, digest);
        let high = negate_s(&s);
        assert!(!is_low_s(&high));

        let der = encode_der_signature(&r, &high);
        let normalized = decode_and_normalize(&der).unwrap();

        assert_eq!(normalized.s(), &negate_s(&high));
        assert_eq!(normalized.s(), &s);
        assert!(verify_signature(&digest, &normalized, &public));
    }
}

#[test]
fn component_lengths_thirty_to_thirty_three() {
    let (secret, _) = keypair();
    let (_, r, s) = sign(&secret, digest(7));

    // 30 raw bytes: two leading zero bytes are dropped by minimal DER.
    let mut short = r;
    short[0] = 0;
    short[1] = 0;
    short[2] = 0x11;
    // 31 raw bytes.
    let mut shorter_s = s;
    shorter_s[0] = 0;
    shorter_s[1] = 0x22;
    // 33 raw bytes: a high first bit forces a sign-padding byte.
    let mut padded = r;
    padded[0] = 0xF0;

    for (r, s, r_len, s_len) in [
        (short, s, 30, None),
        (r, shorter_s, 0, Some(31)),
        (padded, s, 33, None),
        (padded, shorter_s, 33, Some(31)),
    ] {
        let der = encode_der_signature(&r, &s);
        if r_len > 0 {
            assert_eq!(usize::from(der[3]), r_len);
        }
        if let Some(s_len) = s_len {
            let s_offset = 4 + usize::from(der[3]);
            assert_eq!(usize::from(der[s_offset + 1]), s_len);
        }

        let normalized = decode_and_normalize(&der).unwrap();
        assert_eq!(normalized.to_bytes().len(), 64);
        assert_eq!(normalized.r(), &r);
        assert_eq!(normalized.s(), &s);
        assert!(is_low_s(normalized.s()));
    }
}

#[test]
fn low_s_round_trip_is_identity() {
    let r = [0x42; 32];
    let s = HALF_CURVE_ORDER;
    let normalized = decode_and_normalize(&encode_der_signature(&r, &s)).unwrap();
    assert_eq!(normalized, NormalizedSignature::new(r, s));
}

#[test]
fn output_is_always_low_s() {
    let r = [0x01; 32];
    let mut s = CURVE_ORDER;
    for step in 1..=32u8 {
        s[31] = CURVE_ORDER[31] - step;
        let normalized = decode_and_normalize(&encode_der_signature(&r, &s)).unwrap();
        assert!(is_low_s(normalized.s()));
        assert_eq!(normalized.s()[31], step);
    }
}

#[test]
fn malformed_first_byte_never_decodes() {
    let (secret, _) = keypair();
    let (der, _, _) = sign(&secret, digest(1));

    for tag in [0x00, 0x02, 0x31, 0xFF] {
        let mut bad = der.clone();
        bad[0] = tag;
        assert!(matches!(
            decode_and_normalize(&bad),
            Err(Error::MalformedSignature(_))
        ));
    }
}

#[test]
fn truncated_signatures_never_decode() {
    let (secret, _) = keypair();
    let (der, _, _) = sign(&secret, digest(2));

    for len in 0..der.len() {
        assert!(
            matches!(
                decode_and_normalize(&der[..len]),
                Err(Error::MalformedSignature(_))
            ),
            "prefix of length {len} decoded"
        );
    }
}
