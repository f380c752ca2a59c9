//! Batch signing.
//!
//! A [`SignatureRequestBatch`] lists the digests a wallet needs signed, one
//! per transaction input, each with the key's path relative to the account.
//! [`sign_batch`] signs them strictly in order on one card session:
//!
//! 1. select the applet and verify the PIN
//! 2. if a fingerprint was given, compare it with the card's and stop on a
//!    mismatch before anything is signed
//! 3. for each request: derive the key at `base_path/sub_path`, sign the
//!    digest with it, normalize the DER signature to 64 low-S bytes
//!
//! The first failing request aborts the batch with
//! [`Error::SigningAborted`]. The caller's batch is never modified; a signed
//! copy is returned only when every request succeeded.

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::card::SignerCard;
use crate::card::satochip::LAST_DERIVED_KEY;
use crate::config::SignerConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::path::{self, DerivationPath};
use crate::session::{CardSession, with_session};
use crate::signature::NormalizedSignature;

/// One digest to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    /// Sighash digest to sign.
    #[serde(with = "crate::hex_serde")]
    pub digest: [u8; 32],

    /// Key path relative to the account path, e.g. `0/5`.
    pub sub_path: String,

    /// Index of the transaction input this signature is for.
    pub input_index: u32,

    /// Sighash type byte the digest commits to.
    pub sighash_type: u8,

    /// Public key the wallet expects to sign with, in hex.
    pub public_key: String,

    /// The signature, filled in by signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<NormalizedSignature>,
}

/// An ordered list of signature requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureRequestBatch(pub Vec<SignatureRequest>);

impl SignatureRequestBatch {
    /// Returns the requests.
    #[must_use]
    pub fn requests(&self) -> &[SignatureRequest] {
        &self.0
    }

    /// Returns `true` when every request carries a signature.
    #[must_use]
    pub fn is_fully_signed(&self) -> bool {
        self.0.iter().all(|r| r.signature.is_some())
    }

    /// Parses a batch from its JSON array form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the batch to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Returns the fingerprint to check against, or `None` when `expected` is
/// absent or blank.
#[must_use]
pub fn requested_fingerprint(expected: Option<&str>) -> Option<&str> {
    expected.map(str::trim).filter(|fp| !fp.is_empty())
}

/// Fails with [`Error::WrongDevice`] unless `actual` matches `expected`
/// (ignoring case). `None` or a blank string accepts any device.
///
/// # Errors
///
/// Returns [`Error::WrongDevice`] on mismatch.
pub fn ensure_device(expected: Option<&str>, actual: Fingerprint) -> Result<()> {
    match requested_fingerprint(expected) {
        Some(expected) if !actual.matches(expected) => Err(Error::WrongDevice {
            expected: expected.to_uppercase(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Signs every request in `batch` on an open session.
///
/// # Arguments
///
/// * `session` - An open card session
/// * `card_fingerprint` - Fingerprint of the card the wallet expects, if any
/// * `batch` - Requests to sign; none may carry a signature yet
/// * `pin` - Card PIN
/// * `base_path` - Account derivation path the sub-paths are relative to
///
/// # Errors
///
/// - PIN and transport errors from the initial verification
/// - [`Error::WrongDevice`] if the fingerprint does not match
/// - [`Error::SignatureSlotFilled`] if a request is already signed
/// - [`Error::SigningAborted`] wrapping the first per-request failure
#[instrument(skip_all, fields(requests = batch.0.len()))]
pub fn sign_batch<C: SignerCard>(
    session: &mut CardSession<C>,
    card_fingerprint: Option<&str>,
    batch: &SignatureRequestBatch,
    pin: &str,
    base_path: &str,
) -> Result<SignatureRequestBatch> {
    session.select_applet()?;
    session.verify_pin(pin)?;

    if requested_fingerprint(card_fingerprint).is_some() {
        let actual = session.get_master_xfp()?;
        ensure_device(card_fingerprint, actual)?;
    }

    if let Some(filled) = batch.0.iter().find(|r| r.signature.is_some()) {
        return Err(Error::SignatureSlotFilled(filled.input_index));
    }

    let mut signed = batch.clone();
    for request in &mut signed.0 {
        let signature =
            sign_request(session, pin, base_path, request).map_err(|source| {
                Error::SigningAborted {
                    input_index: request.input_index,
                    source: Box::new(source),
                }
            })?;
        request.signature = Some(signature);
    }

    info!(requests = signed.0.len(), "signed batch");
    Ok(signed)
}

fn sign_request<C: SignerCard>(
    session: &mut CardSession<C>,
    pin: &str,
    base_path: &str,
    request: &SignatureRequest,
) -> Result<NormalizedSignature> {
    let key_path: DerivationPath = path::compose(base_path, &request.sub_path)?.parse()?;

    if session.config().reverify_pin_per_key {
        session.verify_pin(pin)?;
    }
    let key = session.get_extended_key(&key_path)?;
    let der = session.sign_transaction_hash(LAST_DERIVED_KEY, &request.digest)?;
    let signature = crypto::decode_and_normalize(&der)?;

    if session.config().verify_signatures {
        let public_key = PublicKey::from_slice(&key.public_key)
            .map_err(|e| Error::InvalidExtendedKey(e.to_string()))?;
        if !crypto::verify_signature(&request.digest, &signature, &public_key) {
            return Err(Error::SignatureMismatch(request.input_index));
        }
    }

    debug!(input = request.input_index, path = %key_path, "signed input");
    Ok(signature)
}

/// Opens a session on `card`, signs `batch` and ends the session.
///
/// # Errors
///
/// See [`sign_batch`]. Session-open errors are returned as-is.
pub fn sign_with_card<C: SignerCard>(
    card: C,
    config: &SignerConfig,
    card_fingerprint: Option<&str>,
    batch: &SignatureRequestBatch,
    pin: &str,
    base_path: &str,
) -> Result<SignatureRequestBatch> {
    with_session(card, config, |session| {
        sign_batch(session, card_fingerprint, batch, pin, base_path)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::card::{CardCommand, EmulatedCard};

    const SEED: [u8; 32] = [0x33; 32];
    const BASE: &str = "m/84'/0'/0'";

    fn request(index: u32, sub_path: &str) -> SignatureRequest {
        SignatureRequest {
            digest: [u8::try_from(index).unwrap() + 1; 32],
            sub_path: sub_path.to_string(),
            input_index: index,
            sighash_type: 1,
            public_key: String::new(),
            signature: None,
        }
    }

    #[test]
    fn signs_in_order() {
        let card = EmulatedCard::new(&SEED, "1234").unwrap().with_high_s(true);
        let journal = card.journal();
        let batch = SignatureRequestBatch(vec![request(0, "0/0"), request(1, "/1/3")]);
        let config = SignerConfig::default().with_signature_verification(true);

        let signed = sign_with_card(card, &config, None, &batch, "1234", BASE).unwrap();

        assert!(signed.is_fully_signed());
        assert!(!batch.is_fully_signed());
        for request in signed.requests() {
            let signature = request.signature.unwrap();
            assert!(crypto::is_low_s(signature.s()));
        }
        assert_eq!(journal.count(CardCommand::SignTransactionHash), 2);
        assert_eq!(journal.count(CardCommand::GetMasterXfp), 0);
    }

    #[test]
    fn rejects_filled_slots() {
        let card = EmulatedCard::new(&SEED, "1234").unwrap();
        let mut filled = request(4, "0/0");
        filled.signature = Some(NormalizedSignature::new([1; 32], [1; 32]));
        let batch = SignatureRequestBatch(vec![request(3, "0/1"), filled]);

        let err =
            sign_with_card(card, &SignerConfig::default(), None, &batch, "1234", BASE).unwrap_err();
        assert!(matches!(err, Error::SignatureSlotFilled(4)));
    }

    #[test]
    fn bad_sub_path_aborts() {
        let card = EmulatedCard::new(&SEED, "1234").unwrap();
        let batch = SignatureRequestBatch(vec![request(0, "0/x")]);

        let err =
            sign_with_card(card, &SignerConfig::default(), None, &batch, "1234", BASE).unwrap_err();
        match err {
            Error::SigningAborted {
                input_index,
                source,
            } => {
                assert_eq!(input_index, 0);
                assert!(matches!(*source, Error::InvalidPath(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fingerprint_compare_ignores_case() {
        let card = EmulatedCard::new(&SEED, "1234").unwrap();
        let expected = card.master_fingerprint().unwrap().to_string().to_lowercase();
        let batch = SignatureRequestBatch(vec![request(0, "0/0")]);

        let signed = sign_with_card(
            card,
            &SignerConfig::default(),
            Some(&expected),
            &batch,
            "1234",
            BASE,
        )
        .unwrap();
        assert!(signed.is_fully_signed());
    }

    #[test]
    fn ensure_device_reports_both() {
        let actual = Fingerprint::new([0xAB, 0xCD, 0xEF, 0x01]);
        assert!(ensure_device(None, actual).is_ok());
        assert!(ensure_device(Some("abcdef01"), actual).is_ok());

        assert!(ensure_device(Some(" abcdef01 "), actual).is_ok());

        let err = ensure_device(Some("deadbeef"), actual).unwrap_err();
        assert!(matches!(
            err,
            Error::WrongDevice { ref expected, ref actual }
                if expected == "DEADBEEF" && actual == "ABCDEF01"
        ));
    }

    #[test]
    fn blank_fingerprint_skips_the_check() {
        let actual = Fingerprint::new([0xAB, 0xCD, 0xEF, 0x01]);
        for blank in ["", "   ", "\t"] {
            assert_eq!(requested_fingerprint(Some(blank)), None);
            assert!(ensure_device(Some(blank), actual).is_ok());
        }
        assert_eq!(requested_fingerprint(Some(" 0badf00d ")), Some("0badf00d"));

        let card = EmulatedCard::new(&[0x42; 32], "1234").unwrap();
        let journal = card.journal();
        let batch = SignatureRequestBatch(vec![SignatureRequest {
            digest: [0x01; 32],
            sub_path: "0/0".to_string(),
            input_index: 0,
            sighash_type: 1,
            public_key: String::new(),
            signature: None,
        }]);
        let signed = sign_with_card(
            card,
            &SignerConfig::default(),
            Some(""),
            &batch,
            "1234",
            "m/84'/0'/0'",
        )
        .unwrap();
        assert!(signed.is_fully_signed());
        assert_eq!(journal.count(CardCommand::GetMasterXfp), 0);
    }

    #[test]
    fn batch_json_shape() {
        let json = r#"[{
            "digest": "0101010101010101010101010101010101010101010101010101010101010101",
            "subPath": "0/0",
            "inputIndex": 2,
            "sighashType": 1,
            "publicKey": "02aa"
        }]"#;
        let batch = SignatureRequestBatch::from_json(json).unwrap();
        assert_eq!(batch.requests()[0].input_index, 2);
        assert!(batch.requests()[0].signature.is_none());
        assert!(!batch.to_json().unwrap().contains("signature"));
    }
}
