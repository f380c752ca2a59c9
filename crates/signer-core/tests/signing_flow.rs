//! End-to-end card flows against the emulated card.

// Silence unused crate dependency warnings for test binary
use base64 as _;
use hex as _;
#[cfg(feature = "pcsc")]
use pcsc as _;
use serde as _;
use serde_json as _;
use thiserror as _;
use tracing as _;

use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use hw_signer_core::card::{CardCommand, EmulatedCard, Fault, FaultKind};
use hw_signer_core::crypto::{is_low_s, verify_signature};
use hw_signer_core::manage::get_card_details;
use hw_signer_core::path::{compose, validate};
use hw_signer_core::sign::sign_with_card;
use hw_signer_core::{
    CardSession, DerivationPath, Error, Network, SignatureRequest, SignatureRequestBatch,
    SignerConfig, with_session,
};
use pretty_assertions::assert_eq;

const SEED: [u8; 32] = [
    0x9a, 0x1f, 0x3c, 0x77, 0x20, 0x5e, 0x81, 0xd4, 0x0b, 0x6a, 0xc2, 0x19, 0x4f, 0xe3, 0x58,
    0x97, 0x2d, 0x61, 0xbb, 0x0e, 0x73, 0xa5, 0x14, 0xcf, 0x86, 0x3b, 0xf0, 0x42, 0x9d, 0x05,
    0x6e, 0xd8,
];
const PIN: &str = "271828";
const BASE_PATH: &str = "m/48'/0'/0'/2'";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hw_signer_core=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> SignerConfig {
    SignerConfig::default().with_connect_timeout(Duration::from_millis(100))
}

fn batch(len: u32) -> SignatureRequestBatch {
    SignatureRequestBatch(
        (0..len)
            .map(|i| SignatureRequest {
                digest: [u8::try_from(i).unwrap() + 0x10; 32],
                sub_path: format!("0/{i}"),
                input_index: i,
                sighash_type: 1,
                public_key: String::new(),
                signature: None,
            })
            .collect(),
    )
}

#[test]
fn path_grammar() {
    assert!(validate("m/84'/0'/0'").is_ok());
    assert!(validate("84/0/0").is_err());
    assert!(validate("m/84'/0'/0'/").is_ok());

    assert_eq!(
        compose("m/48'/0'/0'/2'", "/0/0").unwrap(),
        compose("m/48'/0'/0'/2'/", "0/0").unwrap()
    );
}

#[test]
fn signatures_verify_against_derived_keys() {
    init_tracing();
    let card = EmulatedCard::new(&SEED, PIN).unwrap().with_high_s(true);
    let journal = card.journal();

    let signed = sign_with_card(card, &config(), None, &batch(3), PIN, BASE_PATH).unwrap();

    let mut reference = EmulatedCard::new(&SEED, PIN).unwrap();
    let keys = with_session(&mut reference, &config(), |session| {
        session.verify_pin(PIN)?;
        signed
            .requests()
            .iter()
            .map(|r| {
                let path: DerivationPath = compose(BASE_PATH, &r.sub_path)?.parse()?;
                session.get_extended_key(&path)
            })
            .collect::<hw_signer_core::Result<Vec<_>>>()
    })
    .unwrap();

    for (request, key) in signed.requests().iter().zip(keys) {
        let signature = request.signature.unwrap();
        let public_key = PublicKey::from_slice(&key.public_key).unwrap();
        assert!(is_low_s(signature.s()));
        assert!(verify_signature(&request.digest, &signature, &public_key));
    }

    assert_eq!(journal.count(CardCommand::SignTransactionHash), 3);
    assert_eq!(journal.count(CardCommand::EndSession), 1);
}

#[test]
fn failing_item_aborts_the_rest() {
    init_tracing();
    let fault = Fault::new(CardCommand::SignTransactionHash, 2, FaultKind::GarbledResponse);
    let card = EmulatedCard::new(&SEED, PIN).unwrap().with_fault(fault);
    let journal = card.journal();
    let requests = batch(3);

    let err = sign_with_card(card, &config(), None, &requests, PIN, BASE_PATH).unwrap_err();

    match err {
        Error::SigningAborted {
            input_index,
            source,
        } => {
            assert_eq!(input_index, 1);
            assert!(matches!(*source, Error::MalformedSignature(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(journal.count(CardCommand::SignTransactionHash), 2);
    assert_eq!(journal.count(CardCommand::GetExtendedKey), 2);
    assert!(requests.requests().iter().all(|r| r.signature.is_none()));
    assert_eq!(journal.count(CardCommand::EndSession), 1);
}

#[test]
fn wrong_device_stops_before_signing() {
    init_tracing();
    let card = EmulatedCard::new(&SEED, PIN).unwrap();
    let journal = card.journal();

    let err = sign_with_card(card, &config(), Some("0badf00d"), &batch(2), PIN, BASE_PATH)
        .unwrap_err();

    assert!(matches!(err, Error::WrongDevice { ref expected, .. } if expected == "0BADF00D"));
    assert_eq!(journal.count(CardCommand::SignTransactionHash), 0);
    assert_eq!(journal.count(CardCommand::GetExtendedKey), 0);
    assert_eq!(journal.count(CardCommand::EndSession), 1);
}

#[test]
fn extended_key_failure_still_ends_session_once() {
    init_tracing();
    let fault = Fault::new(CardCommand::GetExtendedKey, 1, FaultKind::Transport);
    let card = EmulatedCard::new(&SEED, PIN).unwrap().with_fault(fault);
    let journal = card.journal();

    let err = sign_with_card(card, &config(), None, &batch(1), PIN, BASE_PATH).unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(journal.count(CardCommand::EndSession), 1);
}

#[test]
fn wrong_pin_is_not_retried() {
    let card = EmulatedCard::new(&SEED, PIN).unwrap();
    let journal = card.journal();

    let err = sign_with_card(card, &config(), None, &batch(1), "000000", BASE_PATH).unwrap_err();
    assert!(matches!(err, Error::WrongPin { remaining: Some(4) }));
    assert_eq!(journal.count(CardCommand::VerifyPin), 1);
}

#[test]
fn session_end_runs_once_when_dropped_after_end() {
    let card = EmulatedCard::new(&SEED, PIN).unwrap();
    let journal = card.journal();

    let mut session = CardSession::open(card, &config()).unwrap();
    session.verify_pin(PIN).unwrap();
    session.end().unwrap();

    assert_eq!(journal.count(CardCommand::EndSession), 1);
}

#[test]
fn registered_fingerprint_signs_on_testnet() {
    let config = SignerConfig::for_network(Network::Testnet);
    let mut card = EmulatedCard::new(&SEED, PIN).unwrap();

    let details = get_card_details(&mut card, &config, PIN, 0, true).unwrap();
    assert!(details.xpub.starts_with("tpub"));
    assert_eq!(details.derivation_path, "m/48'/1'/0'/2'");

    let signed = sign_with_card(
        &mut card,
        &config,
        Some(&details.master_fingerprint.to_lowercase()),
        &batch(2),
        PIN,
        &details.derivation_path,
    )
    .unwrap();
    assert!(signed.is_fully_signed());
}
