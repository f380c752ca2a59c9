//! Satochip applet client.
//!
//! [`SatochipCard`] speaks the Satochip APDU protocol (class byte `0xB0`)
//! over any [`Transport`]. The applet is selected lazily before the first
//! command, so callers only need [`SignerCard::select_applet`] when they
//! want applet absence reported early.
//!
//! # Extended keys
//!
//! `GET_EXTENDED_KEY` returns only the x-coordinate of the derived public
//! key together with a signature by that key:
//!
//! ```text
//! chain_code (32) || size (2) || x (size) || sig_size (2) || DER sig
//! ```
//!
//! The full point is recovered from the signature over
//! `SHA256(chain_code || size || x)`.

use core::fmt;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::rand::{RngCore, thread_rng};
use tracing::{debug, trace, warn};

use super::apdu::Apdu;
use super::{AuthenticityCheck, CardCommand, CardStatus, ExtendedKey, SignerCard, Transport};
use crate::crypto;
use crate::error::{Error, Result};
use crate::path::DerivationPath;

/// The Satochip applet AID.
const SATOCHIP_AID: &[u8] = b"SatoChip";

/// Class byte of Satochip commands.
const CLA: u8 = 0xB0;

/// Key slot selecting the last key derived with `GET_EXTENDED_KEY`.
pub const LAST_DERIVED_KEY: u8 = 0xFF;

/// Satochip instruction codes.
mod ins {
    pub(super) const SELECT: u8 = 0xA4;
    pub(super) const SETUP: u8 = 0x2A;
    pub(super) const GET_STATUS: u8 = 0x3C;
    pub(super) const VERIFY_PIN: u8 = 0x42;
    pub(super) const CHANGE_PIN: u8 = 0x44;
    pub(super) const IMPORT_SEED: u8 = 0x6C;
    pub(super) const GET_EXTENDED_KEY: u8 = 0x6D;
    pub(super) const RESET_SEED: u8 = 0x77;
    pub(super) const SIGN_TRANSACTION_HASH: u8 = 0x7A;
    pub(super) const EXPORT_PKI_PUBKEY: u8 = 0x98;
    pub(super) const EXPORT_PKI_CERTIFICATE: u8 = 0x99;
    pub(super) const CHALLENGE_RESPONSE_PKI: u8 = 0x9A;
}

/// Longest PIN the applet accepts.
const MAX_PIN_LEN: usize = 16;

/// Accepted seed lengths in bytes.
const SEED_LEN: core::ops::RangeInclusive<usize> = 16..=64;

/// Deepest path the applet derives.
const MAX_DEPTH: usize = 10;

/// `GET_EXTENDED_KEY` option flags: use the derivation cache.
const BIP32_OPTION_FLAGS: u8 = 0x40;

/// Transport PIN replaced during setup.
const DEFAULT_PIN: &[u8] = b"Muscle00";

/// Length of the random PUK and secondary PIN generated during setup.
const SETUP_SECRET_LEN: usize = 16;

/// Secure memory slots reserved during setup.
const SETUP_SECMEM_SIZE: u16 = 32;

/// `EXPORT_PKI_CERTIFICATE` chunk size.
const CERT_CHUNK: usize = 128;

/// `EXPORT_PKI_CERTIFICATE` sub-operations.
const CERT_OP_INIT: u8 = 0x01;
const CERT_OP_UPDATE: u8 = 0x02;

/// Prefix of the challenge-response message.
const CHALLENGE_PREFIX: &[u8] = b"Challenge:";

/// Status word of `GET_STATUS` on a card without a PIN.
const SW_SETUP_NOT_DONE: u16 = 0x9C04;

/// Validates a card certificate against the card's PKI public key.
pub trait CertificateVerifier {
    /// Checks `certificate` (DER) for the card whose PKI key is `card_key`.
    fn verify(&self, certificate: &[u8], card_key: &PublicKey) -> AuthenticityCheck;
}

/// Accepts a certificate that embeds the card's uncompressed PKI key.
///
/// Chain validation against the manufacturer's roots needs a verifier
/// that carries those roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedKeyVerifier;

impl CertificateVerifier for EmbeddedKeyVerifier {
    fn verify(&self, certificate: &[u8], card_key: &PublicKey) -> AuthenticityCheck {
        let point = card_key.serialize_uncompressed();
        if certificate.windows(point.len()).any(|w| w == point) {
            AuthenticityCheck::valid("certificate matches the card key")
        } else {
            AuthenticityCheck::invalid("certificate does not match the card key")
        }
    }
}

/// A Satochip card reached through a [`Transport`].
pub struct SatochipCard<T: Transport> {
    /// The underlying transport.
    transport: T,

    /// Certificate check used for authenticity.
    verifier: Box<dyn CertificateVerifier>,

    /// Whether the applet has been selected since power-up.
    selected: bool,
}

impl<T: Transport> fmt::Debug for SatochipCard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SatochipCard")
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> SatochipCard<T> {
    /// Creates a client with the [`EmbeddedKeyVerifier`].
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_verifier(transport, EmbeddedKeyVerifier)
    }

    /// Creates a client with a custom certificate verifier.
    #[must_use]
    pub fn with_verifier(transport: T, verifier: impl CertificateVerifier + 'static) -> Self {
        Self {
            transport,
            verifier: Box::new(verifier),
            selected: false,
        }
    }

    /// Returns the underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Consumes the client and returns the transport.
    #[must_use]
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Sends one APDU and returns the data of a successful response.
    fn exchange(&mut self, command: CardCommand, apdu: &Apdu) -> Result<Vec<u8>> {
        if !self.selected {
            self.select_applet()?;
        }
        trace!(%command, ins = apdu.ins(), p1 = apdu.p1(), "sending APDU");
        let response = self.transport.transmit(apdu)?;
        let sw = format!("{:04X}", response.status_word());
        debug!(%command, %sw, len = response.data().len(), "card responded");
        response.into_checked_data()
    }

    /// Reads the card's PKI public key.
    fn export_pki_pubkey(&mut self) -> Result<PublicKey> {
        let apdu = Apdu::new(CLA, ins::EXPORT_PKI_PUBKEY, 0x00, 0x00, vec![]);
        let data = self.exchange(CardCommand::VerifyCertificateChain, &apdu)?;
        let point = data
            .get(..65)
            .ok_or_else(|| Error::MalformedResponse("PKI public key too short".to_string()))?;
        PublicKey::from_slice(point).map_err(|e| Error::MalformedResponse(e.to_string()))
    }

    /// Reads the card certificate in chunks.
    fn export_pki_certificate(&mut self) -> Result<Vec<u8>> {
        let apdu = Apdu::new(CLA, ins::EXPORT_PKI_CERTIFICATE, CERT_OP_INIT, 0x00, vec![]);
        let data = self.exchange(CardCommand::VerifyCertificateChain, &apdu)?;
        let size = read_u16(&data, 0)?;

        let mut certificate = Vec::with_capacity(size);
        while certificate.len() < size {
            let offset = u16::try_from(certificate.len())
                .map_err(|_| Error::MalformedResponse("certificate too large".to_string()))?;
            let chunk = (size - certificate.len()).min(CERT_CHUNK);
            let [hi, lo] = offset.to_be_bytes();
            let apdu = Apdu::new(
                CLA,
                ins::EXPORT_PKI_CERTIFICATE,
                CERT_OP_UPDATE,
                0x00,
                vec![hi, lo, len_u8(chunk)?],
            );
            let part = self.exchange(CardCommand::VerifyCertificateChain, &apdu)?;
            if part.len() != chunk {
                return Err(Error::MalformedResponse(format!(
                    "certificate chunk at {offset}: expected {chunk} bytes, got {}",
                    part.len()
                )));
            }
            certificate.extend_from_slice(&part);
        }

        Ok(certificate)
    }
}

impl<T: Transport> SignerCard for SatochipCard<T> {
    fn power_up(&mut self, timeout: Duration) -> Result<()> {
        self.selected = false;
        self.transport.wait_for_card(timeout)
    }

    fn get_status(&mut self) -> Result<CardStatus> {
        if !self.selected {
            self.select_applet()?;
        }
        let apdu = Apdu::new(CLA, ins::GET_STATUS, 0x00, 0x00, vec![]);
        let response = self.transport.transmit(&apdu)?;
        if response.status_word() == SW_SETUP_NOT_DONE {
            debug!("card reports setup not done");
            return Ok(CardStatus::not_setup());
        }
        parse_status(&response.into_checked_data()?)
    }

    fn verify_pin(&mut self, slot: u8, pin: &str) -> Result<()> {
        let pin = check_pin(pin)?;
        let apdu = Apdu::new(CLA, ins::VERIFY_PIN, slot, 0x00, pin.to_vec());
        self.exchange(CardCommand::VerifyPin, &apdu).map(drop)
    }

    fn select_applet(&mut self) -> Result<()> {
        let apdu = Apdu::new(0x00, ins::SELECT, 0x04, 0x00, SATOCHIP_AID.to_vec());
        let response = self.transport.transmit(&apdu)?;
        let sw = format!("{:04X}", response.status_word());
        debug!(%sw, "select applet");
        response.check()?;
        self.selected = true;
        Ok(())
    }

    fn get_extended_key(&mut self, path: &DerivationPath) -> Result<ExtendedKey> {
        if path.depth() > MAX_DEPTH {
            return Err(Error::InvalidPath(format!(
                "{path} is deeper than {MAX_DEPTH} steps"
            )));
        }
        let apdu = Apdu::new(
            CLA,
            ins::GET_EXTENDED_KEY,
            len_u8(path.depth())?,
            BIP32_OPTION_FLAGS,
            path.to_bytes(),
        );
        let data = self.exchange(CardCommand::GetExtendedKey, &apdu)?;
        parse_extended_key(&data)
    }

    fn sign_transaction_hash(&mut self, key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let apdu = Apdu::new(
            CLA,
            ins::SIGN_TRANSACTION_HASH,
            key_slot,
            0x00,
            digest.to_vec(),
        );
        let der = self.exchange(CardCommand::SignTransactionHash, &apdu)?;
        if der.is_empty() {
            return Err(Error::MalformedResponse("empty signature".to_string()));
        }
        Ok(der)
    }

    fn setup(&mut self, pin: &str, max_retries: u8) -> Result<()> {
        let pin = check_pin(pin)?;
        let mut rng = thread_rng();
        let mut puk0 = [0u8; SETUP_SECRET_LEN];
        let mut pin1 = [0u8; SETUP_SECRET_LEN];
        let mut puk1 = [0u8; SETUP_SECRET_LEN];
        rng.fill_bytes(&mut puk0);
        rng.fill_bytes(&mut pin1);
        rng.fill_bytes(&mut puk1);

        let secret_len = len_u8(SETUP_SECRET_LEN)?;
        let mut data = Vec::with_capacity(96);
        data.push(len_u8(DEFAULT_PIN.len())?);
        data.extend_from_slice(DEFAULT_PIN);
        data.extend_from_slice(&[max_retries, 0x01, len_u8(pin.len())?]);
        data.extend_from_slice(pin);
        data.push(secret_len);
        data.extend_from_slice(&puk0);
        data.extend_from_slice(&[0x01, 0x01, secret_len]);
        data.extend_from_slice(&pin1);
        data.push(secret_len);
        data.extend_from_slice(&puk1);
        data.extend_from_slice(&SETUP_SECMEM_SIZE.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        // create object / key / PIN ACLs
        data.extend_from_slice(&[0x01, 0x01, 0x01]);

        let apdu = Apdu::new(CLA, ins::SETUP, 0x00, 0x00, data);
        self.exchange(CardCommand::Setup, &apdu).map(drop)
    }

    fn change_pin(&mut self, slot: u8, old: &str, new: &str) -> Result<()> {
        let old = check_pin(old)?;
        let new = check_pin(new)?;

        let mut data = Vec::with_capacity(2 + old.len() + new.len());
        data.push(len_u8(old.len())?);
        data.extend_from_slice(old);
        data.push(len_u8(new.len())?);
        data.extend_from_slice(new);

        let apdu = Apdu::new(CLA, ins::CHANGE_PIN, slot, 0x00, data);
        self.exchange(CardCommand::ChangePin, &apdu).map(drop)
    }

    fn import_seed(&mut self, seed: &[u8]) -> Result<()> {
        if !SEED_LEN.contains(&seed.len()) {
            return Err(Error::InvalidSeedLength(seed.len()));
        }
        let apdu = Apdu::new(
            CLA,
            ins::IMPORT_SEED,
            len_u8(seed.len())?,
            0x00,
            seed.to_vec(),
        );
        self.exchange(CardCommand::ImportSeed, &apdu).map(drop)
    }

    fn reset_seed(&mut self, pin: &str) -> Result<()> {
        let pin = check_pin(pin)?;
        let apdu = Apdu::new(CLA, ins::RESET_SEED, len_u8(pin.len())?, 0x00, pin.to_vec());
        self.exchange(CardCommand::ResetSeed, &apdu).map(drop)
    }

    fn verify_certificate_chain(&mut self) -> Result<AuthenticityCheck> {
        let card_key = self.export_pki_pubkey()?;
        let certificate = self.export_pki_certificate()?;
        if certificate.is_empty() {
            return Ok(AuthenticityCheck::invalid("card has no PKI certificate"));
        }
        Ok(self.verifier.verify(&certificate, &card_key))
    }

    fn challenge_response_pki(&mut self) -> Result<AuthenticityCheck> {
        let card_key = self.export_pki_pubkey()?;

        let mut host_challenge = [0u8; 32];
        thread_rng().fill_bytes(&mut host_challenge);

        let apdu = Apdu::new(
            CLA,
            ins::CHALLENGE_RESPONSE_PKI,
            0x00,
            0x00,
            host_challenge.to_vec(),
        );
        let data = self.exchange(CardCommand::ChallengeResponsePki, &apdu)?;

        let device_challenge = data
            .get(..32)
            .ok_or_else(|| Error::MalformedResponse("challenge response too short".to_string()))?;
        let sig_size = read_u16(&data, 32)?;
        let signature = data
            .get(34..34 + sig_size)
            .ok_or_else(|| Error::MalformedResponse("challenge signature truncated".to_string()))?;

        let mut message = Vec::with_capacity(CHALLENGE_PREFIX.len() + 64);
        message.extend_from_slice(CHALLENGE_PREFIX);
        message.extend_from_slice(device_challenge);
        message.extend_from_slice(&host_challenge);

        Ok(
            match crypto::verify_der_over_message(&message, signature, &card_key) {
                Ok(true) => AuthenticityCheck::valid("challenge-response verified"),
                Ok(false) => {
                    AuthenticityCheck::invalid("Failed to verify challenge-response signature")
                }
                Err(e) => AuthenticityCheck::invalid(e.to_string()),
            },
        )
    }

    fn end_session(&mut self) -> Result<()> {
        self.selected = false;
        self.transport.disconnect().inspect_err(|e| {
            warn!(error = %e, "failed to release card");
        })
    }
}

/// Checks a PIN against the applet's length limits.
fn check_pin(pin: &str) -> Result<&[u8]> {
    let bytes = pin.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_PIN_LEN {
        return Err(Error::InvalidPinLength { max: MAX_PIN_LEN });
    }
    Ok(bytes)
}

fn len_u8(len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| Error::MalformedResponse(format!("length {len} exceeds one byte")))
}

fn read_u16(data: &[u8], offset: usize) -> Result<usize> {
    data.get(offset..offset + 2)
        .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
        .ok_or_else(|| Error::MalformedResponse(format!("missing length at offset {offset}")))
}

/// Parses a `GET_STATUS` response. Fields absent on older applets take
/// their backward-compatible defaults.
fn parse_status(data: &[u8]) -> Result<CardStatus> {
    let [proto_major, proto_minor, applet_major, applet_minor, rest @ ..] = data else {
        return Err(Error::MalformedResponse(format!(
            "status record too short: {} bytes",
            data.len()
        )));
    };
    let flag = |index: usize, default: bool| rest.get(index).map_or(default, |b| *b != 0);
    let tries = |index: usize| rest.get(index).copied().unwrap_or(0);

    Ok(CardStatus {
        protocol_version: (*proto_major, *proto_minor),
        applet_version: (*applet_major, *applet_minor),
        pin0_remaining: tries(0),
        puk0_remaining: tries(1),
        pin1_remaining: tries(2),
        puk1_remaining: tries(3),
        needs_2fa: flag(4, false),
        is_seeded: flag(5, true),
        setup_done: flag(6, true),
        needs_secure_channel: flag(7, false),
    })
}

/// Parses a `GET_EXTENDED_KEY` response and recovers the public key.
fn parse_extended_key(data: &[u8]) -> Result<ExtendedKey> {
    let truncated = || Error::MalformedResponse("extended key response truncated".to_string());

    let chain_code: [u8; 32] = data
        .get(..32)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(truncated)?;
    let size_bytes = data.get(32..34).ok_or_else(truncated)?;
    let size = usize::from(u16::from_be_bytes([size_bytes[0] & 0x7F, size_bytes[1]]));

    let x_coordinate: [u8; 32] = data
        .get(34..34 + size)
        .ok_or_else(truncated)?
        .try_into()
        .map_err(|_| Error::MalformedResponse(format!("x-coordinate is {size} bytes")))?;

    let message = &data[..34 + size];
    let sig_size = read_u16(data, 34 + size)?;
    let signature = data
        .get(36 + size..36 + size + sig_size)
        .ok_or_else(truncated)?;

    let public_key = crypto::recover_public_key(message, signature, &x_coordinate)?;

    Ok(ExtendedKey {
        public_key: public_key.serialize(),
        chain_code,
    })
}
