//! Signing card communication.
//!
//! Two layers sit between the orchestration flows and the physical card:
//!
//! - [`Transport`]: raw APDU exchange with a reader (PC/SC, NFC bridge, ...)
//! - [`SignerCard`]: the card command set the flows consume, independent of
//!   how commands are framed on the wire
//!
//! [`SatochipCard`] implements [`SignerCard`] over any [`Transport`];
//! [`EmulatedCard`] implements it in software for tests and demos.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │      CardSession (state machine, teardown)   │
//! ├──────────────────────────────────────────────┤
//! │  SignerCard: SatochipCard<T> | EmulatedCard   │
//! ├──────────────────────────────────────────────┤
//! │  Transport: PcscTransport | platform bridge  │
//! └──────────────────────────────────────────────┘
//! ```

pub mod apdu;
pub mod emulator;
pub mod satochip;

#[cfg(feature = "pcsc")]
pub mod pcsc_transport;

use core::fmt;
use std::time::Duration;

pub use apdu::{Apdu, ApduResponse};
pub use emulator::{CommandJournal, EmulatedCard, Fault, FaultKind};
pub use satochip::{CertificateVerifier, EmbeddedKeyVerifier, SatochipCard};

#[cfg(feature = "pcsc")]
pub use pcsc_transport::PcscTransport;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::path::DerivationPath;
use crate::xpub::{Network, ScriptType, XpubParts, encode_xpub};

/// A transport layer for exchanging APDUs with a card reader.
pub trait Transport {
    /// Sends an APDU command and receives a response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if communication fails.
    fn transmit(&mut self, apdu: &Apdu) -> Result<ApduResponse>;

    /// Checks if a card is present and the link is up.
    fn is_connected(&self) -> bool;

    /// Waits up to `timeout` for a card to be presented.
    ///
    /// The default implementation only checks [`Transport::is_connected`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no card is present in time.
    fn wait_for_card(&mut self, timeout: Duration) -> Result<()> {
        let _ = timeout;
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Releases the card. Further transmits fail until the card is presented again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the reader reports a failure.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Raw public key and chain code of a derived BIP32 node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedKey {
    /// Compressed SEC1 public key.
    pub public_key: [u8; 33],

    /// BIP32 chain code.
    pub chain_code: [u8; 32],
}

/// Card status as reported by `GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[expect(clippy::struct_excessive_bools, reason = "mirrors the card status record")]
pub struct CardStatus {
    /// Protocol version `(major, minor)`.
    pub protocol_version: (u8, u8),

    /// Applet version `(major, minor)`.
    pub applet_version: (u8, u8),

    /// Remaining tries for PIN 0.
    pub pin0_remaining: u8,

    /// Remaining tries for PUK 0.
    pub puk0_remaining: u8,

    /// Remaining tries for PIN 1.
    pub pin1_remaining: u8,

    /// Remaining tries for PUK 1.
    pub puk1_remaining: u8,

    /// Whether signing requires a second factor.
    pub needs_2fa: bool,

    /// Whether a BIP32 seed is loaded.
    pub is_seeded: bool,

    /// Whether the PIN has been configured.
    pub setup_done: bool,

    /// Whether commands must travel over a secure channel.
    pub needs_secure_channel: bool,
}

impl CardStatus {
    /// Status of a card that has never been set up.
    #[must_use]
    pub const fn not_setup() -> Self {
        Self {
            protocol_version: (0, 0),
            applet_version: (0, 0),
            pin0_remaining: 0,
            puk0_remaining: 0,
            pin1_remaining: 0,
            puk1_remaining: 0,
            needs_2fa: false,
            is_seeded: false,
            setup_done: false,
            needs_secure_channel: false,
        }
    }
}

/// Outcome of an authenticity check.
///
/// A failed check is data, not an error: callers display `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticityCheck {
    /// Whether the check passed.
    pub is_valid: bool,

    /// Human-readable result.
    pub message: String,
}

impl AuthenticityCheck {
    /// A passed check.
    #[must_use]
    pub fn valid(message: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            message: message.into(),
        }
    }

    /// A failed check.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
        }
    }
}

/// Card commands, used for logging, error context and test journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CardCommand {
    /// Wait for the card and power it up.
    PowerUp,
    /// Read the status record.
    GetStatus,
    /// Select the signing applet.
    SelectApplet,
    /// Verify a PIN.
    VerifyPin,
    /// Derive an extended key.
    GetExtendedKey,
    /// Assemble an extended public key string.
    GetXpub,
    /// Read the master fingerprint.
    GetMasterXfp,
    /// Sign a 32-byte digest.
    SignTransactionHash,
    /// Initial PIN setup.
    Setup,
    /// Change a PIN.
    ChangePin,
    /// Load a seed.
    ImportSeed,
    /// Erase the seed.
    ResetSeed,
    /// Validate the card certificate.
    VerifyCertificateChain,
    /// Prove possession of the card's PKI key.
    ChallengeResponsePki,
    /// Release the card.
    EndSession,
}

impl fmt::Display for CardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PowerUp => "powerUp",
            Self::GetStatus => "getStatus",
            Self::SelectApplet => "selectApplet",
            Self::VerifyPin => "verifyPIN",
            Self::GetExtendedKey => "getExtendedKey",
            Self::GetXpub => "getXpub",
            Self::GetMasterXfp => "getMasterXfp",
            Self::SignTransactionHash => "signTransactionHash",
            Self::Setup => "setup",
            Self::ChangePin => "changePIN",
            Self::ImportSeed => "importSeed",
            Self::ResetSeed => "resetSeed",
            Self::VerifyCertificateChain => "verifyCertificateChain",
            Self::ChallengeResponsePki => "cardChallengeResponsePki",
            Self::EndSession => "endNfcSession",
        };
        f.write_str(name)
    }
}

/// The command set of a hardware signing card.
///
/// Implementations perform exactly one device exchange sequence per call and
/// keep no retry logic: a wrong PIN is reported, never retried.
pub trait SignerCard {
    /// Waits up to `timeout` for the card and powers it up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the card is not presented in time.
    fn power_up(&mut self, timeout: Duration) -> Result<()>;

    /// Reads the card status.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    fn get_status(&mut self) -> Result<CardStatus>;

    /// Verifies the PIN in `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPin`], [`Error::PinBlocked`] or [`Error::NotSetup`].
    fn verify_pin(&mut self, slot: u8, pin: &str) -> Result<()>;

    /// Selects the signing applet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AppletNotFound`] if the card does not host it.
    fn select_applet(&mut self) -> Result<()>;

    /// Derives the BIP32 node at `path`. The node becomes the card's
    /// "last derived key" used by [`SignerCard::sign_transaction_hash`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`], [`Error::NotSeeded`] or a transport error.
    fn get_extended_key(&mut self, path: &DerivationPath) -> Result<ExtendedKey>;

    /// Returns the Base58Check extended public key at `path`.
    ///
    /// The default implementation derives the parent (for its fingerprint)
    /// and then `path` itself, so the last derived key is the one at `path`.
    /// It encodes with the standard `xpub`/`tpub` version bytes for every
    /// script type; `script_type` is only for cards that emit SLIP-132
    /// prefixes.
    ///
    /// # Errors
    ///
    /// Same as [`SignerCard::get_extended_key`], plus
    /// [`Error::InvalidPath`] for paths deeper than 255 steps.
    fn get_xpub(
        &mut self,
        path: &DerivationPath,
        _script_type: ScriptType,
        network: Network,
    ) -> Result<String> {
        let parent_fingerprint = match path.parent() {
            Some(parent) => Fingerprint::from_public_key(&self.get_extended_key(&parent)?.public_key),
            None => Fingerprint::default(),
        };
        let key = self.get_extended_key(path)?;
        let depth = u8::try_from(path.depth())
            .map_err(|_| Error::InvalidPath(format!("{path} is deeper than 255 steps")))?;

        encode_xpub(
            &XpubParts {
                public_key: key.public_key,
                chain_code: key.chain_code,
                depth,
                parent_fingerprint,
                child_number: path.last().unwrap_or(0),
            },
            network,
        )
    }

    /// Returns the master key fingerprint.
    ///
    /// # Errors
    ///
    /// Same as [`SignerCard::get_extended_key`].
    fn get_master_xfp(&mut self) -> Result<Fingerprint> {
        let root = self.get_extended_key(&DerivationPath::master())?;
        Ok(Fingerprint::from_public_key(&root.public_key))
    }

    /// Signs a 32-byte digest with the key in `key_slot` (`0xFF` for the last
    /// derived key). Returns a DER signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] or a transport error.
    fn sign_transaction_hash(&mut self, key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>>;

    /// Configures the PIN of a fresh card.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the card is already set up.
    fn setup(&mut self, pin: &str, max_retries: u8) -> Result<()>;

    /// Replaces the PIN in `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPin`] if `old` is rejected.
    fn change_pin(&mut self, slot: u8, old: &str, new: &str) -> Result<()>;

    /// Loads a BIP32 seed of 16 to 64 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSeedLength`] or a protocol error.
    fn import_seed(&mut self, seed: &[u8]) -> Result<()>;

    /// Erases the seed, authorized by `pin`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPin`] or a protocol error.
    fn reset_seed(&mut self, pin: &str) -> Result<()>;

    /// Validates the card's certificate chain.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures; a bad chain is an invalid
    /// [`AuthenticityCheck`].
    fn verify_certificate_chain(&mut self) -> Result<AuthenticityCheck>;

    /// Runs a challenge-response against the card's PKI key.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures.
    fn challenge_response_pki(&mut self) -> Result<AuthenticityCheck>;

    /// Releases the card and tears down the platform session.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the reader fails to release the card.
    fn end_session(&mut self) -> Result<()>;
}

impl<C: SignerCard + ?Sized> SignerCard for &mut C {
    fn power_up(&mut self, timeout: Duration) -> Result<()> {
        (**self).power_up(timeout)
    }

    fn get_status(&mut self) -> Result<CardStatus> {
        (**self).get_status()
    }

    fn verify_pin(&mut self, slot: u8, pin: &str) -> Result<()> {
        (**self).verify_pin(slot, pin)
    }

    fn select_applet(&mut self) -> Result<()> {
        (**self).select_applet()
    }

    fn get_extended_key(&mut self, path: &DerivationPath) -> Result<ExtendedKey> {
        (**self).get_extended_key(path)
    }

    fn get_xpub(
        &mut self,
        path: &DerivationPath,
        script_type: ScriptType,
        network: Network,
    ) -> Result<String> {
        (**self).get_xpub(path, script_type, network)
    }

    fn get_master_xfp(&mut self) -> Result<Fingerprint> {
        (**self).get_master_xfp()
    }

    fn sign_transaction_hash(&mut self, key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>> {
        (**self).sign_transaction_hash(key_slot, digest)
    }

    fn setup(&mut self, pin: &str, max_retries: u8) -> Result<()> {
        (**self).setup(pin, max_retries)
    }

    fn change_pin(&mut self, slot: u8, old: &str, new: &str) -> Result<()> {
        (**self).change_pin(slot, old, new)
    }

    fn import_seed(&mut self, seed: &[u8]) -> Result<()> {
        (**self).import_seed(seed)
    }

    fn reset_seed(&mut self, pin: &str) -> Result<()> {
        (**self).reset_seed(pin)
    }

    fn verify_certificate_chain(&mut self) -> Result<AuthenticityCheck> {
        (**self).verify_certificate_chain()
    }

    fn challenge_response_pki(&mut self) -> Result<AuthenticityCheck> {
        (**self).challenge_response_pki()
    }

    fn end_session(&mut self) -> Result<()> {
        (**self).end_session()
    }
}
