//! In-memory signing card.
//!
//! [`EmulatedCard`] implements [`SignerCard`] with a software BIP32 wallet.
//! It keeps the provisioning and PIN state of a real card, records every
//! command in a shared [`CommandJournal`], and can inject faults on the n-th
//! call of a command. It can also emit high-S signatures to exercise
//! normalization.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use hw_signer_core::card::{CardCommand, EmulatedCard, SignerCard};
//!
//! let mut card = EmulatedCard::new(&[0x01; 32], "1234").unwrap();
//! let journal = card.journal();
//!
//! card.power_up(Duration::from_secs(1)).unwrap();
//! card.verify_pin(0, "1234").unwrap();
//! let fingerprint = card.get_master_xfp().unwrap();
//!
//! assert_eq!(fingerprint, card.master_fingerprint().unwrap());
//! assert_eq!(journal.count(CardCommand::VerifyPin), 1);
//! ```

use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bitcoin::NetworkKind;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::rand::{RngCore, thread_rng};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use tracing::trace;

use super::satochip::LAST_DERIVED_KEY;
use super::{AuthenticityCheck, CardCommand, CardStatus, ExtendedKey, SignerCard};
use crate::crypto;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::path::DerivationPath;
use crate::xpub::{Network, ScriptType, XpubParts, encode_xpub};

/// Longest PIN the emulated applet accepts.
const MAX_PIN_LEN: usize = 16;

/// Default PIN retry counter.
const DEFAULT_PIN_RETRIES: u8 = 5;

/// A shared, append-only log of the commands a card received.
#[derive(Debug, Clone, Default)]
pub struct CommandJournal(Rc<RefCell<Vec<CardCommand>>>);

impl CommandJournal {
    fn record(&self, command: CardCommand) -> usize {
        let mut log = self.0.borrow_mut();
        log.push(command);
        log.iter().filter(|c| **c == command).count()
    }

    /// Returns how many times `command` was received.
    #[must_use]
    pub fn count(&self, command: CardCommand) -> usize {
        self.0.borrow().iter().filter(|c| **c == command).count()
    }

    /// Returns all commands in order.
    #[must_use]
    pub fn commands(&self) -> Vec<CardCommand> {
        self.0.borrow().clone()
    }
}

/// What an injected fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The link drops mid-command.
    Transport,

    /// The card stops answering.
    Timeout,

    /// The card answers with corrupted data.
    GarbledResponse,
}

/// A fault triggered on the `occurrence`-th call (1-based) of `command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Command to intercept.
    pub command: CardCommand,

    /// Which call of the command fails.
    pub occurrence: usize,

    /// Failure mode.
    pub kind: FaultKind,
}

impl Fault {
    /// Creates a fault.
    #[must_use]
    pub const fn new(command: CardCommand, occurrence: usize, kind: FaultKind) -> Self {
        Self {
            command,
            occurrence,
            kind,
        }
    }
}

/// A software signing card.
pub struct EmulatedCard {
    /// Configured PIN, `None` before setup.
    pin: Option<String>,

    /// Retry counter written at setup.
    pin_retries: u8,

    /// Remaining PIN attempts.
    pin_remaining: u8,

    /// Master key, `None` when not seeded.
    master: Option<Xpriv>,

    /// Key used by `sign_transaction_hash` with slot `0xFF`.
    last_derived: Option<Xpriv>,

    /// Key proving card authenticity.
    pki_key: SecretKey,

    /// Whether authenticity checks pass.
    authentic: bool,

    /// Whether signatures are emitted with a high S value.
    high_s: bool,

    /// Whether the card is in the field.
    present: bool,

    powered: bool,
    selected: bool,
    pin_verified: bool,

    faults: Vec<Fault>,
    journal: CommandJournal,
    secp: Secp256k1<All>,
}

impl fmt::Debug for EmulatedCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedCard")
            .field("setup_done", &self.pin.is_some())
            .field("is_seeded", &self.master.is_some())
            .field("powered", &self.powered)
            .field("selected", &self.selected)
            .field("pin_verified", &self.pin_verified)
            .finish_non_exhaustive()
    }
}

impl EmulatedCard {
    /// Creates a card that is set up with `pin` and seeded with `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSeedLength`] or [`Error::InvalidPinLength`].
    pub fn new(seed: &[u8], pin: &str) -> Result<Self> {
        check_pin(pin)?;
        let mut card = Self::blank();
        card.pin = Some(pin.to_string());
        card.pin_remaining = card.pin_retries;
        card.master = Some(master_key(seed)?);
        Ok(card)
    }

    /// Creates a card that has never been set up.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            pin: None,
            pin_retries: DEFAULT_PIN_RETRIES,
            pin_remaining: 0,
            master: None,
            last_derived: None,
            pki_key: SecretKey::new(&mut thread_rng()),
            authentic: true,
            high_s: false,
            present: true,
            powered: false,
            selected: false,
            pin_verified: false,
            faults: Vec::new(),
            journal: CommandJournal::default(),
            secp: Secp256k1::new(),
        }
    }

    /// Creates a card that is set up with `pin` but holds no seed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPinLength`].
    pub fn unseeded(pin: &str) -> Result<Self> {
        check_pin(pin)?;
        let mut card = Self::blank();
        card.pin = Some(pin.to_string());
        card.pin_remaining = card.pin_retries;
        Ok(card)
    }

    /// Emits signatures with `s > n/2`.
    #[must_use]
    pub fn with_high_s(mut self, high_s: bool) -> Self {
        self.high_s = high_s;
        self
    }

    /// Makes authenticity checks fail.
    #[must_use]
    pub fn counterfeit(mut self) -> Self {
        self.authentic = false;
        self
    }

    /// Removes the card from the field; `power_up` times out.
    #[must_use]
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    /// Adds a fault.
    #[must_use]
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Returns a handle to the command journal.
    #[must_use]
    pub fn journal(&self) -> CommandJournal {
        self.journal.clone()
    }

    /// Returns the remaining PIN attempts.
    #[must_use]
    pub const fn pin_remaining(&self) -> u8 {
        self.pin_remaining
    }

    /// Returns the master fingerprint without any card exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSeeded`] if the card holds no seed.
    pub fn master_fingerprint(&self) -> Result<Fingerprint> {
        let master = self.master.as_ref().ok_or(Error::NotSeeded)?;
        let xpub = Xpub::from_priv(&self.secp, master);
        Ok(Fingerprint::from_public_key(&xpub.public_key.serialize()))
    }

    /// Records the command and applies any matching fault.
    fn enter(&mut self, command: CardCommand) -> Result<Option<FaultKind>> {
        let occurrence = self.journal.record(command);
        trace!(%command, occurrence, "emulated card command");

        if !matches!(command, CardCommand::PowerUp | CardCommand::EndSession) && !self.powered {
            return Err(Error::Transport("card not powered".to_string()));
        }

        let fault = self
            .faults
            .iter()
            .find(|f| f.command == command && f.occurrence == occurrence)
            .map(|f| f.kind);

        match fault {
            Some(FaultKind::Transport) => Err(Error::Transport("connection lost".to_string())),
            Some(FaultKind::Timeout) => Err(Error::Timeout),
            other => Ok(other),
        }
    }

    fn require_pin(&self) -> Result<()> {
        if self.pin.is_none() {
            return Err(Error::NotSetup);
        }
        if !self.pin_verified {
            return Err(Error::PinNotVerified);
        }
        Ok(())
    }

    fn derive(&self, path: &DerivationPath) -> Result<Xpriv> {
        let master = self.master.as_ref().ok_or(Error::NotSeeded)?;
        let children: Vec<ChildNumber> = path.indices().iter().copied().map(ChildNumber::from).collect();
        master
            .derive_priv(&self.secp, &children)
            .map_err(|e| Error::InvalidPath(e.to_string()))
    }

    fn sign_digest(&self, key: &SecretKey, digest: [u8; 32]) -> Vec<u8> {
        let compact = self
            .secp
            .sign_ecdsa(&Message::from_digest(digest), key)
            .serialize_compact();

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&compact[..32]);
        s.copy_from_slice(&compact[32..]);
        if self.high_s {
            s = crypto::negate_s(&s);
        }
        crypto::encode_der_signature(&r, &s)
    }
}

impl SignerCard for EmulatedCard {
    fn power_up(&mut self, timeout: Duration) -> Result<()> {
        self.enter(CardCommand::PowerUp)?;
        if !self.present {
            trace!(?timeout, "no card in the field");
            return Err(Error::Timeout);
        }
        self.powered = true;
        Ok(())
    }

    fn get_status(&mut self) -> Result<CardStatus> {
        self.enter(CardCommand::GetStatus)?;
        self.selected = true;
        if self.pin.is_none() {
            return Ok(CardStatus::not_setup());
        }
        Ok(CardStatus {
            protocol_version: (0, 1),
            applet_version: (0, 12),
            pin0_remaining: self.pin_remaining,
            puk0_remaining: 1,
            pin1_remaining: 1,
            puk1_remaining: 1,
            needs_2fa: false,
            is_seeded: self.master.is_some(),
            setup_done: true,
            needs_secure_channel: false,
        })
    }

    fn verify_pin(&mut self, slot: u8, pin: &str) -> Result<()> {
        self.enter(CardCommand::VerifyPin)?;
        check_pin(pin)?;
        if slot != 0 {
            return Err(Error::UnexpectedStatusWord(0x9C, 0x10));
        }
        let Some(expected) = self.pin.as_deref() else {
            return Err(Error::NotSetup);
        };
        if self.pin_remaining == 0 {
            return Err(Error::PinBlocked);
        }

        if pin == expected {
            self.pin_remaining = self.pin_retries;
            self.pin_verified = true;
            return Ok(());
        }

        self.pin_verified = false;
        self.pin_remaining -= 1;
        if self.pin_remaining == 0 {
            Err(Error::PinBlocked)
        } else {
            Err(Error::WrongPin {
                remaining: Some(self.pin_remaining),
            })
        }
    }

    fn select_applet(&mut self) -> Result<()> {
        self.enter(CardCommand::SelectApplet)?;
        self.selected = true;
        self.pin_verified = false;
        Ok(())
    }

    fn get_extended_key(&mut self, path: &DerivationPath) -> Result<ExtendedKey> {
        if self.enter(CardCommand::GetExtendedKey)? == Some(FaultKind::GarbledResponse) {
            return Err(Error::MalformedResponse("extended key response truncated".to_string()));
        }
        self.require_pin()?;

        let node = self.derive(path)?;
        let xpub = Xpub::from_priv(&self.secp, &node);
        self.last_derived = Some(node);

        Ok(ExtendedKey {
            public_key: xpub.public_key.serialize(),
            chain_code: xpub.chain_code.to_bytes(),
        })
    }

    fn get_xpub(
        &mut self,
        path: &DerivationPath,
        _script_type: ScriptType,
        network: Network,
    ) -> Result<String> {
        self.enter(CardCommand::GetXpub)?;
        self.require_pin()?;

        let node = self.derive(path)?;
        let xpub = Xpub::from_priv(&self.secp, &node);
        let parts = XpubParts {
            public_key: xpub.public_key.serialize(),
            chain_code: xpub.chain_code.to_bytes(),
            depth: xpub.depth,
            parent_fingerprint: Fingerprint::new(xpub.parent_fingerprint.to_bytes()),
            child_number: u32::from(xpub.child_number),
        };
        self.last_derived = Some(node);

        encode_xpub(&parts, network)
    }

    fn get_master_xfp(&mut self) -> Result<Fingerprint> {
        self.enter(CardCommand::GetMasterXfp)?;
        self.require_pin()?;
        self.master_fingerprint()
    }

    fn sign_transaction_hash(&mut self, key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let fault = self.enter(CardCommand::SignTransactionHash)?;
        self.require_pin()?;

        let key = match (key_slot, &self.last_derived) {
            (LAST_DERIVED_KEY, Some(node)) => node.private_key,
            _ => return Err(Error::UnexpectedStatusWord(0x9C, 0x09)),
        };

        let mut der = self.sign_digest(&key, *digest);
        if fault == Some(FaultKind::GarbledResponse) {
            der[0] = 0x31;
        }
        Ok(der)
    }

    fn setup(&mut self, pin: &str, max_retries: u8) -> Result<()> {
        self.enter(CardCommand::Setup)?;
        check_pin(pin)?;
        if self.pin.is_some() {
            return Err(Error::UnexpectedStatusWord(0x9C, 0x07));
        }
        self.pin = Some(pin.to_string());
        self.pin_retries = max_retries;
        self.pin_remaining = max_retries;
        Ok(())
    }

    fn change_pin(&mut self, slot: u8, old: &str, new: &str) -> Result<()> {
        self.enter(CardCommand::ChangePin)?;
        check_pin(new)?;
        if slot != 0 {
            return Err(Error::UnexpectedStatusWord(0x9C, 0x10));
        }
        if self.pin.as_deref() != Some(old) {
            self.pin_remaining = self.pin_remaining.saturating_sub(1);
            return Err(Error::WrongPin {
                remaining: Some(self.pin_remaining),
            });
        }
        self.pin = Some(new.to_string());
        Ok(())
    }

    fn import_seed(&mut self, seed: &[u8]) -> Result<()> {
        self.enter(CardCommand::ImportSeed)?;
        self.require_pin()?;
        if self.master.is_some() {
            return Err(Error::UnexpectedStatusWord(0x9C, 0x17));
        }
        self.master = Some(master_key(seed)?);
        Ok(())
    }

    fn reset_seed(&mut self, pin: &str) -> Result<()> {
        self.enter(CardCommand::ResetSeed)?;
        self.require_pin()?;
        if self.pin.as_deref() != Some(pin) {
            return Err(Error::WrongPin { remaining: None });
        }
        if self.master.is_none() {
            return Err(Error::NotSeeded);
        }
        self.master = None;
        self.last_derived = None;
        Ok(())
    }

    fn verify_certificate_chain(&mut self) -> Result<AuthenticityCheck> {
        self.enter(CardCommand::VerifyCertificateChain)?;
        Ok(if self.authentic {
            AuthenticityCheck::valid("certificate chain verified")
        } else {
            AuthenticityCheck::invalid("certificate is not signed by a known authority")
        })
    }

    fn challenge_response_pki(&mut self) -> Result<AuthenticityCheck> {
        self.enter(CardCommand::ChallengeResponsePki)?;

        let mut rng = thread_rng();
        let mut host = [0u8; 32];
        let mut device = [0u8; 32];
        rng.fill_bytes(&mut host);
        rng.fill_bytes(&mut device);

        let mut message = b"Challenge:".to_vec();
        message.extend_from_slice(&device);
        message.extend_from_slice(&host);
        let digest = sha256::Hash::hash(&message).to_byte_array();

        let signing_key = if self.authentic {
            self.pki_key
        } else {
            SecretKey::new(&mut rng)
        };
        let der = self.sign_digest(&signing_key, digest);
        let card_key = PublicKey::from_secret_key(&self.secp, &self.pki_key);

        if crypto::verify_der_over_message(&message, &der, &card_key)? {
            Ok(AuthenticityCheck::valid("challenge-response verified"))
        } else {
            Ok(AuthenticityCheck::invalid(
                "Failed to verify challenge-response signature",
            ))
        }
    }

    fn end_session(&mut self) -> Result<()> {
        self.enter(CardCommand::EndSession)?;
        self.powered = false;
        self.selected = false;
        self.pin_verified = false;
        Ok(())
    }
}

fn check_pin(pin: &str) -> Result<()> {
    if pin.is_empty() || pin.len() > MAX_PIN_LEN {
        return Err(Error::InvalidPinLength { max: MAX_PIN_LEN });
    }
    Ok(())
}

fn master_key(seed: &[u8]) -> Result<Xpriv> {
    if !(16..=64).contains(&seed.len()) {
        return Err(Error::InvalidSeedLength(seed.len()));
    }
    Xpriv::new_master(NetworkKind::Main, seed).map_err(|e| Error::InvalidExtendedKey(e.to_string()))
}
