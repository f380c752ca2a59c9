//! Card session state machine.
//!
//! A [`CardSession`] owns a [`SignerCard`] for the duration of one flow and
//! tracks where the card is in its lifecycle:
//!
//! ```text
//! Disconnected ──open──▶ Connected ──select──▶ AppletSelected ──verify──▶ PinVerified
//!                                                    ▲                        │
//!                                                    └──── failed verify ─────┘
//! ```
//!
//! While a command is in flight the state is [`SessionState::Busy`].
//! Commands needing PIN authentication fail with [`Error::PinNotVerified`]
//! before any card I/O when the session is not in
//! [`SessionState::PinVerified`].
//!
//! The card's `end_session` runs exactly once per opened session, on
//! [`CardSession::end`] or on drop, whatever the outcome of the flow.
//!
//! # Example
//!
//! ```
//! use hw_signer_core::card::EmulatedCard;
//! use hw_signer_core::session::{SessionState, with_session};
//! use hw_signer_core::SignerConfig;
//!
//! let card = EmulatedCard::new(&[7u8; 32], "1234").unwrap();
//! let fingerprint = with_session(card, &SignerConfig::default(), |session| {
//!     session.verify_pin("1234")?;
//!     assert_eq!(session.state(), SessionState::PinVerified);
//!     session.get_master_xfp()
//! })
//! .unwrap();
//! assert_eq!(fingerprint.to_string().len(), 8);
//! ```

use core::fmt;

use tracing::{debug, warn};

use crate::card::{AuthenticityCheck, CardCommand, CardStatus, ExtendedKey, SignerCard};
use crate::config::SignerConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::path::DerivationPath;
use crate::xpub::{Network, ScriptType};

/// Lifecycle state of a card session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No card is powered.
    Disconnected,

    /// The card is powered; no applet is selected.
    Connected,

    /// The signing applet is selected.
    AppletSelected,

    /// The PIN has been verified in this session.
    PinVerified,

    /// A command is in flight.
    Busy,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::AppletSelected => "applet selected",
            Self::PinVerified => "PIN verified",
            Self::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// A scoped session with a signing card.
pub struct CardSession<C: SignerCard> {
    card: C,
    state: SessionState,
    config: SignerConfig,
    ended: bool,
}

impl<C: SignerCard> fmt::Debug for CardSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSession")
            .field("state", &self.state)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl<C: SignerCard> CardSession<C> {
    /// Opens a session, waiting up to the configured connect timeout for the
    /// card.
    ///
    /// If the card never shows up the session is still torn down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or a transport error from power-up.
    pub fn open(card: C, config: &SignerConfig) -> Result<Self> {
        let mut session = Self {
            card,
            state: SessionState::Disconnected,
            config: config.clone(),
            ended: false,
        };

        let timeout = session.config.connect_timeout;
        session.run(CardCommand::PowerUp, |card| card.power_up(timeout))?;
        session.state = SessionState::Connected;
        debug!(?timeout, "card session opened");

        Ok(session)
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the session configuration.
    #[must_use]
    pub const fn config(&self) -> &SignerConfig {
        &self.config
    }

    /// Returns the underlying card.
    #[must_use]
    pub const fn card(&self) -> &C {
        &self.card
    }

    /// Selects the signing applet. Does nothing if it is already selected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AppletNotFound`] or a transport error.
    pub fn select_applet(&mut self) -> Result<()> {
        if matches!(
            self.state,
            SessionState::AppletSelected | SessionState::PinVerified
        ) {
            return Ok(());
        }
        self.run(CardCommand::SelectApplet, SignerCard::select_applet)?;
        self.state = SessionState::AppletSelected;
        Ok(())
    }

    /// Verifies `pin` in the configured PIN slot, selecting the applet first
    /// if needed.
    ///
    /// A failed verification drops the session back to
    /// [`SessionState::AppletSelected`]. Retries are up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPin`], [`Error::PinBlocked`] or [`Error::NotSetup`].
    pub fn verify_pin(&mut self, pin: &str) -> Result<()> {
        self.select_applet()?;
        let slot = self.config.pin_slot;
        match self.run(CardCommand::VerifyPin, |card| card.verify_pin(slot, pin)) {
            Ok(()) => {
                self.state = SessionState::PinVerified;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::AppletSelected;
                Err(e)
            }
        }
    }

    /// Reads the card status. No PIN needed.
    ///
    /// # Errors
    ///
    /// Returns a transport or protocol error.
    pub fn get_status(&mut self) -> Result<CardStatus> {
        self.run(CardCommand::GetStatus, SignerCard::get_status)
    }

    /// Derives the node at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] without card I/O if the PIN has not
    /// been verified in this session.
    pub fn get_extended_key(&mut self, path: &DerivationPath) -> Result<ExtendedKey> {
        self.require_pin()?;
        self.run(CardCommand::GetExtendedKey, |card| card.get_extended_key(path))
    }

    /// Returns the mainnet extended public key at `path`. Callers convert it
    /// for other networks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] without card I/O if the PIN has not
    /// been verified in this session.
    pub fn get_xpub(&mut self, path: &DerivationPath, script_type: ScriptType) -> Result<String> {
        self.require_pin()?;
        self.run(CardCommand::GetXpub, |card| {
            card.get_xpub(path, script_type, Network::Mainnet)
        })
    }

    /// Returns the master key fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] without card I/O if the PIN has not
    /// been verified in this session.
    pub fn get_master_xfp(&mut self) -> Result<Fingerprint> {
        self.require_pin()?;
        self.run(CardCommand::GetMasterXfp, SignerCard::get_master_xfp)
    }

    /// Signs `digest` with the key in `key_slot` and returns the DER signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] without card I/O if the PIN has not
    /// been verified in this session.
    pub fn sign_transaction_hash(&mut self, key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>> {
        self.require_pin()?;
        self.run(CardCommand::SignTransactionHash, |card| {
            card.sign_transaction_hash(key_slot, digest)
        })
    }

    /// Sets the PIN of a fresh card.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the card is already set up.
    pub fn setup(&mut self, pin: &str, max_retries: u8) -> Result<()> {
        self.run(CardCommand::Setup, |card| card.setup(pin, max_retries))
    }

    /// Replaces the PIN in the configured slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPin`] if `old` is rejected.
    pub fn change_pin(&mut self, old: &str, new: &str) -> Result<()> {
        let slot = self.config.pin_slot;
        self.run(CardCommand::ChangePin, |card| card.change_pin(slot, old, new))
    }

    /// Loads a BIP32 seed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] without card I/O if the PIN has not
    /// been verified in this session.
    pub fn import_seed(&mut self, seed: &[u8]) -> Result<()> {
        self.require_pin()?;
        self.run(CardCommand::ImportSeed, |card| card.import_seed(seed))
    }

    /// Erases the seed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PinNotVerified`] without card I/O if the PIN has not
    /// been verified in this session.
    pub fn reset_seed(&mut self, pin: &str) -> Result<()> {
        self.require_pin()?;
        self.run(CardCommand::ResetSeed, |card| card.reset_seed(pin))
    }

    /// Validates the card certificate chain.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures.
    pub fn verify_certificate_chain(&mut self) -> Result<AuthenticityCheck> {
        self.run(
            CardCommand::VerifyCertificateChain,
            SignerCard::verify_certificate_chain,
        )
    }

    /// Runs the PKI challenge-response.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures.
    pub fn challenge_response_pki(&mut self) -> Result<AuthenticityCheck> {
        self.run(
            CardCommand::ChallengeResponsePki,
            SignerCard::challenge_response_pki,
        )
    }

    /// Ends the session and releases the card.
    ///
    /// # Errors
    ///
    /// Returns the card's teardown error.
    pub fn end(mut self) -> Result<()> {
        self.finish()
    }

    fn require_pin(&self) -> Result<()> {
        if self.ended {
            return Err(Error::Transport("session already ended".to_string()));
        }
        if self.state == SessionState::PinVerified {
            Ok(())
        } else {
            Err(Error::PinNotVerified)
        }
    }

    fn run<T>(&mut self, command: CardCommand, op: impl FnOnce(&mut C) -> Result<T>) -> Result<T> {
        if self.ended {
            return Err(Error::Transport("session already ended".to_string()));
        }

        let resume = self.state;
        self.state = SessionState::Busy;
        debug!(%command, state = %resume, "card command");

        let result = op(&mut self.card).map_err(|e| e.in_command(command));
        self.state = resume;

        if let Err(e) = &result {
            debug!(%command, error = %e, "card command failed");
        }
        result
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.state = SessionState::Disconnected;
        debug!("ending card session");
        self.card
            .end_session()
            .map_err(|e| e.in_command(CardCommand::EndSession))
    }
}

impl<C: SignerCard> Drop for CardSession<C> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "card session teardown failed");
        }
    }
}

/// Runs `f` inside a session on `card` and always ends the session.
///
/// Teardown failures after `f` are logged and do not mask its result.
///
/// # Errors
///
/// Returns the error from opening the session or from `f`.
pub fn with_session<C, T, F>(card: C, config: &SignerConfig, f: F) -> Result<T>
where
    C: SignerCard,
    F: FnOnce(&mut CardSession<C>) -> Result<T>,
{
    let mut session = CardSession::open(card, config)?;
    let result = f(&mut session);
    if let Err(e) = session.end() {
        warn!(error = %e, "card session teardown failed");
    }
    result
}
