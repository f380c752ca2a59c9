//! Card management flows.
//!
//! Each flow opens its own session on the card, runs one wallet operation
//! and always ends the session, even on failure.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::card::{CardStatus, SignerCard};
use crate::config::SignerConfig;
use crate::derive::derive_account_keys;
use crate::error::{Error, Result};
use crate::session::{CardSession, with_session};
use crate::xpub::XpubDetails;

/// Message reported for a card that has never been set up.
const SETUP_REQUIRED: &str = "Card setup required!";

/// Message reported when both authenticity checks pass.
const AUTHENTIC: &str = "Card is authentic";

/// Keys a wallet registers for a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    /// Extended public key of the selected script type.
    pub xpub: String,

    /// Master fingerprint, uppercase hex.
    pub master_fingerprint: String,

    /// Derivation path of `xpub`.
    pub derivation_path: String,

    /// Keys of every script type.
    pub xpub_details: XpubDetails,
}

/// Provisioning and authenticity summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardInfo {
    /// Whether a PIN is configured.
    pub setup_done: bool,

    /// Whether a seed is loaded.
    pub is_seeded: bool,

    /// Whether the card passed both authenticity checks.
    pub is_authentic: bool,

    /// Human-readable authenticity result.
    pub authenticity_msg: String,
}

/// Reads the account keys a wallet needs to register the card.
///
/// # Errors
///
/// - [`Error::NotSetup`] or [`Error::NotSeeded`] for unprovisioned cards
/// - PIN and transport errors
///
/// # Example
///
/// ```
/// use hw_signer_core::SignerConfig;
/// use hw_signer_core::card::EmulatedCard;
/// use hw_signer_core::manage::get_card_details;
///
/// let card = EmulatedCard::new(&[5u8; 32], "1234").unwrap();
/// let details = get_card_details(card, &SignerConfig::default(), "1234", 0, false).unwrap();
///
/// assert_eq!(details.derivation_path, "m/84'/0'/0'");
/// assert_eq!(details.master_fingerprint.len(), 8);
/// ```
pub fn get_card_details<C: SignerCard>(
    card: C,
    config: &SignerConfig,
    pin: &str,
    account: u32,
    multisig: bool,
) -> Result<CardDetails> {
    with_session(card, config, |session| {
        let status = session.get_status()?;
        if !status.setup_done {
            return Err(Error::NotSetup);
        }
        if !status.is_seeded {
            return Err(Error::NotSeeded);
        }

        session.verify_pin(pin)?;
        let keys = derive_account_keys(session, pin, account, multisig)?;

        Ok(CardDetails {
            xpub: keys.xpub().to_string(),
            master_fingerprint: keys.master_fingerprint.to_string(),
            derivation_path: keys.derivation_path(),
            xpub_details: keys.xpub_details(),
        })
    })
}

/// Reports provisioning state and runs the authenticity checks.
///
/// A card that fails authentication is reported, not rejected: the outcome
/// and reason land in [`CardInfo::is_authentic`] and
/// [`CardInfo::authenticity_msg`].
///
/// # Errors
///
/// Returns transport errors and, when `pin` is given, PIN errors.
pub fn get_card_info<C: SignerCard>(
    card: C,
    config: &SignerConfig,
    pin: Option<&str>,
) -> Result<CardInfo> {
    with_session(card, config, |session| {
        let status = session.get_status()?;
        if !status.setup_done {
            return Ok(CardInfo {
                setup_done: false,
                is_seeded: false,
                is_authentic: false,
                authenticity_msg: SETUP_REQUIRED.to_string(),
            });
        }

        if let Some(pin) = pin {
            session.verify_pin(pin)?;
        }

        let (is_authentic, authenticity_msg) = match check_authenticity(session) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "authenticity check failed");
                (false, e.user_message())
            }
        };

        Ok(CardInfo {
            setup_done: status.setup_done,
            is_seeded: status.is_seeded,
            is_authentic,
            authenticity_msg,
        })
    })
}

fn check_authenticity<C: SignerCard>(session: &mut CardSession<C>) -> Result<(bool, String)> {
    let certificate = session.verify_certificate_chain()?;
    if !certificate.is_valid {
        return Ok((false, certificate.message));
    }

    let challenge = session.challenge_response_pki()?;
    if !challenge.is_valid {
        return Ok((false, challenge.message));
    }

    Ok((true, AUTHENTIC.to_string()))
}

/// Sets the PIN of a fresh card, with the retry counter from `config`.
///
/// # Errors
///
/// Returns a protocol error if the card is already set up.
pub fn setup_card<C: SignerCard>(card: C, config: &SignerConfig, pin: &str) -> Result<()> {
    let retries = config.setup_pin_retries;
    with_session(card, config, |session| session.setup(pin, retries))?;
    info!(retries, "card set up");
    Ok(())
}

/// Verifies `old` and replaces it with `new`.
///
/// # Errors
///
/// Returns [`Error::WrongPin`] if `old` is rejected.
pub fn change_pin<C: SignerCard>(card: C, config: &SignerConfig, old: &str, new: &str) -> Result<()> {
    with_session(card, config, |session| {
        session.verify_pin(old)?;
        session.change_pin(old, new)
    })
}

/// Loads a BIP32 seed of 16 to 64 bytes.
///
/// The length is checked before the card is touched.
///
/// # Errors
///
/// Returns [`Error::InvalidSeedLength`], PIN errors or a protocol error if
/// the card is already seeded.
pub fn import_seed<C: SignerCard>(
    card: C,
    config: &SignerConfig,
    pin: &str,
    seed: &[u8],
) -> Result<()> {
    if !(16..=64).contains(&seed.len()) {
        return Err(Error::InvalidSeedLength(seed.len()));
    }
    with_session(card, config, |session| {
        session.verify_pin(pin)?;
        session.import_seed(seed)
    })?;
    info!("seed imported");
    Ok(())
}

/// Erases the seed.
///
/// # Errors
///
/// Returns PIN errors or [`Error::NotSeeded`].
pub fn reset_seed<C: SignerCard>(card: C, config: &SignerConfig, pin: &str) -> Result<()> {
    with_session(card, config, |session| {
        session.verify_pin(pin)?;
        session.reset_seed(pin)
    })?;
    info!("seed erased");
    Ok(())
}

/// Verifies the PIN and reads the card status.
///
/// # Errors
///
/// Returns PIN or transport errors.
pub fn read_status<C: SignerCard>(card: C, config: &SignerConfig, pin: &str) -> Result<CardStatus> {
    with_session(card, config, |session| {
        session.verify_pin(pin)?;
        session.get_status()
    })
}
