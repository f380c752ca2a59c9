//! Account key derivation.
//!
//! [`derive_account_keys`] fetches the single-signature (BIP84) and multisig
//! (BIP48) extended public keys of one account together with the master
//! fingerprint. The PIN is re-verified before each key fetch when
//! [`SignerConfig::reverify_pin_per_key`](crate::SignerConfig) is set, since
//! cards may demand fresh authentication per sensitive command.

use std::str::FromStr;

use bitcoin::bip32::Xpub;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::card::SignerCard;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::session::CardSession;
use crate::xpub::{ExtendedKeyMaterial, ScriptType, XpubDetails, XpubEntry, convert_version};

/// Both account keys of a card plus its master fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountKeys {
    /// P2WPKH account key.
    pub single_sig: ExtendedKeyMaterial,

    /// P2WSH multisig account key.
    pub multi_sig: ExtendedKeyMaterial,

    /// Master key fingerprint.
    pub master_fingerprint: Fingerprint,

    /// Whether the multisig key is the selected one.
    pub multisig: bool,
}

impl AccountKeys {
    /// Returns the key selected by the multisig flag.
    #[must_use]
    pub const fn selected(&self) -> &ExtendedKeyMaterial {
        if self.multisig {
            &self.multi_sig
        } else {
            &self.single_sig
        }
    }

    /// Returns the selected extended public key.
    #[must_use]
    pub fn xpub(&self) -> &str {
        &self.selected().xpub
    }

    /// Returns the selected derivation path in text form.
    #[must_use]
    pub fn derivation_path(&self) -> String {
        self.selected().derivation_path.to_string()
    }

    /// Returns both keys keyed by script type.
    #[must_use]
    pub fn xpub_details(&self) -> XpubDetails {
        XpubDetails {
            p2wpkh: XpubEntry::from(&self.single_sig),
            p2wsh: XpubEntry::from(&self.multi_sig),
        }
    }
}

/// Derives the account keys for `account` on the session's network.
///
/// The master fingerprint is fetched once, after both keys.
///
/// # Arguments
///
/// * `session` - An open card session
/// * `pin` - PIN used for each re-verification
/// * `account` - Hardened account index (without the hardened bit)
/// * `multisig` - Which key [`AccountKeys::selected`] returns
///
/// # Errors
///
/// Returns PIN errors, [`Error::NotSeeded`], or transport errors.
/// Returns [`Error::InvalidPath`] before any card I/O if `account` is
/// 2^31 or above.
///
/// # Example
///
/// ```
/// use hw_signer_core::card::EmulatedCard;
/// use hw_signer_core::derive::derive_account_keys;
/// use hw_signer_core::session::with_session;
/// use hw_signer_core::{Network, SignerConfig};
///
/// let card = EmulatedCard::new(&[9u8; 32], "1234").unwrap();
/// let config = SignerConfig::for_network(Network::Testnet);
///
/// let keys = with_session(card, &config, |session| {
///     session.verify_pin("1234")?;
///     derive_account_keys(session, "1234", 0, true)
/// })
/// .unwrap();
///
/// assert!(keys.xpub().starts_with("tpub"));
/// assert_eq!(keys.derivation_path(), "m/48'/1'/0'/2'");
/// ```
pub fn derive_account_keys<C: SignerCard>(
    session: &mut CardSession<C>,
    pin: &str,
    account: u32,
    multisig: bool,
) -> Result<AccountKeys> {
    let single_sig = fetch_account_key(session, pin, ScriptType::P2wpkh, account)?;
    let multi_sig = fetch_account_key(session, pin, ScriptType::P2wsh, account)?;
    let master_fingerprint = session.get_master_xfp()?;

    info!(%master_fingerprint, account, multisig, "derived account keys");

    Ok(AccountKeys {
        single_sig,
        multi_sig,
        master_fingerprint,
        multisig,
    })
}

fn fetch_account_key<C: SignerCard>(
    session: &mut CardSession<C>,
    pin: &str,
    script_type: ScriptType,
    account: u32,
) -> Result<ExtendedKeyMaterial> {
    let network = session.config().network;
    let derivation_path = script_type.account_path(account, network)?;
    if session.config().reverify_pin_per_key {
        session.verify_pin(pin)?;
    }

    let mainnet_xpub = session.get_xpub(&derivation_path, script_type)?;
    let decoded =
        Xpub::from_str(&mainnet_xpub).map_err(|e| Error::InvalidExtendedKey(e.to_string()))?;

    let xpub = if network.is_mainnet() {
        mainnet_xpub
    } else {
        convert_version(&mainnet_xpub, network)?
    };
    debug!(%script_type, path = %derivation_path, "fetched account key");

    Ok(ExtendedKeyMaterial {
        public_key: decoded.public_key.serialize(),
        chain_code: decoded.chain_code.to_bytes(),
        xpub,
        derivation_path,
        script_type,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::card::{CardCommand, EmulatedCard};
    use crate::config::SignerConfig;
    use crate::session::with_session;
    use crate::xpub::Network;

    const SEED: [u8; 32] = [0x11; 32];

    fn derive(config: &SignerConfig, multisig: bool) -> (AccountKeys, Vec<CardCommand>) {
        let card = EmulatedCard::new(&SEED, "1234").unwrap();
        let journal = card.journal();
        let keys = with_session(card, config, |session| {
            session.verify_pin("1234")?;
            derive_account_keys(session, "1234", 0, multisig)
        })
        .unwrap();
        (keys, journal.commands())
    }

    #[test]
    fn reverifies_before_each_key() {
        let (_, commands) = derive(&SignerConfig::default(), false);
        assert_eq!(
            commands,
            vec![
                CardCommand::PowerUp,
                CardCommand::SelectApplet,
                CardCommand::VerifyPin,
                CardCommand::VerifyPin,
                CardCommand::GetXpub,
                CardCommand::VerifyPin,
                CardCommand::GetXpub,
                CardCommand::GetMasterXfp,
                CardCommand::EndSession,
            ]
        );
    }

    #[test]
    fn reverification_can_be_disabled() {
        let config = SignerConfig {
            reverify_pin_per_key: false,
            ..SignerConfig::default()
        };
        let (_, commands) = derive(&config, false);
        assert_eq!(commands.iter().filter(|c| **c == CardCommand::VerifyPin).count(), 1);
    }

    #[test]
    fn mainnet_selection() {
        let (keys, _) = derive(&SignerConfig::default(), false);
        assert!(keys.xpub().starts_with("xpub"));
        assert_eq!(keys.derivation_path(), "m/84'/0'/0'");
        assert_eq!(keys.multi_sig.derivation_path.to_string(), "m/48'/0'/0'/2'");

        let card = EmulatedCard::new(&SEED, "1234").unwrap();
        assert_eq!(keys.master_fingerprint, card.master_fingerprint().unwrap());
    }

    #[test]
    fn testnet_keys_are_converted() {
        let (mainnet, _) = derive(&SignerConfig::default(), true);
        let (testnet, _) = derive(&SignerConfig::for_network(Network::Testnet), true);

        assert!(testnet.single_sig.xpub.starts_with("tpub"));
        assert!(testnet.multi_sig.xpub.starts_with("tpub"));
        assert_eq!(testnet.derivation_path(), "m/48'/1'/0'/2'");
        assert_ne!(mainnet.multi_sig.public_key, testnet.multi_sig.public_key);
    }

    #[test]
    fn xpub_details_cover_both_keys() {
        let (keys, _) = derive(&SignerConfig::default(), true);
        let details = keys.xpub_details();
        assert_eq!(details.p2wpkh.derivation_path, "m/84'/0'/0'");
        assert_eq!(details.p2wsh.xpub, keys.multi_sig.xpub);

        let json = serde_json::to_value(&details).unwrap();
        assert!(json.get("P2WPKH").is_some());
        assert!(json.get("P2WSH").is_some());
    }

    #[test]
    fn hardened_account_index_is_rejected() {
        let card = EmulatedCard::new(&SEED, "1234").unwrap();
        let journal = card.journal();
        let err = with_session(card, &SignerConfig::default(), |session| {
            session.verify_pin("1234")?;
            derive_account_keys(session, "1234", 0x8000_0000, false)
        })
        .unwrap_err();

        assert!(matches!(err, Error::InvalidPath(_)));
        assert_eq!(journal.count(CardCommand::GetXpub), 0);
        assert_eq!(journal.count(CardCommand::VerifyPin), 1);
        assert_eq!(journal.count(CardCommand::EndSession), 1);
    }

    #[test]
    fn key_material_matches_xpub() {
        let (keys, _) = derive(&SignerConfig::default(), false);
        let decoded = Xpub::from_str(&keys.single_sig.xpub).unwrap();
        assert_eq!(decoded.public_key.serialize(), keys.single_sig.public_key);
        assert_eq!(decoded.depth, 3);
    }
}
