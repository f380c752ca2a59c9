//! Networks, script types and extended public key encodings.
//!
//! Accounts are derived at fixed purpose paths:
//!
//! | Script type | Path                        |
//! |-------------|-----------------------------|
//! | P2WPKH      | `m/84'/coin'/account'`      |
//! | P2WSH       | `m/48'/coin'/account'/2'`   |
//! | P2TR        | `m/86'/coin'/account'`      |
//!
//! where `coin` is `0` on mainnet and `1` on testnet.
//!
//! Devices emit mainnet (`xpub`) encodings. [`convert_version`] swaps the
//! four version bytes for the requested network without re-deriving.

use core::fmt;

use bitcoin::NetworkKind;
use bitcoin::base58;
use bitcoin::bip32::{ChainCode, ChildNumber, Fingerprint as Bip32Fingerprint, Xpub};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::path::{DerivationPath, HARDENED};

/// Version bytes of a mainnet extended public key (`xpub`).
pub const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];

/// Version bytes of a testnet extended public key (`tpub`).
pub const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

/// Length of a serialized extended key, before the Base58Check checksum.
const EXTENDED_KEY_LEN: usize = 78;

/// The Bitcoin network a session operates on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet.
    #[default]
    Mainnet,

    /// Bitcoin testnet (also used for signet and regtest).
    Testnet,
}

impl Network {
    /// Returns the BIP44 coin type: `0` for mainnet, `1` for testnet.
    #[must_use]
    pub const fn coin_type(self) -> u32 {
        match self {
            Self::Mainnet => 0,
            Self::Testnet => 1,
        }
    }

    /// Returns `true` for mainnet.
    #[must_use]
    pub const fn is_mainnet(self) -> bool {
        matches!(self, Self::Mainnet)
    }

    /// Returns the extended key version bytes for this network.
    #[must_use]
    pub const fn xpub_version(self) -> [u8; 4] {
        match self {
            Self::Mainnet => XPUB_VERSION,
            Self::Testnet => TPUB_VERSION,
        }
    }

    const fn kind(self) -> NetworkKind {
        match self {
            Self::Mainnet => NetworkKind::Main,
            Self::Testnet => NetworkKind::Test,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => f.write_str("mainnet"),
            Self::Testnet => f.write_str("testnet"),
        }
    }
}

/// Output script conventions with a fixed derivation purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    /// Native SegWit single signature (BIP84).
    P2wpkh,

    /// Native SegWit multisig (BIP48, script type 2).
    P2wsh,

    /// Taproot single signature (BIP86).
    P2tr,
}

impl ScriptType {
    /// Returns the BIP43 purpose constant.
    #[must_use]
    pub const fn purpose(self) -> u32 {
        match self {
            Self::P2wpkh => 84,
            Self::P2wsh => 48,
            Self::P2tr => 86,
        }
    }

    /// Returns the script type name used in device commands.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P2wpkh => "p2wpkh",
            Self::P2wsh => "p2wsh",
            Self::P2tr => "p2tr",
        }
    }

    /// Returns the account-level derivation path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] if `account` has the hardened bit set.
    ///
    /// # Example
    ///
    /// ```
    /// use hw_signer_core::{Network, ScriptType};
    ///
    /// let path = ScriptType::P2wsh.account_path(0, Network::Testnet).unwrap();
    /// assert_eq!(path.to_string(), "m/48'/1'/0'/2'");
    /// assert!(ScriptType::P2wsh.account_path(1 << 31, Network::Testnet).is_err());
    /// ```
    pub fn account_path(self, account: u32, network: Network) -> Result<DerivationPath> {
        if account >= HARDENED {
            return Err(Error::InvalidPath(format!("account {account} is out of range")));
        }
        let mut indices = vec![
            self.purpose() | HARDENED,
            network.coin_type() | HARDENED,
            account | HARDENED,
        ];
        if self == Self::P2wsh {
            indices.push(2 | HARDENED);
        }
        Ok(DerivationPath::from_indices(indices))
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public key material returned by one extended-key query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedKeyMaterial {
    /// Compressed SEC1 public key.
    #[serde(with = "crate::hex_serde")]
    pub public_key: [u8; 33],

    /// BIP32 chain code.
    #[serde(with = "crate::hex_serde")]
    pub chain_code: [u8; 32],

    /// Base58Check extended public key in the session network's encoding.
    pub xpub: String,

    /// Path the key was derived at.
    pub derivation_path: DerivationPath,

    /// Script convention the path belongs to.
    pub script_type: ScriptType,
}

/// An extended public key and the path it was derived at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpubEntry {
    /// Base58Check extended public key.
    pub xpub: String,

    /// Derivation path in text form.
    pub derivation_path: String,
}

impl From<&ExtendedKeyMaterial> for XpubEntry {
    fn from(material: &ExtendedKeyMaterial) -> Self {
        Self {
            xpub: material.xpub.clone(),
            derivation_path: material.derivation_path.to_string(),
        }
    }
}

/// Per-script-type extended keys of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct XpubDetails {
    /// Single-signature key.
    pub p2wpkh: XpubEntry,

    /// Multisig key.
    pub p2wsh: XpubEntry,
}

/// Fields needed to serialize a BIP32 extended public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpubParts {
    /// Compressed public key.
    pub public_key: [u8; 33],

    /// Chain code.
    pub chain_code: [u8; 32],

    /// Number of derivation steps from the master key.
    pub depth: u8,

    /// Fingerprint of the parent key (zero for the master key).
    pub parent_fingerprint: Fingerprint,

    /// Last child index, hardened bit included.
    pub child_number: u32,
}

/// Encodes an extended public key with the given network's version bytes.
///
/// # Errors
///
/// Returns [`Error::InvalidExtendedKey`] if `public_key` is not a valid
/// compressed secp256k1 point.
pub fn encode_xpub(parts: &XpubParts, network: Network) -> Result<String> {
    let public_key = PublicKey::from_slice(&parts.public_key)
        .map_err(|e| Error::InvalidExtendedKey(e.to_string()))?;

    let xpub = Xpub {
        network: network.kind(),
        depth: parts.depth,
        parent_fingerprint: Bip32Fingerprint::from(parts.parent_fingerprint.to_bytes()),
        child_number: ChildNumber::from(parts.child_number),
        public_key,
        chain_code: ChainCode::from(parts.chain_code),
    };

    Ok(xpub.to_string())
}

/// Re-encodes an extended public key with the version bytes of `network`.
///
/// Accepts `xpub` or `tpub` input. The key itself is not re-derived.
///
/// # Errors
///
/// Returns [`Error::InvalidExtendedKey`] if the string is not valid
/// Base58Check, has the wrong length, or carries an unknown version.
///
/// # Example
///
/// ```
/// use hw_signer_core::{Network, xpub::convert_version};
///
/// let xpub = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
/// let tpub = convert_version(xpub, Network::Testnet).unwrap();
/// assert!(tpub.starts_with("tpub"));
/// assert_eq!(convert_version(&tpub, Network::Mainnet).unwrap(), xpub);
/// ```
pub fn convert_version(xpub: &str, network: Network) -> Result<String> {
    let mut data = base58::decode_check(xpub)
        .map_err(|e| Error::InvalidExtendedKey(format!("base58check: {e}")))?;

    if data.len() != EXTENDED_KEY_LEN {
        return Err(Error::InvalidExtendedKey(format!(
            "expected {EXTENDED_KEY_LEN} bytes, got {}",
            data.len()
        )));
    }
    if data[..4] != XPUB_VERSION && data[..4] != TPUB_VERSION {
        return Err(Error::InvalidExtendedKey(format!(
            "unsupported version bytes {}",
            hex::encode(&data[..4])
        )));
    }

    data[..4].copy_from_slice(&network.xpub_version());
    Ok(base58::encode_check(&data))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    // BIP32 test vector 1, chain m.
    const TV1_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    const TV1_PUBKEY: &str = "0339a36013301597daef41fbe593a02cc513d0b55527ec2df1050e2e8ff49c85c2";
    const TV1_CHAIN_CODE: &str = "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508";

    fn tv1_parts() -> XpubParts {
        XpubParts {
            public_key: hex::decode(TV1_PUBKEY).unwrap().try_into().unwrap(),
            chain_code: hex::decode(TV1_CHAIN_CODE).unwrap().try_into().unwrap(),
            depth: 0,
            parent_fingerprint: Fingerprint::default(),
            child_number: 0,
        }
    }

    #[test]
    fn account_paths() {
        assert_eq!(
            ScriptType::P2wpkh.account_path(0, Network::Mainnet).unwrap().to_string(),
            "m/84'/0'/0'"
        );
        assert_eq!(
            ScriptType::P2wsh.account_path(3, Network::Mainnet).unwrap().to_string(),
            "m/48'/0'/3'/2'"
        );
        assert_eq!(
            ScriptType::P2tr.account_path(1, Network::Testnet).unwrap().to_string(),
            "m/86'/1'/1'"
        );
    }

    #[test]
    fn account_with_hardened_bit_is_rejected() {
        assert_eq!(
            ScriptType::P2wpkh
                .account_path(HARDENED - 1, Network::Mainnet)
                .unwrap()
                .to_string(),
            "m/84'/0'/2147483647'"
        );
        for account in [HARDENED, HARDENED | 1, u32::MAX] {
            assert!(matches!(
                ScriptType::P2wpkh.account_path(account, Network::Mainnet),
                Err(Error::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn encode_master_xpub() {
        assert_eq!(encode_xpub(&tv1_parts(), Network::Mainnet).unwrap(), TV1_XPUB);
    }

    #[test]
    fn encode_testnet_matches_conversion() {
        let tpub = encode_xpub(&tv1_parts(), Network::Testnet).unwrap();
        assert!(tpub.starts_with("tpub"));
        assert_eq!(convert_version(TV1_XPUB, Network::Testnet).unwrap(), tpub);
    }

    #[test]
    fn encode_rejects_bad_point() {
        let mut parts = tv1_parts();
        parts.public_key = [0x05; 33];
        assert!(matches!(
            encode_xpub(&parts, Network::Mainnet),
            Err(Error::InvalidExtendedKey(_))
        ));
    }

    #[test]
    fn convert_is_idempotent() {
        let once = convert_version(TV1_XPUB, Network::Testnet).unwrap();
        let twice = convert_version(&once, Network::Testnet).unwrap();
        assert_eq!(once, twice);
        assert_eq!(convert_version(TV1_XPUB, Network::Mainnet).unwrap(), TV1_XPUB);
    }

    #[test]
    fn convert_rejects_garbage() {
        assert!(convert_version("not-base58", Network::Testnet).is_err());

        // valid base58check, wrong payload length
        let short = base58::encode_check(&[0x04, 0x88, 0xB2, 0x1E, 0x00]);
        assert!(convert_version(&short, Network::Testnet).is_err());

        // zpub version bytes
        let mut data = base58::decode_check(TV1_XPUB).unwrap();
        data[..4].copy_from_slice(&[0x04, 0xB2, 0x47, 0x46]);
        let zpub = base58::encode_check(&data);
        assert!(convert_version(&zpub, Network::Testnet).is_err());
    }

    #[test]
    fn xpub_details_serde_keys() {
        let details = XpubDetails {
            p2wpkh: XpubEntry {
                xpub: "a".into(),
                derivation_path: "m/84'/0'/0'".into(),
            },
            p2wsh: XpubEntry {
                xpub: "b".into(),
                derivation_path: "m/48'/0'/0'/2'".into(),
            },
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["P2WPKH"]["derivationPath"], "m/84'/0'/0'");
        assert_eq!(json["P2WSH"]["xpub"], "b");
    }

    #[test]
    fn network_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Network::Testnet).unwrap(), "\"testnet\"");
        assert_eq!(Network::Testnet.xpub_version(), TPUB_VERSION);
    }
}
