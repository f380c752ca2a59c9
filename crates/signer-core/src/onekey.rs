//! OneKey Bluetooth signer.
//!
//! The OneKey SDK is reached through the [`OneKeyBridge`] trait, one method
//! per SDK call. Every call answers with an [`SdkResponse`] envelope:
//!
//! ```json
//! { "success": false, "payload": { "error": "Device disconnected" } }
//! ```
//!
//! [`OneKeyClient`] owns a bridge for the length of a wallet flow and gives
//! it an explicit lifecycle: [`OneKeyClient::init`] before use,
//! [`OneKeyClient::dispose`] after (also run on drop).
//!
//! # Example
//!
//! ```ignore
//! let mut client = OneKeyClient::new(bridge, Network::Mainnet);
//! client.init()?;
//!
//! let device = client.search_devices()?.remove(0);
//! let device_id = client.device_id(&device.connect_id)?;
//! let signer = client.fetch_signer_data(&device.connect_id, &device_id, 0)?;
//!
//! let signed = client.sign_psbt(&device.connect_id, &device_id, Some(&signer.mfp), &psbt)?;
//! ```

use core::fmt;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::path::DerivationPath;
use crate::sign::{ensure_device, requested_fingerprint};
use crate::xpub::{Network, ScriptType};

/// Message used when the SDK reports failure without details.
const DEFAULT_FAILURE: &str = "OneKey device operation failed";

/// SDK initialization options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneKeyInitOptions {
    /// Enables SDK debug logging.
    pub debug: bool,

    /// Lets the SDK fetch its remote configuration.
    pub fetch_config: bool,
}

impl Default for OneKeyInitOptions {
    fn default() -> Self {
        Self {
            debug: false,
            fetch_config: true,
        }
    }
}

/// The `{success, payload}` envelope of every SDK call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkResponse {
    /// Whether the call succeeded.
    pub success: bool,

    /// Call result, or `{error, message}` on failure.
    #[serde(default)]
    pub payload: Value,
}

impl SdkResponse {
    /// A successful response carrying `payload`.
    #[must_use]
    pub const fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
        }
    }

    /// A failed response with an error message.
    #[must_use]
    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            payload: serde_json::json!({ "error": error }),
        }
    }

    /// Returns the payload as `T`, or the SDK's error.
    ///
    /// # Errors
    ///
    /// - [`Error::Device`] with the SDK's `error` or `message` if the call failed
    /// - [`Error::JsonError`] if the payload does not match `T`
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T> {
        if !self.success {
            return Err(Error::Device(failure_message(&self.payload)));
        }
        Ok(serde_json::from_value(self.payload)?)
    }
}

fn failure_message(payload: &Value) -> String {
    ["error", "message"]
        .iter()
        .filter_map(|key| payload.get(key).and_then(Value::as_str))
        .find(|msg| !msg.is_empty())
        .unwrap_or(DEFAULT_FAILURE)
        .to_string()
}

/// A device found by [`OneKeyClient::search_devices`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDevice {
    /// Bluetooth connection id.
    pub connect_id: String,

    /// Advertised device name.
    #[serde(default)]
    pub name: Option<String>,

    /// Device id, when the SDK already knows it.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Subset of the device features payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Persistent device id.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Parameters of `btcGetPublicKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyParams {
    /// Derivation path.
    pub path: String,

    /// Whether the device displays the key.
    pub show_on_one_key: bool,
}

/// Subset of the `btcGetPublicKey` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyPayload {
    /// Extended public key.
    #[serde(default)]
    pub xpub: Option<String>,

    /// Master fingerprint as an integer.
    #[serde(default)]
    pub root_fingerprint: Option<u32>,
}

/// Parameters of `btcSignPsbt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignPsbtParams {
    /// Hex-encoded PSBT.
    pub psbt: String,

    /// SDK coin name.
    pub coin: String,
}

#[derive(Debug, Default, Deserialize)]
struct SignedPsbtPayload {
    #[serde(default)]
    psbt: Option<String>,
}

/// The OneKey SDK surface used by the wallet.
pub trait OneKeyBridge {
    /// Initializes the SDK.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the SDK cannot start.
    fn init(&mut self, options: &OneKeyInitOptions) -> Result<()>;

    /// Scans for devices.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the bridge is unreachable.
    fn search_devices(&mut self) -> Result<SdkResponse>;

    /// Reads device features.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the bridge is unreachable.
    fn get_features(&mut self, connect_id: &str) -> Result<SdkResponse>;

    /// Reads an extended public key.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the bridge is unreachable.
    fn btc_get_public_key(
        &mut self,
        connect_id: &str,
        device_id: &str,
        params: &PublicKeyParams,
    ) -> Result<SdkResponse>;

    /// Signs a PSBT.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the bridge is unreachable.
    fn btc_sign_psbt(
        &mut self,
        connect_id: &str,
        device_id: &str,
        params: &SignPsbtParams,
    ) -> Result<SdkResponse>;

    /// Releases the SDK.
    fn dispose(&mut self);
}

/// Account keys and fingerprint read from a OneKey device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneKeySignerData {
    /// BIP48 multisig account path.
    pub multi_sig_path: String,
    /// BIP48 multisig account key.
    pub multi_sig_xpub: String,
    /// BIP84 account path.
    pub single_sig_path: String,
    /// BIP84 account key.
    pub single_sig_xpub: String,
    /// BIP86 account path.
    pub taproot_path: String,
    /// BIP86 account key.
    pub taproot_xpub: String,
    /// Master fingerprint, eight uppercase hex digits.
    pub mfp: String,
}

/// A caller-owned OneKey SDK session.
pub struct OneKeyClient<B: OneKeyBridge> {
    bridge: B,
    network: Network,
    options: OneKeyInitOptions,
    initialized: bool,
}

impl<B: OneKeyBridge> fmt::Debug for OneKeyClient<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneKeyClient")
            .field("network", &self.network)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl<B: OneKeyBridge> OneKeyClient<B> {
    /// Wraps `bridge` for `network`. Call [`OneKeyClient::init`] before use.
    #[must_use]
    pub fn new(bridge: B, network: Network) -> Self {
        Self {
            bridge,
            network,
            options: OneKeyInitOptions::default(),
            initialized: false,
        }
    }

    /// Replaces the SDK init options.
    #[must_use]
    pub fn with_options(mut self, options: OneKeyInitOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the bridge.
    #[must_use]
    pub const fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Initializes the SDK. Does nothing if already initialized.
    ///
    /// # Errors
    ///
    /// Returns the bridge's init error.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.bridge.init(&self.options)?;
        self.initialized = true;
        debug!(network = %self.network, "OneKey SDK initialized");
        Ok(())
    }

    /// Releases the SDK. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.initialized {
            self.bridge.dispose();
            self.initialized = false;
            debug!("OneKey SDK disposed");
        }
    }

    /// Scans for nearby devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] on SDK failure.
    pub fn search_devices(&mut self) -> Result<Vec<SearchDevice>> {
        self.ensure_init()?;
        let devices: Option<Vec<SearchDevice>> = self.bridge.search_devices()?.into_payload()?;
        Ok(devices.unwrap_or_default())
    }

    /// Reads the persistent device id of the device at `connect_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] on SDK failure or when the id is missing.
    pub fn device_id(&mut self, connect_id: &str) -> Result<String> {
        self.ensure_init()?;
        let features: Features = self.bridge.get_features(connect_id)?.into_payload()?;
        features
            .device_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Device("OneKey device_id not returned".to_string()))
    }

    /// Reads the P2WPKH, P2WSH and P2TR account keys and the master
    /// fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] on SDK failure, a missing key, or a missing
    /// fingerprint. Returns [`Error::InvalidPath`] if `account` is 2^31 or
    /// above.
    pub fn fetch_signer_data(
        &mut self,
        connect_id: &str,
        device_id: &str,
        account: u32,
    ) -> Result<OneKeySignerData> {
        self.ensure_init()?;

        let single_sig_path = ScriptType::P2wpkh.account_path(account, self.network)?;
        let multi_sig_path = ScriptType::P2wsh.account_path(account, self.network)?;
        let taproot_path = ScriptType::P2tr.account_path(account, self.network)?;

        let single_sig = self.public_key(connect_id, device_id, &single_sig_path)?;
        let multi_sig = self.public_key(connect_id, device_id, &multi_sig_path)?;
        let taproot = self.public_key(connect_id, device_id, &taproot_path)?;

        let mfp = [&single_sig, &multi_sig, &taproot]
            .iter()
            .find_map(|payload| payload.root_fingerprint)
            .map(Fingerprint::from_u32)
            .ok_or_else(|| Error::Device("OneKey root_fingerprint not returned".to_string()))?;

        info!(%mfp, account, "fetched OneKey signer data");

        Ok(OneKeySignerData {
            multi_sig_path: multi_sig_path.to_string(),
            multi_sig_xpub: require_xpub(multi_sig)?,
            single_sig_path: single_sig_path.to_string(),
            single_sig_xpub: require_xpub(single_sig)?,
            taproot_path: taproot_path.to_string(),
            taproot_xpub: require_xpub(taproot)?,
            mfp: mfp.to_string(),
        })
    }

    /// Signs a base64 PSBT and returns the signed PSBT in base64.
    ///
    /// When `expected_fingerprint` is given, the device's master fingerprint
    /// is checked first and nothing is signed on a mismatch.
    ///
    /// # Errors
    ///
    /// - [`Error::Base64DecodeFailed`] if `psbt_base64` is not base64
    /// - [`Error::WrongDevice`] on fingerprint mismatch
    /// - [`Error::Device`] on SDK failure or when no PSBT is returned
    pub fn sign_psbt(
        &mut self,
        connect_id: &str,
        device_id: &str,
        expected_fingerprint: Option<&str>,
        psbt_base64: &str,
    ) -> Result<String> {
        self.ensure_init()?;
        let psbt = BASE64_STANDARD.decode(psbt_base64.trim())?;

        if requested_fingerprint(expected_fingerprint).is_some() {
            let path = ScriptType::P2wpkh.account_path(0, self.network)?;
            let actual = self
                .public_key(connect_id, device_id, &path)?
                .root_fingerprint
                .map(Fingerprint::from_u32)
                .ok_or_else(|| Error::Device("OneKey root_fingerprint not returned".to_string()))?;
            ensure_device(expected_fingerprint, actual)?;
        }

        let params = SignPsbtParams {
            psbt: hex::encode(psbt),
            coin: coin_name(self.network).to_string(),
        };
        let signed: SignedPsbtPayload = self
            .bridge
            .btc_sign_psbt(connect_id, device_id, &params)?
            .into_payload()?;
        let signed = signed
            .psbt
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Device("OneKey returned no signed PSBT".to_string()))?;

        info!(coin = %params.coin, "OneKey signed PSBT");
        Ok(signed_psbt_to_base64(&signed))
    }

    fn ensure_init(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::Device("OneKey SDK not initialized".to_string()))
        }
    }

    fn public_key(
        &mut self,
        connect_id: &str,
        device_id: &str,
        path: &DerivationPath,
    ) -> Result<PublicKeyPayload> {
        let params = PublicKeyParams {
            path: path.to_string(),
            show_on_one_key: false,
        };
        self.bridge
            .btc_get_public_key(connect_id, device_id, &params)?
            .into_payload()
    }
}

impl<B: OneKeyBridge> Drop for OneKeyClient<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

const fn coin_name(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "Bitcoin",
        Network::Testnet => "TEST",
    }
}

fn require_xpub(payload: PublicKeyPayload) -> Result<String> {
    payload
        .xpub
        .filter(|x| !x.is_empty())
        .ok_or_else(|| Error::Device("OneKey returned an invalid xpub".to_string()))
}

/// Converts a hex PSBT (optionally `0x`-prefixed) to base64. Anything else
/// is assumed to be base64 already and returned unchanged.
fn signed_psbt_to_base64(psbt: &str) -> String {
    let sanitized = psbt.strip_prefix("0x").unwrap_or(psbt);
    match hex::decode(sanitized) {
        Ok(bytes) if !sanitized.is_empty() => BASE64_STANDARD.encode(bytes),
        _ => psbt.to_string(),
    }
}
