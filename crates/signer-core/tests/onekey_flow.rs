//! OneKey client flows against a scripted SDK bridge.

// Silence unused crate dependency warnings for test binary
use bitcoin as _;
use hex as _;
#[cfg(feature = "pcsc")]
use pcsc as _;
use serde as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

use std::cell::RefCell;
use std::rc::Rc;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use hw_signer_core::onekey::{
    OneKeyBridge, OneKeyClient, OneKeyInitOptions, PublicKeyParams, SdkResponse, SignPsbtParams,
};
use hw_signer_core::{Error, Network, Result};
use pretty_assertions::assert_eq;
use serde_json::json;

const CONNECT_ID: &str = "AA:BB:CC:DD";
const DEVICE_ID: &str = "onekey-classic-01";
const ROOT_FINGERPRINT: u32 = 0x0a1b_2c3d;

/// Calls observed by the fake SDK.
#[derive(Debug, Default)]
struct Calls {
    init: Vec<OneKeyInitOptions>,
    public_keys: Vec<String>,
    sign: Vec<SignPsbtParams>,
    disposed: usize,
}

/// A fake SDK answering from fixed data.
struct FakeBridge {
    calls: Rc<RefCell<Calls>>,
    signed_psbt: String,
    fail_sign: bool,
}

impl FakeBridge {
    fn new(signed_psbt: &str) -> (Self, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let bridge = Self {
            calls: Rc::clone(&calls),
            signed_psbt: signed_psbt.to_string(),
            fail_sign: false,
        };
        (bridge, calls)
    }
}

impl OneKeyBridge for FakeBridge {
    fn init(&mut self, options: &OneKeyInitOptions) -> Result<()> {
        self.calls.borrow_mut().init.push(*options);
        Ok(())
    }

    fn search_devices(&mut self) -> Result<SdkResponse> {
        Ok(SdkResponse::ok(json!([
            { "connectId": CONNECT_ID, "name": "OneKey Classic" }
        ])))
    }

    fn get_features(&mut self, connect_id: &str) -> Result<SdkResponse> {
        if connect_id == CONNECT_ID {
            Ok(SdkResponse::ok(json!({ "device_id": DEVICE_ID })))
        } else {
            Ok(SdkResponse::ok(json!({})))
        }
    }

    fn btc_get_public_key(
        &mut self,
        _connect_id: &str,
        _device_id: &str,
        params: &PublicKeyParams,
    ) -> Result<SdkResponse> {
        self.calls.borrow_mut().public_keys.push(params.path.clone());
        Ok(SdkResponse::ok(json!({
            "xpub": format!("xpub-{}", params.path),
            "root_fingerprint": ROOT_FINGERPRINT,
        })))
    }

    fn btc_sign_psbt(
        &mut self,
        _connect_id: &str,
        _device_id: &str,
        params: &SignPsbtParams,
    ) -> Result<SdkResponse> {
        self.calls.borrow_mut().sign.push(params.clone());
        if self.fail_sign {
            return Ok(SdkResponse::failure("User cancelled"));
        }
        Ok(SdkResponse::ok(json!({ "psbt": self.signed_psbt })))
    }

    fn dispose(&mut self) {
        self.calls.borrow_mut().disposed += 1;
    }
}

#[test]
fn lifecycle_is_explicit() {
    let (bridge, calls) = FakeBridge::new("");
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);

    assert!(matches!(client.search_devices(), Err(Error::Device(_))));

    client.init().unwrap();
    client.init().unwrap();
    let devices = client.search_devices().unwrap();
    assert_eq!(devices[0].connect_id, CONNECT_ID);

    client.dispose();
    drop(client);

    let calls = calls.borrow();
    assert_eq!(
        calls.init,
        vec![OneKeyInitOptions {
            debug: false,
            fetch_config: true
        }]
    );
    assert_eq!(calls.disposed, 1);
}

#[test]
fn drop_disposes() {
    let (bridge, calls) = FakeBridge::new("");
    {
        let mut client = OneKeyClient::new(bridge, Network::Mainnet);
        client.init().unwrap();
    }
    assert_eq!(calls.borrow().disposed, 1);
}

#[test]
fn device_id_required() {
    let (bridge, _) = FakeBridge::new("");
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);
    client.init().unwrap();

    assert_eq!(client.device_id(CONNECT_ID).unwrap(), DEVICE_ID);
    assert!(matches!(client.device_id("unknown"), Err(Error::Device(_))));
}

#[test]
fn signer_data_on_testnet() {
    let (bridge, calls) = FakeBridge::new("");
    let mut client = OneKeyClient::new(bridge, Network::Testnet);
    client.init().unwrap();

    let data = client.fetch_signer_data(CONNECT_ID, DEVICE_ID, 2).unwrap();

    assert_eq!(data.single_sig_path, "m/84'/1'/2'");
    assert_eq!(data.multi_sig_path, "m/48'/1'/2'/2'");
    assert_eq!(data.taproot_path, "m/86'/1'/2'");
    assert_eq!(data.taproot_xpub, "xpub-m/86'/1'/2'");
    assert_eq!(data.mfp, "0A1B2C3D");
    assert_eq!(calls.borrow().public_keys.len(), 3);
}

#[test]
fn hardened_account_is_rejected_before_any_request() {
    let (bridge, calls) = FakeBridge::new("");
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);
    client.init().unwrap();

    let err = client
        .fetch_signer_data(CONNECT_ID, DEVICE_ID, 0x8000_0000)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPath(_)));
    assert!(calls.borrow().public_keys.is_empty());
}

#[test]
fn sign_psbt_transcodes() {
    let (bridge, calls) = FakeBridge::new("0x70736274ff01");
    let mut client = OneKeyClient::new(bridge, Network::Testnet);
    client.init().unwrap();

    let unsigned = BASE64_STANDARD.encode([0x70, 0x73, 0x62, 0x74, 0xff, 0x00]);
    let signed = client
        .sign_psbt(CONNECT_ID, DEVICE_ID, Some("0a1b2c3d"), &unsigned)
        .unwrap();

    assert_eq!(
        BASE64_STANDARD.decode(signed).unwrap(),
        vec![0x70, 0x73, 0x62, 0x74, 0xff, 0x01]
    );
    let calls = calls.borrow();
    assert_eq!(calls.sign[0].psbt, "70736274ff00");
    assert_eq!(calls.sign[0].coin, "TEST");
}

#[test]
fn sign_psbt_passes_base64_through() {
    let (bridge, _) = FakeBridge::new("cHNidP8B");
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);
    client.init().unwrap();

    let signed = client
        .sign_psbt(CONNECT_ID, DEVICE_ID, None, "cHNidP8A")
        .unwrap();
    assert_eq!(signed, "cHNidP8B");
}

#[test]
fn wrong_device_signs_nothing() {
    let (bridge, calls) = FakeBridge::new("cHNidP8B");
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);
    client.init().unwrap();

    let err = client
        .sign_psbt(CONNECT_ID, DEVICE_ID, Some("FFFFFFFF"), "cHNidP8A")
        .unwrap_err();
    assert!(matches!(err, Error::WrongDevice { .. }));
    assert!(calls.borrow().sign.is_empty());
}

#[test]
fn sdk_failure_surfaces_message() {
    let (mut bridge, _) = FakeBridge::new("");
    bridge.fail_sign = true;
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);
    client.init().unwrap();

    let err = client
        .sign_psbt(CONNECT_ID, DEVICE_ID, None, "cHNidP8A")
        .unwrap_err();
    assert_eq!(err.to_string(), "device operation failed: User cancelled");
}

#[test]
fn rejects_non_base64_input() {
    let (bridge, _) = FakeBridge::new("");
    let mut client = OneKeyClient::new(bridge, Network::Mainnet);
    client.init().unwrap();

    assert!(matches!(
        client.sign_psbt(CONNECT_ID, DEVICE_ID, None, "not base64!"),
        Err(Error::Base64DecodeFailed(_))
    ));
}
