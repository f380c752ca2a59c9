//! Hardware Signer Core Library
//!
//! This crate provides the core functionality for signing Bitcoin
//! transactions with hardware signers: Satochip smart cards over NFC or
//! contact readers, and OneKey devices over Bluetooth.
//!
//! # Overview
//!
//! Hardware signers return ECDSA signatures in DER form with whatever `s`
//! value the device produced. Wallets need fixed-width 64-byte signatures
//! with `s` in the lower half of the curve order (BIP-62). This library
//! provides:
//!
//! - **Signature Normalization**: DER decoding and low-S normalization
//! - **Derivation Paths**: BIP32 path validation and composition
//! - **Card Sessions**: a state machine with guaranteed session teardown
//! - **Key Derivation**: per-script-type account keys and master fingerprints
//! - **Batch Signing**: ordered signing with fail-fast device checks
//! - **Card Management**: setup, PIN change, seed import and authenticity checks
//! - **OneKey**: the same flows over the OneKey SDK
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application Layer                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │   manage    │    derive    │     sign     │     onekey       │
//! ├─────────────────────────────────────────────────────────────┤
//! │              CardSession (state machine, teardown)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │   SignerCard: SatochipCard<T> | EmulatedCard                 │
//! │  ┌─────────┐  ┌─────────┐  ┌──────────┐  ┌────────────────┐ │
//! │  │  APDU   │  │  crypto │  │   path   │  │   Transport    │ │
//! │  │ Encode  │  │ DER/lowS│  │  BIP32   │  │  Abstraction   │ │
//! │  └─────────┘  └─────────┘  └──────────┘  └────────────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │             Transport Layer (PC/SC / NFC bridge)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Normalizing a Card Signature
//!
//! ```rust
//! use hw_signer_core::crypto::{decode_and_normalize, is_low_s};
//!
//! let der = hex::decode(
//!     "3044\
//!      0220 1111111111111111111111111111111111111111111111111111111111111111\
//!      0220 7fffffffffffffffffffffffffffffff5d576e7357a4501ddfe92f46681b20a1"
//!         .replace(' ', ""),
//! )
//! .unwrap();
//!
//! let signature = decode_and_normalize(&der).unwrap();
//! assert!(is_low_s(signature.s()));
//! assert_eq!(signature.to_bytes().len(), 64);
//! ```
//!
//! ## Composing Key Paths
//!
//! ```rust
//! use hw_signer_core::path::{compose, validate};
//!
//! let path = compose("m/84'/0'/0'/", "/0/7").unwrap();
//! assert_eq!(path, "m/84'/0'/0'/0/7");
//! assert!(validate("84/0/0").is_err());
//! ```
//!
//! ## Signing a Batch
//!
//! ```rust
//! use hw_signer_core::card::EmulatedCard;
//! use hw_signer_core::sign::{SignatureRequest, SignatureRequestBatch, sign_with_card};
//! use hw_signer_core::SignerConfig;
//!
//! let card = EmulatedCard::new(&[3u8; 32], "1234").unwrap();
//! let batch = SignatureRequestBatch(vec![SignatureRequest {
//!     digest: [0xAB; 32],
//!     sub_path: "0/0".to_string(),
//!     input_index: 0,
//!     sighash_type: 1,
//!     public_key: String::new(),
//!     signature: None,
//! }]);
//!
//! let signed = sign_with_card(card, &SignerConfig::default(), None, &batch, "1234", "m/84'/0'/0'")
//!     .unwrap();
//! assert!(signed.is_fully_signed());
//! ```
//!
//! # Card Integration
//!
//! The library provides a transport-agnostic interface for card communication.
//! Implement the [`card::Transport`] trait for your platform:
//!
//! - **Native**: Use PC/SC for desktop readers (feature `pcsc`)
//! - **Mobile**: Bridge the platform NFC stack to [`card::Transport`]
//!
//! ```ignore
//! use hw_signer_core::card::{PcscTransport, SatochipCard};
//! use hw_signer_core::manage::get_card_details;
//!
//! let card = SatochipCard::new(PcscTransport::connect(None)?);
//! let details = get_card_details(card, &SignerConfig::default(), "1234", 0, false)?;
//! ```
//!
//! # Feature Flags
//!
//! - `pcsc`: enables [`card::PcscTransport`] for PC/SC readers
//!
//! # Security Considerations
//!
//! - Private keys never leave the card
//! - A wrong PIN is reported, never retried
//! - Signing stops before any signature is produced when the card's
//!   fingerprint does not match the expected one
//! - Signatures are normalized to low-S form to prevent malleability

// Modules
pub mod card;
pub mod config;
pub mod crypto;
pub mod derive;
pub mod error;
pub mod fingerprint;
mod hex_serde;
pub mod manage;
pub mod onekey;
pub mod path;
pub mod session;
pub mod sign;
pub mod signature;
pub mod xpub;

// Re-exports for convenience
pub use config::SignerConfig;
pub use derive::{AccountKeys, derive_account_keys};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use path::DerivationPath;
pub use session::{CardSession, SessionState, with_session};
pub use sign::{SignatureRequest, SignatureRequestBatch, sign_batch};
pub use signature::NormalizedSignature;
pub use xpub::{Network, ScriptType};

#[cfg(test)]
use tracing_subscriber as _;
