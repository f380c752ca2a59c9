//! Error types for the hardware signer library.
//!
//! This module provides the error type [`enum@Error`] shared by every layer of
//! the crate, from raw APDU exchange up to batch signing.
//!
//! # Error Categories
//!
//! - **Transport errors**: the card or Bluetooth device is unreachable
//! - **PIN and provisioning errors**: wrong PIN, blocked PIN, card not set up or not seeded
//! - **Protocol errors**: unexpected status words and malformed responses
//! - **Signature and path errors**: DER decoding and derivation path grammar
//! - **Orchestration errors**: wrong device and aborted signing batches
//!
//! # Example
//!
//! ```
//! use hw_signer_core::Error;
//!
//! let err = Error::WrongPin { remaining: Some(2) };
//! assert!(err.is_retriable());
//! assert!(!Error::PinBlocked.is_retriable());
//! ```

use core::result::Result as CoreResult;

use base64::DecodeError as Base64DecodeError;
use hex::FromHexError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Message shown when an error renders to an empty string.
const FALLBACK_MESSAGE: &str = "Something went wrong, please try again!";

/// The main error type for the hardware signer library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// No reader or signing device was found.
    #[error("no signing device found")]
    DeviceNotFound,

    /// The device is unreachable or the link broke mid-command.
    #[error("transport error: {0}")]
    Transport(String),

    /// No device responded within the bounded wait.
    #[error("timed out waiting for the signing device")]
    Timeout,

    /// The device does not expose the expected applet.
    #[error("signing applet not found on the card")]
    AppletNotFound,

    // =========================================================================
    // PIN and Provisioning Errors
    // =========================================================================
    /// The PIN was rejected. The device decremented its retry counter.
    #[error("wrong PIN{}", .remaining.map_or_else(String::new, |n| format!(" ({n} attempts left)")))]
    WrongPin {
        /// Remaining attempts reported by the device, if any.
        remaining: Option<u8>,
    },

    /// The PIN retry counter is exhausted.
    #[error("PIN is blocked after too many failed attempts")]
    PinBlocked,

    /// A command needing PIN authentication was issued before verification.
    #[error("PIN must be verified before this command")]
    PinNotVerified,

    /// The card has no PIN configured yet.
    #[error("card is not set up; set a new PIN and seed in the setup options")]
    NotSetup,

    /// The card has no BIP32 seed.
    #[error("card is not seeded; import a seed in the setup options")]
    NotSeeded,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The card returned an unexpected status word.
    #[error("unexpected status word: SW1={0:#04x}, SW2={1:#04x}")]
    UnexpectedStatusWord(u8, u8),

    /// The response from the device was malformed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The applet only accepts commands over an encrypted secure channel.
    #[error("card requires a secure channel, which this client does not open")]
    SecureChannelRequired,

    /// The Bluetooth signer SDK reported a failure.
    #[error("device operation failed: {0}")]
    Device(String),

    // =========================================================================
    // Signature and Path Errors
    // =========================================================================
    /// A DER signature could not be decoded.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// A derivation path does not match the BIP32 path grammar.
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    /// An extended public key or raw public key is invalid.
    #[error("invalid extended key: {0}")]
    InvalidExtendedKey(String),

    /// A normalized signature did not verify against the derived key.
    #[error("signature for input {0} does not verify against the derived key")]
    SignatureMismatch(u32),

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    /// The connected device is not the one the caller expected.
    #[error(
        "wrong device used (expected fingerprint {expected}, found {actual}); please use the same one selected for signing"
    )]
    WrongDevice {
        /// Fingerprint supplied by the caller.
        expected: String,
        /// Fingerprint reported by the connected device.
        actual: String,
    },

    /// A signing batch stopped at its first failing input.
    #[error("signing aborted at input {input_index}: {source}")]
    SigningAborted {
        /// Index of the input that failed.
        input_index: u32,
        /// The underlying failure.
        source: Box<Error>,
    },

    /// A request in the batch already carries a signature.
    #[error("signature slot for input {0} is already filled")]
    SignatureSlotFilled(u32),

    /// A seed to import has an unsupported length.
    #[error("seed must be 16 to 64 bytes, got {0}")]
    InvalidSeedLength(usize),

    /// A PIN does not fit the card's limits.
    #[error("PIN must be 1 to {max} bytes")]
    InvalidPinLength {
        /// Largest accepted PIN length.
        max: usize,
    },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Failed to parse hex data.
    #[error("hex decoding failed: {0}")]
    HexDecodeFailed(String),

    /// Failed to parse base64 data.
    #[error("base64 decoding failed: {0}")]
    Base64DecodeFailed(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    JsonError(String),
}

impl Error {
    /// Returns `true` when the caller may retry, usually after re-presenting
    /// the device or re-prompting for the PIN.
    ///
    /// # Example
    ///
    /// ```
    /// use hw_signer_core::Error;
    ///
    /// assert!(Error::Timeout.is_retriable());
    /// assert!(!Error::NotSeeded.is_retriable());
    /// ```
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::Timeout
            | Self::DeviceNotFound
            | Self::WrongPin { .. }
            | Self::WrongDevice { .. } => true,
            Self::SigningAborted { source, .. } => source.is_retriable(),
            _ => false,
        }
    }

    /// Formats the error for display to the end user.
    ///
    /// Presentation (toasts, platform NFC sheets) is up to the caller; this
    /// only guarantees a non-empty message.
    #[must_use]
    pub fn user_message(&self) -> String {
        let message = self.to_string();
        if message.trim().is_empty() {
            FALLBACK_MESSAGE.to_string()
        } else {
            message
        }
    }

    /// Prefixes transport failures with the command that was in flight.
    #[must_use]
    pub(crate) fn in_command(self, command: impl core::fmt::Display) -> Self {
        match self {
            Self::Transport(msg) => Self::Transport(format!("{command}: {msg}")),
            Self::MalformedResponse(msg) => Self::MalformedResponse(format!("{command}: {msg}")),
            other => other,
        }
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Self::HexDecodeFailed(err.to_string())
    }
}

impl From<Base64DecodeError> for Error {
    fn from(err: Base64DecodeError) -> Self {
        Self::Base64DecodeFailed(err.to_string())
    }
}

impl From<SerdeJsonError> for Error {
    fn from(err: SerdeJsonError) -> Self {
        Self::JsonError(err.to_string())
    }
}

/// A specialized [`Result`] type for signer operations.
pub type Result<T> = CoreResult<T, Error>;
