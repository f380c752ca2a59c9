//! APDU (Application Protocol Data Unit) command and response types.
//!
//! This module provides types for constructing and parsing ISO 7816-4 APDU
//! commands and responses exchanged with the signing card.
//!
//! # APDU Command Structure
//!
//! ```text
//! | CLA | INS | P1 | P2 | Lc | Data | Le |
//! |-----|-----|----|----|----|----- |----|
//! | 1B  | 1B  | 1B | 1B | 1B | Var  | 1B |
//! ```
//!
//! # APDU Response Structure
//!
//! ```text
//! | Data | SW1 | SW2 |
//! |------|-----|-----|
//! | Var  | 1B  | 1B  |
//! ```
//!
//! Status words other than `0x9000` are mapped onto the crate's error
//! taxonomy by [`ApduResponse::to_error`].
//!
//! # Example
//!
//! ```
//! use hw_signer_core::card::{Apdu, ApduResponse};
//!
//! let apdu = Apdu::new(0xB0, 0x3C, 0x00, 0x00, vec![]);
//! assert_eq!(apdu.to_bytes(), vec![0xB0, 0x3C, 0x00, 0x00]);
//!
//! let response = ApduResponse::from_bytes(vec![0x63, 0xC2]).unwrap();
//! assert!(!response.is_success());
//! ```

use crate::error::{Error, Result};

/// An APDU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    /// Class byte.
    cla: u8,

    /// Instruction byte.
    ins: u8,

    /// Parameter 1.
    p1: u8,

    /// Parameter 2.
    p2: u8,

    /// Command data.
    data: Vec<u8>,

    /// Expected response length (0 = no limit).
    le: u16,
}

impl Apdu {
    /// Maximum short APDU data length.
    pub const MAX_SHORT_DATA: usize = 255;

    /// Creates a new APDU command with Le set to 0.
    ///
    /// # Arguments
    ///
    /// * `cla` - Class byte
    /// * `ins` - Instruction byte
    /// * `p1` - Parameter 1
    /// * `p2` - Parameter 2
    /// * `data` - Command data
    #[must_use]
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le: 0,
        }
    }

    /// Creates a new APDU command with an expected response length.
    #[must_use]
    pub const fn with_le(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, le: u16) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le,
        }
    }

    /// Returns the class byte.
    #[must_use]
    pub const fn cla(&self) -> u8 {
        self.cla
    }

    /// Returns the instruction byte.
    #[must_use]
    pub const fn ins(&self) -> u8 {
        self.ins
    }

    /// Returns parameter 1.
    #[must_use]
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Returns parameter 2.
    #[must_use]
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Returns the command data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the expected response length.
    #[must_use]
    pub const fn le(&self) -> u16 {
        self.le
    }

    /// Serializes the APDU to bytes.
    ///
    /// Uses the short form when data fits in 255 bytes and Le in 256,
    /// otherwise the extended form.
    ///
    /// # Example
    ///
    /// ```
    /// use hw_signer_core::card::Apdu;
    ///
    /// let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00, b"SatoChip".to_vec());
    /// let bytes = apdu.to_bytes();
    /// assert_eq!(&bytes[0..5], &[0x00, 0xA4, 0x04, 0x00, 0x08]);
    /// ```
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.data.len() + 3);

        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        let use_extended = self.data.len() > Self::MAX_SHORT_DATA || self.le > 256;
        let [le_hi, le_lo] = self.le.to_be_bytes();

        if use_extended {
            if !self.data.is_empty() {
                let [lc_hi, lc_lo] = u16::try_from(self.data.len())
                    .unwrap_or(u16::MAX)
                    .to_be_bytes();
                bytes.extend_from_slice(&[0x00, lc_hi, lc_lo]);
                bytes.extend_from_slice(&self.data);
            }
            if self.le > 0 {
                if self.data.is_empty() {
                    bytes.push(0x00);
                }
                bytes.extend_from_slice(&[le_hi, le_lo]);
            }
        } else {
            if let Ok(lc) = u8::try_from(self.data.len())
                && lc > 0
            {
                bytes.push(lc);
                bytes.extend_from_slice(&self.data);
            }
            if self.le > 0 {
                // Le = 256 is encoded as 0x00 in short form
                bytes.push(le_lo);
            }
        }

        bytes
    }
}

/// An APDU response from the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data.
    data: Vec<u8>,

    /// Status word 1.
    sw1: u8,

    /// Status word 2.
    sw2: u8,
}

impl ApduResponse {
    /// Success status word (0x9000).
    pub const SW_SUCCESS: u16 = 0x9000;

    /// Creates a response from its parts.
    #[must_use]
    pub const fn new(data: Vec<u8>, sw1: u8, sw2: u8) -> Self {
        Self { data, sw1, sw2 }
    }

    /// Parses a raw response (data followed by SW1 SW2).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] if fewer than 2 bytes are given.
    ///
    /// # Example
    ///
    /// ```
    /// use hw_signer_core::card::ApduResponse;
    ///
    /// let response = ApduResponse::from_bytes(vec![0x01, 0x02, 0x90, 0x00]).unwrap();
    /// assert!(response.is_success());
    /// assert_eq!(response.data(), &[0x01, 0x02]);
    /// ```
    pub fn from_bytes(mut bytes: Vec<u8>) -> Result<Self> {
        let (Some(sw2), Some(sw1)) = (bytes.pop(), bytes.pop()) else {
            return Err(Error::MalformedResponse(
                "APDU response must be at least 2 bytes".to_string(),
            ));
        };
        Ok(Self::new(bytes, sw1, sw2))
    }

    /// Returns the response data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the response and returns the data.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns status word 1.
    #[must_use]
    pub const fn sw1(&self) -> u8 {
        self.sw1
    }

    /// Returns status word 2.
    #[must_use]
    pub const fn sw2(&self) -> u8 {
        self.sw2
    }

    /// Returns the full status word as a [`u16`].
    #[must_use]
    pub const fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Checks if the response indicates success (`SW = 0x9000`).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status_word() == Self::SW_SUCCESS
    }

    /// Checks the response status and returns an error if not successful.
    ///
    /// # Errors
    ///
    /// Returns the error [`ApduResponse::to_error`] maps the status word to.
    pub const fn check(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.to_error())
        }
    }

    /// Checks the status and returns the data.
    ///
    /// # Errors
    ///
    /// Same as [`ApduResponse::check`].
    pub fn into_checked_data(self) -> Result<Vec<u8>> {
        self.check()?;
        Ok(self.data)
    }

    /// Converts the status word to a descriptive error.
    #[must_use]
    pub const fn to_error(&self) -> Error {
        match (self.sw1, self.sw2) {
            (0x63, 0xC0) | (0x9C, 0x0C) => Error::PinBlocked,
            (0x63, 0xC1..=0xCF) => Error::WrongPin {
                remaining: Some(self.sw2 & 0x0F),
            },
            (0x9C, 0x02) => Error::WrongPin { remaining: None },
            (0x9C, 0x04) => Error::NotSetup,
            (0x9C, 0x06) => Error::PinNotVerified,
            (0x9C, 0x14) => Error::NotSeeded,
            (0x9C, 0x20) => Error::SecureChannelRequired,
            (0x6A, 0x82) | (0x69, 0x99) => Error::AppletNotFound,
            _ => Error::UnexpectedStatusWord(self.sw1, self.sw2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apdu_new() {
        let apdu = Apdu::new(0xB0, 0x42, 0x00, 0x00, vec![0x31, 0x32]);

        assert_eq!(apdu.cla(), 0xB0);
        assert_eq!(apdu.ins(), 0x42);
        assert_eq!(apdu.p1(), 0x00);
        assert_eq!(apdu.p2(), 0x00);
        assert_eq!(apdu.data(), &[0x31, 0x32]);
        assert_eq!(apdu.le(), 0);
    }

    #[test]
    fn apdu_to_bytes_short() {
        let apdu = Apdu::new(0xB0, 0x7A, 0xFF, 0x00, vec![0xAA; 32]);
        let bytes = apdu.to_bytes();

        assert_eq!(&bytes[..5], &[0xB0, 0x7A, 0xFF, 0x00, 0x20]);
        assert_eq!(bytes.len(), 5 + 32);
    }

    #[test]
    fn apdu_to_bytes_no_data() {
        let apdu = Apdu::new(0xB0, 0x3C, 0x00, 0x00, vec![]);
        assert_eq!(apdu.to_bytes(), vec![0xB0, 0x3C, 0x00, 0x00]);
    }

    #[test]
    fn apdu_to_bytes_with_le() {
        let apdu = Apdu::with_le(0x00, 0xCB, 0x3F, 0xFF, vec![], 256);
        assert_eq!(apdu.to_bytes(), vec![0x00, 0xCB, 0x3F, 0xFF, 0x00]);
    }

    #[test]
    fn apdu_to_bytes_extended() {
        let apdu = Apdu::new(0xB0, 0x6C, 0x40, 0x00, vec![0x11; 300]);
        let bytes = apdu.to_bytes();

        assert_eq!(&bytes[..7], &[0xB0, 0x6C, 0x40, 0x00, 0x00, 0x01, 0x2C]);
        assert_eq!(bytes.len(), 7 + 300);
    }

    #[test]
    fn apdu_response_from_bytes() {
        let response = ApduResponse::from_bytes(vec![0x01, 0x02, 0x03, 0x90, 0x00]).unwrap();

        assert_eq!(response.data(), &[0x01, 0x02, 0x03]);
        assert_eq!(response.sw1(), 0x90);
        assert_eq!(response.sw2(), 0x00);
        assert_eq!(response.status_word(), 0x9000);
        assert!(response.is_success());
    }

    #[test]
    fn apdu_response_too_short() {
        assert!(matches!(
            ApduResponse::from_bytes(vec![0x90]),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn apdu_response_pin_errors() {
        let err = ApduResponse::new(vec![], 0x63, 0xC2).to_error();
        assert!(matches!(err, Error::WrongPin { remaining: Some(2) }));

        let err = ApduResponse::new(vec![], 0x63, 0xC0).to_error();
        assert!(matches!(err, Error::PinBlocked));

        let err = ApduResponse::new(vec![], 0x9C, 0x0C).to_error();
        assert!(matches!(err, Error::PinBlocked));
    }

    #[test]
    fn apdu_response_provisioning_errors() {
        assert!(matches!(
            ApduResponse::new(vec![], 0x9C, 0x04).to_error(),
            Error::NotSetup
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x9C, 0x14).to_error(),
            Error::NotSeeded
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x9C, 0x06).to_error(),
            Error::PinNotVerified
        ));
        assert!(matches!(
            ApduResponse::new(vec![], 0x6A, 0x82).to_error(),
            Error::AppletNotFound
        ));
    }

    #[test]
    fn apdu_response_unknown_status() {
        let response = ApduResponse::new(vec![], 0x6D, 0x00);
        assert!(matches!(
            response.check(),
            Err(Error::UnexpectedStatusWord(0x6D, 0x00))
        ));
    }

    #[test]
    fn apdu_response_into_checked_data() {
        let response = ApduResponse::from_bytes(vec![0x01, 0x02, 0x90, 0x00]).unwrap();
        assert_eq!(response.into_checked_data().unwrap(), vec![0x01, 0x02]);
    }
}
