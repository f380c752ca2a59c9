//! PC/SC transport for contact and contactless card readers.
//!
//! This module provides a [`Transport`] implementation using the PC/SC
//! (Personal Computer/Smart Card) interface, which works on macOS, Linux,
//! and Windows. NFC readers such as the ACR122U show up as ordinary PC/SC
//! readers.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//!
//! use hw_signer_core::card::{PcscTransport, SatochipCard, SignerCard};
//!
//! let transport = PcscTransport::connect(None)?;
//! let mut card = SatochipCard::new(transport);
//!
//! card.power_up(Duration::from_secs(30))?;
//! let status = card.get_status()?;
//! ```

use std::ffi::CString;
use std::time::{Duration, Instant};

use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, warn};

use super::Transport;
use super::apdu::{Apdu, ApduResponse};
use crate::error::{Error, Result};

/// Response buffer size, large enough for extended-length responses.
const RESPONSE_BUF_LEN: usize = 65_538;

/// A PC/SC transport bound to one reader.
///
/// The card handle is acquired when a card is presented and dropped on
/// [`Transport::disconnect`].
pub struct PcscTransport {
    /// The PC/SC context.
    ctx: Context,

    /// Name of the reader in use.
    reader: CString,

    /// The card handle, if a card is connected.
    card: Option<Card>,
}

impl std::fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscTransport")
            .field("reader", &self.reader)
            .field("connected", &self.card.is_some())
            .finish_non_exhaustive()
    }
}

impl PcscTransport {
    /// Binds to the first reader whose name contains `filter`, or to the
    /// first reader at all when `filter` is `None`.
    ///
    /// No card needs to be present; see [`Transport::wait_for_card`].
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if no matching reader exists
    /// - [`Error::Transport`] if the PC/SC service is unavailable
    pub fn connect(filter: Option<&str>) -> Result<Self> {
        let ctx = establish()?;

        let mut readers_buf = vec![0u8; 2048];
        let reader = ctx
            .list_readers(&mut readers_buf)
            .map_err(|e| Error::Transport(format!("failed to list readers: {e}")))?
            .find(|reader| filter.is_none_or(|f| reader.to_string_lossy().contains(f)))
            .map(ToOwned::to_owned)
            .ok_or(Error::DeviceNotFound)?;

        debug!(reader = %reader.to_string_lossy(), "bound PC/SC reader");

        Ok(Self {
            ctx,
            reader,
            card: None,
        })
    }

    /// Lists the names of all attached readers.
    ///
    /// # Errors
    ///
    /// Returns an error if PC/SC context cannot be established.
    pub fn list_readers() -> Result<Vec<String>> {
        let ctx = establish()?;

        let mut readers_buf = vec![0u8; 2048];
        let readers = ctx
            .list_readers(&mut readers_buf)
            .map_err(|e| Error::Transport(format!("failed to list readers: {e}")))?;

        Ok(readers.map(|r| r.to_string_lossy().into_owned()).collect())
    }

    fn card_mut(&mut self) -> Result<&mut Card> {
        self.card
            .as_mut()
            .ok_or_else(|| Error::Transport("no card connected".to_string()))
    }
}

impl Transport for PcscTransport {
    fn transmit(&mut self, apdu: &Apdu) -> Result<ApduResponse> {
        let command = apdu.to_bytes();
        let mut response_buf = vec![0u8; RESPONSE_BUF_LEN];

        let response = self
            .card_mut()?
            .transmit(&command, &mut response_buf)
            .map_err(|e| Error::Transport(format!("transmit failed: {e}")))?;

        ApduResponse::from_bytes(response.to_vec())
    }

    fn is_connected(&self) -> bool {
        self.card
            .as_ref()
            .is_some_and(|card| card.status2_owned().is_ok())
    }

    fn wait_for_card(&mut self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut states = [ReaderState::new(self.reader.clone(), State::UNAWARE)];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ctx.get_status_change(Some(remaining), &mut states) {
                Ok(()) => {}
                Err(pcsc::Error::Timeout) => return Err(Error::Timeout),
                Err(e) => return Err(Error::Transport(format!("reader status failed: {e}"))),
            }

            let state = &mut states[0];
            if state.event_state().contains(State::PRESENT) {
                break;
            }
            state.sync_current_state();
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
        }

        let card = self
            .ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| Error::Transport(format!("failed to connect to card: {e}")))?;
        self.card = Some(card);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let Some(card) = self.card.take() else {
            return Ok(());
        };
        card.disconnect(Disposition::ResetCard).map_err(|(_, e)| {
            warn!(error = %e, "card release failed");
            Error::Transport(format!("failed to release card: {e}"))
        })
    }
}

fn establish() -> Result<Context> {
    Context::establish(Scope::User)
        .map_err(|e| Error::Transport(format!("failed to establish PC/SC context: {e}")))
}
