//! Signer configuration.
//!
//! [`SignerConfig`] carries the knobs shared by every card flow. It loads
//! from JSON, and every field is optional there:
//!
//! ```
//! use hw_signer_core::{Network, SignerConfig};
//!
//! let config = SignerConfig::from_json(r#"{"network": "testnet", "connectTimeoutMs": 5000}"#).unwrap();
//! assert_eq!(config.network, Network::Testnet);
//! assert!(config.reverify_pin_per_key);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::xpub::Network;

/// Default bounded wait for a card to be presented.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default PIN retry counter written during card setup.
pub const DEFAULT_PIN_RETRIES: u8 = 5;

/// Configuration for card sessions and orchestration flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignerConfig {
    /// Network the wallet operates on.
    pub network: Network,

    /// PIN slot used for verification.
    pub pin_slot: u8,

    /// Bounded wait for the card to respond after a session is opened.
    #[serde(rename = "connectTimeoutMs", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// PIN retry counter written by card setup.
    pub setup_pin_retries: u8,

    /// Re-verify the PIN before every extended-key fetch.
    pub reverify_pin_per_key: bool,

    /// Verify each normalized signature against the derived key before
    /// storing it.
    pub verify_signatures: bool,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            pin_slot: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            setup_pin_retries: DEFAULT_PIN_RETRIES,
            reverify_pin_per_key: true,
            verify_signatures: false,
        }
    }
}

impl SignerConfig {
    /// Returns the default configuration for `network`.
    #[must_use]
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables post-signing verification.
    #[must_use]
    pub const fn with_signature_verification(mut self, enabled: bool) -> Self {
        self.verify_signatures = enabled;
        self
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if parsing fails.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the configuration to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::JsonError`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = SignerConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.pin_slot, 0);
        assert_eq!(config.setup_pin_retries, 5);
        assert!(config.reverify_pin_per_key);
        assert!(!config.verify_signatures);
    }

    #[test]
    fn empty_json_is_default() {
        assert_eq!(SignerConfig::from_json("{}").unwrap(), SignerConfig::default());
    }

    #[test]
    fn json_round_trip() {
        let config = SignerConfig::for_network(Network::Testnet)
            .with_connect_timeout(Duration::from_millis(1500))
            .with_signature_verification(true);

        let json = config.to_json().unwrap();
        assert!(json.contains("\"connectTimeoutMs\":1500"));
        assert_eq!(SignerConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn rejects_bad_network() {
        assert!(SignerConfig::from_json(r#"{"network": "signet"}"#).is_err());
    }
}
