//! Serial transport configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SerialError};
use crate::protocol::{payload_size_for_mtu, ATT_MTU_LIMIT, DEFAULT_MTU, MAX_MTU};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the serial transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// MTU requested once the profile has been matched
    pub requested_mtu: u16,
    /// MTU assumed when negotiation is unsupported or fails
    pub default_mtu: u16,
    /// Hold data that arrives before the CCCD write is confirmed and release
    /// it right after `Connected`, instead of forwarding it immediately
    pub hold_early_data: bool,
    /// Thread name used by `ThreadDispatcher`
    pub dispatch_thread_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            requested_mtu: MAX_MTU,
            default_mtu: DEFAULT_MTU,
            hold_early_data: false,
            dispatch_thread_name: "ble-serial-dispatch".to_string(),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the MTU requested from the peer
    pub fn with_requested_mtu(mut self, mtu: u16) -> Self {
        self.requested_mtu = mtu;
        self
    }

    /// Set the fallback MTU
    pub fn with_default_mtu(mut self, mtu: u16) -> Self {
        self.default_mtu = mtu;
        self
    }

    /// Hold or forward data arriving before Ready
    pub fn with_hold_early_data(mut self, hold: bool) -> Self {
        self.hold_early_data = hold;
        self
    }

    /// Set the dispatch thread name
    pub fn with_dispatch_thread_name(mut self, name: impl Into<String>) -> Self {
        self.dispatch_thread_name = name.into();
        self
    }

    /// Payload budget used until an MTU response arrives
    pub fn default_payload_size(&self) -> usize {
        payload_size_for_mtu(self.default_mtu)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.default_mtu < DEFAULT_MTU {
            return Err(SerialError::InvalidConfiguration {
                reason: format!("default_mtu {} is below {}", self.default_mtu, DEFAULT_MTU),
            });
        }
        if self.requested_mtu < self.default_mtu {
            return Err(SerialError::InvalidConfiguration {
                reason: format!(
                    "requested_mtu {} is below default_mtu {}",
                    self.requested_mtu, self.default_mtu
                ),
            });
        }
        if self.requested_mtu > ATT_MTU_LIMIT {
            return Err(SerialError::InvalidConfiguration {
                reason: format!(
                    "requested_mtu {} exceeds ATT limit {}",
                    self.requested_mtu, ATT_MTU_LIMIT
                ),
            });
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TransportConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
