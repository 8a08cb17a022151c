//! Vendor UART profiles
//!
//! Each known device family is one variant of [`SerialProfile`]. A profile
//! claims a discovered service, picks the read/write characteristic pair out
//! of it, and gates outbound writes for profiles with flow control.

use tracing::debug;

use crate::error::TransportError;
use crate::gatt::{CharacteristicPair, GattCharacteristic, GattService};
use crate::protocol::{NORDIC_UART_CHAR_RW2_UUID, NORDIC_UART_CHAR_RW3_UUID, NORDIC_UART_SERVICE_UUID};

/// Capability interface every profile variant implements
pub trait ProfileDelegate {
    /// Whether this profile handles the given service
    fn match_service(&self, service: &GattService) -> bool;

    /// Resolve the characteristic pair.
    ///
    /// `Ok(None)` means the service lacks the profile's characteristics;
    /// `Err` means they exist but cannot form a valid pair.
    fn select_characteristics(
        &self,
        service: &GattService,
    ) -> Result<Option<CharacteristicPair>, TransportError>;

    /// Whether the next chunk may be written now
    fn gate_write(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Profile Variants
// ----------------------------------------------------------------------------

/// Known serial profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialProfile {
    /// Nordic UART service (nRF51/52, micro:bit, many ESP32 firmwares)
    NordicUart,
}

impl SerialProfile {
    pub const ALL: [SerialProfile; 1] = [SerialProfile::NordicUart];

    /// Profile claiming this service, if any
    pub fn for_service(service: &GattService) -> Option<SerialProfile> {
        Self::ALL.into_iter().find(|p| p.match_service(service))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SerialProfile::NordicUart => "nordic uart",
        }
    }
}

impl ProfileDelegate for SerialProfile {
    fn match_service(&self, service: &GattService) -> bool {
        match self {
            SerialProfile::NordicUart => service.uuid == NORDIC_UART_SERVICE_UUID,
        }
    }

    fn select_characteristics(
        &self,
        service: &GattService,
    ) -> Result<Option<CharacteristicPair>, TransportError> {
        match self {
            SerialProfile::NordicUart => select_nordic(service),
        }
    }

    fn gate_write(&self) -> bool {
        match self {
            SerialProfile::NordicUart => true,
        }
    }
}

/// The two Nordic characteristics have fixed UUIDs but firmware disagrees on
/// which one is writable, so the one accepting acknowledged writes becomes
/// the write side. Write-without-response alone does not count, since many
/// firmwares also set it on the notify side.
fn select_nordic(service: &GattService) -> Result<Option<CharacteristicPair>, TransportError> {
    debug!("service nordic uart");
    let (Some(rw2), Some(rw3)) = (
        service.characteristic(&NORDIC_UART_CHAR_RW2_UUID),
        service.characteristic(&NORDIC_UART_CHAR_RW3_UUID),
    ) else {
        return Ok(None);
    };

    debug!("characteristic properties {}/{}", rw2.properties, rw3.properties);
    match (rw2.properties.write, rw3.properties.write) {
        (true, true) => Err(TransportError::MultipleWriteCharacteristics {
            first: rw2.properties.to_string(),
            second: rw3.properties.to_string(),
        }),
        (true, false) => Ok(Some(pair(rw3, rw2))),
        (false, true) => Ok(Some(pair(rw2, rw3))),
        (false, false) => Err(TransportError::NoWriteCharacteristic {
            first: rw2.properties.to_string(),
            second: rw3.properties.to_string(),
        }),
    }
}

fn pair(read: &GattCharacteristic, write: &GattCharacteristic) -> CharacteristicPair {
    CharacteristicPair {
        read: read.clone(),
        write: write.clone(),
    }
}
