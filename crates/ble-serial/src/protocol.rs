//! GATT identifiers and transfer-size constants for the supported UART profiles

use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service, Characteristic and Descriptor UUIDs
// ----------------------------------------------------------------------------

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Nordic UART service UUID
pub const NORDIC_UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// First Nordic UART characteristic. Usually the host-to-device (write) side,
/// but some firmware swaps the roles, so the profile never assumes it.
pub const NORDIC_UART_CHAR_RW2_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Second Nordic UART characteristic. Usually the device-to-host (notify) side.
pub const NORDIC_UART_CHAR_RW3_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

// ----------------------------------------------------------------------------
// CCCD Values
// ----------------------------------------------------------------------------

/// CCCD value arming notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value arming indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

// ----------------------------------------------------------------------------
// Transfer Size
// ----------------------------------------------------------------------------

/// Largest MTU requested from the peer
pub const MAX_MTU: u16 = 512;

/// ATT default MTU, used whenever negotiation is unavailable
pub const DEFAULT_MTU: u16 = 23;

/// Upper bound accepted by the ATT protocol
pub const ATT_MTU_LIMIT: u16 = 517;

/// ATT write request header (opcode + handle)
pub const ATT_HEADER_SIZE: u16 = 3;

/// Payload bytes available in one write for a given MTU
pub fn payload_size_for_mtu(mtu: u16) -> usize {
    mtu.saturating_sub(ATT_HEADER_SIZE).max(1) as usize
}
