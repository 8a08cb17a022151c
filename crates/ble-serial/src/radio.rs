//! Radio driver boundary
//!
//! The transport talks to the BLE stack through [`GattRadio`]. Every method is
//! a non-blocking request: a synchronous `Err` means the request was refused
//! outright, while the outcome of an accepted request arrives later as a
//! [`RadioEvent`] fed into
//! [`SerialTransport::handle_radio_event`](crate::SerialTransport::handle_radio_event)
//! (or one of the per-kind `on_*` intake methods).

use uuid::Uuid;

use crate::error::RadioError;
use crate::gatt::{DeviceRef, GattService};

// ----------------------------------------------------------------------------
// Driver Trait
// ----------------------------------------------------------------------------

/// How a characteristic value is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Requests the transport issues to the radio
pub trait GattRadio: Send + Sync {
    /// Open a GATT link; answered by `LinkUp` or `LinkDown`
    fn connect(&self, device: &DeviceRef) -> Result<(), RadioError>;

    /// Start service discovery; answered by `ServicesDiscovered`
    fn discover_services(&self) -> Result<(), RadioError>;

    /// Ask for a larger MTU; answered by `MtuChanged`.
    /// `Err(RadioError::Unsupported)` when the platform cannot negotiate.
    fn request_mtu(&self, mtu: u16) -> Result<(), RadioError>;

    /// Enable local delivery of value changes for a characteristic.
    /// Completes synchronously.
    fn enable_notifications(&self, handle: u16) -> Result<(), RadioError>;

    /// Write a descriptor value; answered by `DescriptorWritten`
    fn write_descriptor(&self, handle: u16, descriptor: Uuid, value: &[u8])
        -> Result<(), RadioError>;

    /// Write a characteristic value; answered by `CharacteristicWritten`
    fn write_characteristic(
        &self,
        handle: u16,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError>;

    /// Drop the link and release radio resources. Idempotent.
    fn disconnect(&self);
}

// ----------------------------------------------------------------------------
// Commands and Events
// ----------------------------------------------------------------------------

/// A radio request produced by the negotiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    Connect(DeviceRef),
    DiscoverServices,
    RequestMtu(u16),
    EnableNotifications { handle: u16 },
    WriteDescriptor {
        handle: u16,
        descriptor: Uuid,
        value: Vec<u8>,
    },
}

impl RadioCommand {
    /// Issue this command on a radio
    pub fn execute(&self, radio: &dyn GattRadio) -> Result<(), RadioError> {
        match self {
            RadioCommand::Connect(device) => radio.connect(device),
            RadioCommand::DiscoverServices => radio.discover_services(),
            RadioCommand::RequestMtu(mtu) => radio.request_mtu(*mtu),
            RadioCommand::EnableNotifications { handle } => radio.enable_notifications(*handle),
            RadioCommand::WriteDescriptor {
                handle,
                descriptor,
                value,
            } => radio.write_descriptor(*handle, *descriptor, value),
        }
    }
}

/// Asynchronous callbacks from the radio, delivered on the I/O context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    LinkUp,
    LinkDown {
        status: i32,
    },
    ServicesDiscovered(Vec<GattService>),
    MtuChanged {
        mtu: u16,
        success: bool,
    },
    DescriptorWritten {
        handle: u16,
        descriptor: Uuid,
        success: bool,
    },
    CharacteristicWritten {
        handle: u16,
        success: bool,
    },
    CharacteristicChanged {
        handle: u16,
        value: Vec<u8>,
    },
    /// Platform pairing request broadcast; may concern any device
    PairingRequest {
        device: DeviceRef,
        variant: i32,
    },
    /// Platform bond state broadcast; may concern any device
    BondStateChanged {
        device: DeviceRef,
        previous: i32,
        current: i32,
    },
}
