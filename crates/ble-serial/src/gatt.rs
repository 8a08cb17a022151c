//! Remote device and GATT attribute model

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SerialError};

// ----------------------------------------------------------------------------
// Device Reference
// ----------------------------------------------------------------------------

/// Reference to a remote device handed in by the collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Radio address; this is the device identity
    pub address: String,
    /// Advertised name, if known
    pub name: Option<String>,
}

impl DeviceRef {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name for display: advertised name, else address
    pub fn display_name(&self) -> &str {
        match (&self.name, self.address.is_empty()) {
            (Some(name), _) if !name.is_empty() => name.as_str(),
            (_, false) => self.address.as_str(),
            _ => "Unknown",
        }
    }

    /// Reject references that cannot identify a device
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(SerialError::InvalidDevice {
                reason: "empty device address".to_string(),
            });
        }
        Ok(())
    }

    /// Identity comparison used for pairing broadcasts
    pub fn same_device(&self, other: &DeviceRef) -> bool {
        self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

// ----------------------------------------------------------------------------
// Characteristics
// ----------------------------------------------------------------------------

/// Capability set advertised by a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub const WRITE: Self = Self {
        write: true,
        write_without_response: false,
        notify: false,
        indicate: false,
    };

    pub const WRITE_WITHOUT_RESPONSE: Self = Self {
        write: false,
        write_without_response: true,
        notify: false,
        indicate: false,
    };

    pub const NOTIFY: Self = Self {
        write: false,
        write_without_response: false,
        notify: true,
        indicate: false,
    };

    pub const INDICATE: Self = Self {
        write: false,
        write_without_response: false,
        notify: false,
        indicate: true,
    };

    pub fn none() -> Self {
        Self::default()
    }

    /// Union of two capability sets
    pub fn with(self, other: Self) -> Self {
        Self {
            write: self.write || other.write,
            write_without_response: self.write_without_response || other.write_without_response,
            notify: self.notify || other.notify,
            indicate: self.indicate || other.indicate,
        }
    }

    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_push(&self) -> bool {
        self.notify || self.indicate
    }
}

impl fmt::Display for CharProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.write, "write"),
            (self.write_without_response, "write-no-response"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ];
        let names: Vec<&str> = flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// Attribute handle; unique per connection
    pub handle: u16,
    pub properties: CharProperties,
    /// UUIDs of the descriptors attached to this characteristic
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, handle: u16, properties: CharProperties) -> Self {
        Self {
            uuid,
            handle,
            properties,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn has_descriptor(&self, descriptor: &Uuid) -> bool {
        self.descriptors.contains(descriptor)
    }
}

/// A discovered primary service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Read/write characteristics resolved for a serial profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicPair {
    /// Device-to-host side; armed for notify or indicate
    pub read: GattCharacteristic,
    /// Host-to-device side
    pub write: GattCharacteristic,
}
