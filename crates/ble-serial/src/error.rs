//! Error types for the serial transport

use thiserror::Error;

// ----------------------------------------------------------------------------
// Radio-Originated Failures
// ----------------------------------------------------------------------------

/// Which side of the connection lifecycle a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection never reached Ready
    Negotiation,
    /// The connection was Ready and then broke
    Transport,
}

/// Failure reasons delivered to the listener as `ConnectError` or `IoError`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link error (gatt status {status})")]
    LinkError { status: i32 },

    #[error("service discovery failed")]
    DiscoveryFailed,

    #[error("no serial profile found")]
    NoSerialProfile,

    #[error("multiple write characteristics ({first}/{second})")]
    MultipleWriteCharacteristics { first: String, second: String },

    #[error("no write characteristic ({first}/{second})")]
    NoWriteCharacteristic { first: String, second: String },

    #[error("write characteristic not writable")]
    WriteNotSupported,

    #[error("no notification support for read characteristic")]
    NotificationUnsupported,

    #[error("no CCCD descriptor for read characteristic")]
    MissingCccd,

    #[error("no indication/notification available for read characteristic ({properties})")]
    NoIndicationOrNotification { properties: String },

    #[error("read characteristic CCCD descriptor not writable")]
    DescriptorNotWritable,

    #[error("write descriptor failed")]
    DescriptorWriteFailed,

    #[error("pairing requested")]
    PairingRequested,

    #[error("unexpected disconnect (gatt status {status})")]
    UnexpectedDisconnect { status: i32 },

    #[error("write failed")]
    WriteFailed,
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::UnexpectedDisconnect { .. } | TransportError::WriteFailed => {
                FailureKind::Transport
            }
            _ => FailureKind::Negotiation,
        }
    }
}

/// Synchronous refusal reported by the radio driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("operation not supported by the radio")]
    Unsupported,

    #[error("device not known to the radio: {address}")]
    UnknownDevice { address: String },

    #[error("radio is not connected")]
    NotConnected,

    #[error("request rejected: {0}")]
    Rejected(String),
}

// ----------------------------------------------------------------------------
// Usage Failures
// ----------------------------------------------------------------------------

/// Errors returned synchronously from the public API
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid device: {reason}")]
    InvalidDevice { reason: String },

    #[error("listener must be attached from the dispatch context")]
    WrongDispatchContext,

    #[error("connect failed: {0}")]
    ConnectFailed(#[source] RadioError),

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(TransportError::NoSerialProfile.kind(), FailureKind::Negotiation);
        assert_eq!(
            TransportError::LinkError { status: 133 }.kind(),
            FailureKind::Negotiation
        );
        assert_eq!(TransportError::WriteFailed.kind(), FailureKind::Transport);
        assert_eq!(
            TransportError::UnexpectedDisconnect { status: 8 }.kind(),
            FailureKind::Transport
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(TransportError::NoSerialProfile.to_string(), "no serial profile found");
        assert_eq!(
            TransportError::MultipleWriteCharacteristics {
                first: "write".into(),
                second: "write|notify".into()
            }
            .to_string(),
            "multiple write characteristics (write/write|notify)"
        );
        assert_eq!(SerialError::NotConnected.to_string(), "not connected");
    }
}
