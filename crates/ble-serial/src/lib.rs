//! Serial-port style byte stream over a BLE GATT UART profile
//!
//! This crate connects to a peripheral exposing a vendor UART service, runs
//! the GATT negotiation (discovery, profile match, MTU, notification arming)
//! and then offers `write(bytes)` plus inbound data as listener callbacks.
//!
//! ## Architecture
//!
//! - [`protocol`] - GATT identifiers and MTU constants
//! - [`gatt`] - Device references and the discovered attribute model
//! - [`radio`] - The driver boundary: requests out, callbacks in
//! - [`profile`] - Known vendor UART profiles
//! - [`negotiator`] - Connection state machine
//! - [`write_queue`] - Chunked, non-interleaving outbound queue
//! - [`dispatch`] - The designated context listener callbacks run on
//! - [`broker`] - Event buffering and delivery to a detachable listener
//! - [`transport`] - The collaborator-facing [`SerialTransport`]
//! - `central` - btleplug radio backend (feature `ble-central`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_serial::{DeviceRef, SerialListener, SerialTransport, TransportConfig, TransportError};
//! # use ble_serial::GattRadio;
//!
//! struct Console;
//!
//! impl SerialListener for Console {
//!     fn on_connected(&self) {
//!         println!("connected");
//!     }
//!     fn on_connect_error(&self, error: &TransportError) {
//!         println!("connect error: {}", error);
//!     }
//!     fn on_data(&self, data: &[u8]) {
//!         println!("{}", String::from_utf8_lossy(data));
//!     }
//!     fn on_io_error(&self, error: &TransportError) {
//!         println!("io error: {}", error);
//!     }
//! }
//!
//! # fn example(radio: Arc<dyn GattRadio>) -> Result<(), Box<dyn std::error::Error>> {
//! let (transport, dispatcher) = SerialTransport::spawn(radio, TransportConfig::new())?;
//!
//! let listener: Arc<dyn SerialListener> = Arc::new(Console);
//! let attached = transport.clone();
//! let kept = Arc::clone(&listener);
//! dispatcher.run_sync(move || attached.attach(&kept));
//!
//! transport.connect(DeviceRef::new("E4:5F:01:2A:3B:4C"))?;
//! // radio callbacks are fed through `transport.handle_radio_event(..)`
//!
//! // once `on_connected` has fired:
//! transport.write(b"hello\r\n")?;
//! transport.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gatt;
pub mod negotiator;
pub mod profile;
pub mod protocol;
pub mod radio;
pub mod transport;
pub mod write_queue;

#[cfg(feature = "ble-central")]
pub mod central;

// Public API exports
pub use broker::{Event, EventBroker, SerialListener};
pub use config::TransportConfig;
pub use dispatch::{DispatchContext, Job, ManualDispatcher, ThreadDispatcher};
pub use error::{FailureKind, RadioError, Result, SerialError, TransportError};
pub use gatt::{CharProperties, CharacteristicPair, DeviceRef, GattCharacteristic, GattService};
pub use negotiator::{Action, ConnectionState, GattNegotiator};
pub use profile::{ProfileDelegate, SerialProfile};
pub use protocol::{
    payload_size_for_mtu, CCCD_UUID, DEFAULT_MTU, MAX_MTU, NORDIC_UART_CHAR_RW2_UUID,
    NORDIC_UART_CHAR_RW3_UUID, NORDIC_UART_SERVICE_UUID,
};
pub use radio::{GattRadio, RadioCommand, RadioEvent, WriteType};
pub use transport::SerialTransport;
pub use write_queue::{PendingWrite, WriteQueue};

#[cfg(feature = "ble-central")]
pub use central::{pump_events, BtleplugRadio};
