//! Shared helpers for transport integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use ble_serial::{
    CharProperties, DeviceRef, GattCharacteristic, GattRadio, GattService, ManualDispatcher,
    RadioError, SerialListener, SerialTransport, TransportConfig, TransportError, WriteType,
    CCCD_UUID, NORDIC_UART_CHAR_RW2_UUID, NORDIC_UART_CHAR_RW3_UUID, NORDIC_UART_SERVICE_UUID,
};
use parking_lot::Mutex;
use uuid::Uuid;

pub const DEVICE_ADDRESS: &str = "C8:2B:96:11:22:33";
pub const RW2_HANDLE: u16 = 0x000e;
pub const RW3_HANDLE: u16 = 0x0010;

/// Install a test log subscriber once
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------------
// Mock Radio
// ----------------------------------------------------------------------------

/// Requests observed by the mock radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(String),
    DiscoverServices,
    RequestMtu(u16),
    EnableNotifications(u16),
    WriteDescriptor(u16, Uuid, Vec<u8>),
    WriteCharacteristic(u16, Vec<u8>, WriteType),
    Disconnect,
}

/// Which requests the mock refuses synchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Refuse {
    Connect,
    DiscoverServices,
    RequestMtu,
    EnableNotifications,
    WriteDescriptor,
    WriteCharacteristic,
}

/// Radio that records every request and refuses the configured ones
#[derive(Default)]
pub struct MockRadio {
    calls: Mutex<Vec<Call>>,
    refused: Mutex<HashSet<Refuse>>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, request: Refuse) {
        self.refused.lock().insert(request);
    }

    pub fn allow(&self, request: Refuse) {
        self.refused.lock().remove(&request);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Payloads of every characteristic write, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::WriteCharacteristic(_, data, _) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call, request: Refuse) -> Result<(), RadioError> {
        self.calls.lock().push(call);
        if self.refused.lock().contains(&request) {
            return Err(match request {
                Refuse::RequestMtu => RadioError::Unsupported,
                Refuse::Connect => RadioError::UnknownDevice {
                    address: DEVICE_ADDRESS.to_string(),
                },
                _ => RadioError::Rejected("refused by mock".to_string()),
            });
        }
        Ok(())
    }
}

impl GattRadio for MockRadio {
    fn connect(&self, device: &DeviceRef) -> Result<(), RadioError> {
        self.record(Call::Connect(device.address.clone()), Refuse::Connect)
    }

    fn discover_services(&self) -> Result<(), RadioError> {
        self.record(Call::DiscoverServices, Refuse::DiscoverServices)
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), RadioError> {
        self.record(Call::RequestMtu(mtu), Refuse::RequestMtu)
    }

    fn enable_notifications(&self, handle: u16) -> Result<(), RadioError> {
        self.record(Call::EnableNotifications(handle), Refuse::EnableNotifications)
    }

    fn write_descriptor(&self, handle: u16, descriptor: Uuid, value: &[u8]) -> Result<(), RadioError> {
        self.record(
            Call::WriteDescriptor(handle, descriptor, value.to_vec()),
            Refuse::WriteDescriptor,
        )
    }

    fn write_characteristic(
        &self,
        handle: u16,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        self.record(
            Call::WriteCharacteristic(handle, data.to_vec(), write_type),
            Refuse::WriteCharacteristic,
        )
    }

    fn disconnect(&self) {
        self.calls.lock().push(Call::Disconnect);
    }
}

// ----------------------------------------------------------------------------
// Recording Listener
// ----------------------------------------------------------------------------

/// Listener callbacks as observed on the dispatch context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected,
    ConnectError(TransportError),
    Data(Vec<Vec<u8>>),
    IoError(TransportError),
}

#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<Seen>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn take(&self) -> Vec<Seen> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl SerialListener for RecordingListener {
    fn on_connected(&self) {
        self.seen.lock().push(Seen::Connected);
    }

    fn on_connect_error(&self, error: &TransportError) {
        self.seen.lock().push(Seen::ConnectError(error.clone()));
    }

    fn on_data_batch(&self, frames: Vec<Vec<u8>>) {
        self.seen.lock().push(Seen::Data(frames));
    }

    fn on_io_error(&self, error: &TransportError) {
        self.seen.lock().push(Seen::IoError(error.clone()));
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub fn device() -> DeviceRef {
    DeviceRef::new(DEVICE_ADDRESS).with_name("UART Bridge")
}

/// Nordic UART service with the given capability sets on RW2/RW3
pub fn nordic_service(rw2: CharProperties, rw3: CharProperties) -> GattService {
    GattService::new(
        NORDIC_UART_SERVICE_UUID,
        vec![
            GattCharacteristic::new(NORDIC_UART_CHAR_RW2_UUID, RW2_HANDLE, rw2)
                .with_descriptor(CCCD_UUID),
            GattCharacteristic::new(NORDIC_UART_CHAR_RW3_UUID, RW3_HANDLE, rw3)
                .with_descriptor(CCCD_UUID),
        ],
    )
}

/// Discovery result of a typical nRF firmware: generic services first
pub fn typical_services() -> Vec<GattService> {
    vec![
        GattService::new(Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB), vec![]),
        GattService::new(Uuid::from_u128(0x00001801_0000_1000_8000_00805F9B34FB), vec![]),
        nordic_service(
            CharProperties::WRITE.with(CharProperties::WRITE_WITHOUT_RESPONSE),
            CharProperties::NOTIFY,
        ),
    ]
}

pub struct Harness {
    pub radio: Arc<MockRadio>,
    pub dispatcher: Arc<ManualDispatcher>,
    pub transport: SerialTransport,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        init_tracing();
        let radio = MockRadio::new();
        let dispatcher = Arc::new(ManualDispatcher::new());
        let transport = SerialTransport::new(radio.clone(), dispatcher.clone(), config)
            .expect("valid config");
        Self {
            radio,
            dispatcher,
            transport,
            listener: RecordingListener::new(),
        }
    }

    pub fn attach(&self) {
        let listener: Arc<dyn SerialListener> = self.listener.clone();
        self.transport.attach(&listener).expect("attach on dispatch thread");
    }

    /// Run queued dispatch jobs
    pub fn pump(&self) -> usize {
        self.dispatcher.run_pending()
    }

    /// Walk the negotiation to Ready using `services` and an MTU response
    pub fn negotiate(&self, services: &[GattService], mtu: Option<u16>) {
        self.transport.connect(device()).expect("connect");
        self.transport.on_link_up();
        self.transport.on_services_discovered(services);
        if let Some(mtu) = mtu {
            self.transport.on_mtu_changed(mtu, true);
        }
    }

    /// Confirm the CCCD write on `read_handle`
    pub fn confirm_cccd(&self, read_handle: u16) {
        self.transport
            .on_descriptor_write(read_handle, CCCD_UUID, true);
    }

    pub fn connect_ready(&self, mtu: Option<u16>) {
        self.negotiate(&typical_services(), mtu);
        self.confirm_cccd(RW3_HANDLE);
    }
}
