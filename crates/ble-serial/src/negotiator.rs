//! GATT negotiation state machine
//!
//! The negotiator is pure state: every input returns the [`Action`]s the
//! transport must carry out, and radio requests are executed by the caller
//! with no lock held. Outcomes of those requests come back through
//! [`GattNegotiator::on_command_accepted`] / [`GattNegotiator::on_command_rejected`]
//! or the asynchronous `on_*` radio callbacks.

use std::fmt;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::error::{RadioError, Result, SerialError, TransportError};
use crate::gatt::{CharacteristicPair, DeviceRef, GattService};
use crate::profile::{ProfileDelegate, SerialProfile};
use crate::protocol::{
    payload_size_for_mtu, CCCD_UUID, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::radio::{RadioCommand, WriteType};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle of the single connection owned by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    DiscoveringServices,
    NegotiatingMtu,
    ArmingNotifications,
    Ready,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// States between `connect()` and Ready
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::NegotiatingMtu
                | ConnectionState::ArmingNotifications
        )
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::DiscoveringServices => "DiscoveringServices",
            ConnectionState::NegotiatingMtu => "NegotiatingMtu",
            ConnectionState::ArmingNotifications => "ArmingNotifications",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Work the transport performs on behalf of the negotiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Issue a radio request
    Radio(RadioCommand),
    /// The CCCD write was confirmed; emit `Connected`
    Connected,
    /// Negotiation failed; emit `ConnectError` and tear down
    ConnectFailed(TransportError),
    /// A Ready connection broke; emit `IoError` and tear down
    LinkLost(TransportError),
}

// ----------------------------------------------------------------------------
// Negotiator
// ----------------------------------------------------------------------------

/// Drives connect, discovery, profile match, MTU and notification arming
#[derive(Debug)]
pub struct GattNegotiator {
    state: ConnectionState,
    device: Option<DeviceRef>,
    profile: Option<SerialProfile>,
    pair: Option<CharacteristicPair>,
    payload_size: usize,
    default_payload_size: usize,
    requested_mtu: u16,
    /// Set from `begin` until teardown; the radio may hold a link
    link_open: bool,
    tearing_down: bool,
    last_failure: Option<TransportError>,
}

impl GattNegotiator {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            device: None,
            profile: None,
            pair: None,
            payload_size: config.default_payload_size(),
            default_payload_size: config.default_payload_size(),
            requested_mtu: config.requested_mtu,
            link_open: false,
            tearing_down: false,
            last_failure: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> Option<&DeviceRef> {
        self.device.as_ref()
    }

    pub fn profile(&self) -> Option<SerialProfile> {
        self.profile
    }

    pub fn pair(&self) -> Option<&CharacteristicPair> {
        self.pair.as_ref()
    }

    /// Maximum bytes per write chunk
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn last_failure(&self) -> Option<&TransportError> {
        self.last_failure.as_ref()
    }

    /// Whether a connection currently occupies this negotiator
    pub fn is_busy(&self) -> bool {
        self.link_open || self.tearing_down
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("connection state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn fail(&mut self, error: TransportError) -> Vec<Action> {
        warn!("connect error: {}", error);
        self.set_state(ConnectionState::Failed);
        self.last_failure = Some(error.clone());
        vec![Action::ConnectFailed(error)]
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// `Idle -> Connecting`
    pub fn begin(&mut self, device: DeviceRef) -> Result<Vec<Action>> {
        if self.is_busy() {
            return Err(SerialError::AlreadyConnected);
        }
        device.validate()?;

        info!("connect {}", device);
        self.profile = None;
        self.pair = None;
        self.payload_size = self.default_payload_size;
        self.last_failure = None;
        self.link_open = true;
        self.device = Some(device.clone());
        self.set_state(ConnectionState::Connecting);
        Ok(vec![Action::Radio(RadioCommand::Connect(device))])
    }

    /// The radio refused to open the link; nothing was started
    pub fn abandon(&mut self) {
        self.link_open = false;
        self.set_state(ConnectionState::Failed);
    }

    /// Start tearing down; returns whether the radio may still hold a link
    pub fn begin_teardown(&mut self) -> bool {
        let was_open = self.link_open;
        self.link_open = false;
        self.tearing_down = true;
        self.pair = None;
        self.profile = None;
        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            self.set_state(ConnectionState::Disconnecting);
        }
        was_open
    }

    pub fn finish_teardown(&mut self) {
        self.tearing_down = false;
        if self.state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    // ------------------------------------------------------------------------
    // Radio Callbacks
    // ------------------------------------------------------------------------

    /// `Connecting -> DiscoveringServices`
    pub fn on_link_up(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            debug!("link up ignored in state {}", self.state);
            return Vec::new();
        }
        debug!("link up, discover services");
        self.set_state(ConnectionState::DiscoveringServices);
        vec![Action::Radio(RadioCommand::DiscoverServices)]
    }

    /// Link loss: `ConnectError` before Ready, `IoError` after
    pub fn on_link_down(&mut self, status: i32) -> Vec<Action> {
        let current = self.state;
        match current {
            ConnectionState::Ready => self.lose_link(TransportError::UnexpectedDisconnect { status }),
            state if state.is_negotiating() => self.fail(TransportError::LinkError { status }),
            state => {
                debug!("link down (status {}) ignored in state {}", status, state);
                Vec::new()
            }
        }
    }

    /// A Ready connection broke
    pub fn lose_link(&mut self, error: TransportError) -> Vec<Action> {
        if self.state != ConnectionState::Ready {
            return Vec::new();
        }
        warn!("io error: {}", error);
        self.set_state(ConnectionState::Disconnecting);
        self.last_failure = Some(error.clone());
        vec![Action::LinkLost(error)]
    }

    /// `DiscoveringServices -> NegotiatingMtu` via profile match
    pub fn on_services_discovered(&mut self, services: &[GattService]) -> Vec<Action> {
        if self.state != ConnectionState::DiscoveringServices {
            debug!("services discovered ignored in state {}", self.state);
            return Vec::new();
        }
        debug!("services discovered: {}", services.len());

        let matched = services
            .iter()
            .find_map(|service| SerialProfile::for_service(service).map(|p| (p, service)));

        let selection = match matched {
            Some((profile, service)) => {
                debug!("matched profile {}", profile.name());
                self.profile = Some(profile);
                profile.select_characteristics(service)
            }
            None => Ok(None),
        };

        match selection {
            Ok(Some(pair)) => {
                debug!(
                    "read characteristic {} ({}), write characteristic {} ({})",
                    pair.read.uuid, pair.read.properties, pair.write.uuid, pair.write.properties
                );
                self.pair = Some(pair);
                self.set_state(ConnectionState::NegotiatingMtu);
                debug!("request MTU {}", self.requested_mtu);
                vec![Action::Radio(RadioCommand::RequestMtu(self.requested_mtu))]
            }
            Ok(None) => {
                dump_services(services);
                self.fail(TransportError::NoSerialProfile)
            }
            Err(error) => self.fail(error),
        }
    }

    /// MTU response; a failed status keeps the default budget
    pub fn on_mtu_changed(&mut self, mtu: u16, success: bool) -> Vec<Action> {
        if self.state != ConnectionState::NegotiatingMtu {
            debug!("mtu response ignored in state {}", self.state);
            return Vec::new();
        }
        debug!("mtu size {}, success={}", mtu, success);
        if success {
            self.payload_size = payload_size_for_mtu(mtu);
        }
        self.arm()
    }

    /// CCCD write confirmation: `ArmingNotifications -> Ready`
    pub fn on_descriptor_written(
        &mut self,
        handle: u16,
        descriptor: Uuid,
        success: bool,
    ) -> Vec<Action> {
        if self.state != ConnectionState::ArmingNotifications {
            debug!("descriptor write ignored in state {}", self.state);
            return Vec::new();
        }
        let Some(read_handle) = self.pair.as_ref().map(|p| p.read.handle) else {
            return Vec::new();
        };
        if handle != read_handle {
            debug!("descriptor write on handle {:#06x} ignored", handle);
            return Vec::new();
        }
        debug!("read descriptor {} written, success={}", descriptor, success);
        if !success {
            return self.fail(TransportError::DescriptorWriteFailed);
        }
        self.set_state(ConnectionState::Ready);
        info!(
            "connected to {}",
            self.device.as_ref().map(|d| d.display_name()).unwrap_or("Unknown")
        );
        vec![Action::Connected]
    }

    /// Pairing broadcast; only the in-progress device matters
    pub fn on_pairing_request(&mut self, device: &DeviceRef, variant: i32) -> Vec<Action> {
        if !self.concerns(device) {
            return Vec::new();
        }
        debug!("pairing request {} for {}", variant, device);
        if !self.state.is_negotiating() {
            return Vec::new();
        }
        self.fail(TransportError::PairingRequested)
    }

    pub fn on_bond_state_changed(&self, device: &DeviceRef, previous: i32, current: i32) {
        if self.concerns(device) {
            debug!("bond state {} -> {}", previous, current);
        }
    }

    fn concerns(&self, device: &DeviceRef) -> bool {
        self.link_open
            && self
                .device
                .as_ref()
                .map(|current| current.same_device(device))
                .unwrap_or(false)
    }

    // ------------------------------------------------------------------------
    // Command Outcomes
    // ------------------------------------------------------------------------

    /// A command was accepted by the radio
    pub fn on_command_accepted(&mut self, command: &RadioCommand) -> Vec<Action> {
        match command {
            RadioCommand::EnableNotifications { .. }
                if self.state == ConnectionState::ArmingNotifications =>
            {
                self.write_cccd()
            }
            _ => Vec::new(),
        }
    }

    /// A command was refused synchronously by the radio
    pub fn on_command_rejected(&mut self, command: &RadioCommand, error: &RadioError) -> Vec<Action> {
        match (command, self.state) {
            (RadioCommand::DiscoverServices, ConnectionState::DiscoveringServices) => {
                debug!("discover services refused: {}", error);
                self.fail(TransportError::DiscoveryFailed)
            }
            (RadioCommand::RequestMtu(_), ConnectionState::NegotiatingMtu) => {
                debug!("request MTU failed: {}, using default", error);
                self.arm()
            }
            (RadioCommand::EnableNotifications { .. }, ConnectionState::ArmingNotifications) => {
                debug!("enable notifications refused: {}", error);
                self.fail(TransportError::NotificationUnsupported)
            }
            (RadioCommand::WriteDescriptor { .. }, ConnectionState::ArmingNotifications) => {
                debug!("descriptor write refused: {}", error);
                self.fail(TransportError::DescriptorNotWritable)
            }
            (command, state) => {
                debug!("{:?} refused in state {}: {}", command, state, error);
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Arming
    // ------------------------------------------------------------------------

    /// `NegotiatingMtu -> ArmingNotifications`
    fn arm(&mut self) -> Vec<Action> {
        debug!("payload size {}", self.payload_size);
        self.set_state(ConnectionState::ArmingNotifications);
        let Some(pair) = self.pair.as_ref() else {
            return self.fail(TransportError::NoSerialProfile);
        };
        if !pair.write.properties.can_write() {
            return self.fail(TransportError::WriteNotSupported);
        }
        vec![Action::Radio(RadioCommand::EnableNotifications {
            handle: pair.read.handle,
        })]
    }

    fn write_cccd(&mut self) -> Vec<Action> {
        let Some(read) = self.pair.as_ref().map(|p| &p.read) else {
            return Vec::new();
        };
        if !read.has_descriptor(&CCCD_UUID) {
            return self.fail(TransportError::MissingCccd);
        }
        let value = if read.properties.indicate {
            debug!("enable read indication");
            ENABLE_INDICATION_VALUE
        } else if read.properties.notify {
            debug!("enable read notification");
            ENABLE_NOTIFICATION_VALUE
        } else {
            let properties = read.properties.to_string();
            return self.fail(TransportError::NoIndicationOrNotification { properties });
        };
        debug!("writing read characteristic descriptor");
        vec![Action::Radio(RadioCommand::WriteDescriptor {
            handle: read.handle,
            descriptor: CCCD_UUID,
            value: value.to_vec(),
        })]
    }

    // ------------------------------------------------------------------------
    // Data Path Queries
    // ------------------------------------------------------------------------

    /// Whether a value change on `handle` is inbound serial data.
    ///
    /// Data may arrive after the CCCD write was issued but before it is
    /// confirmed, so it is accepted as soon as the read side is known.
    pub fn accepts_notification(&self, handle: u16) -> bool {
        let armed = matches!(
            self.state,
            ConnectionState::NegotiatingMtu
                | ConnectionState::ArmingNotifications
                | ConnectionState::Ready
        );
        armed && self.pair.as_ref().map(|p| p.read.handle) == Some(handle)
    }

    /// Write handle and type, once Ready
    pub fn write_target(&self) -> Option<(u16, WriteType)> {
        if self.state != ConnectionState::Ready {
            return None;
        }
        self.pair.as_ref().map(|pair| {
            let write_type = if pair.write.properties.write {
                WriteType::WithResponse
            } else {
                WriteType::WithoutResponse
            };
            (pair.write.handle, write_type)
        })
    }

    /// Profile flow-control gate
    pub fn write_gate_open(&self) -> bool {
        self.profile.map(|p| p.gate_write()).unwrap_or(false)
    }
}

fn dump_services(services: &[GattService]) {
    warn!("no serial profile among {} discovered services", services.len());
    for service in services {
        debug!("service {}", service.uuid);
        for characteristic in &service.characteristics {
            debug!(
                "characteristic {} handle {:#06x} ({})",
                characteristic.uuid, characteristic.handle, characteristic.properties
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{CharProperties, GattCharacteristic};
    use crate::protocol::{
        NORDIC_UART_CHAR_RW2_UUID, NORDIC_UART_CHAR_RW3_UUID, NORDIC_UART_SERVICE_UUID,
    };

    const WRITE_HANDLE: u16 = 0x0010;
    const READ_HANDLE: u16 = 0x0012;

    fn nordic_services(read: CharProperties) -> Vec<GattService> {
        vec![
            GattService::new(Uuid::from_u128(0x1801), vec![]),
            GattService::new(
                NORDIC_UART_SERVICE_UUID,
                vec![
                    GattCharacteristic::new(
                        NORDIC_UART_CHAR_RW2_UUID,
                        WRITE_HANDLE,
                        CharProperties::WRITE.with(CharProperties::WRITE_WITHOUT_RESPONSE),
                    ),
                    GattCharacteristic::new(NORDIC_UART_CHAR_RW3_UUID, READ_HANDLE, read)
                        .with_descriptor(CCCD_UUID),
                ],
            ),
        ]
    }

    fn negotiating() -> GattNegotiator {
        let mut negotiator = GattNegotiator::new(&TransportConfig::default());
        negotiator.begin(DeviceRef::new("11:22:33:44:55:66")).unwrap();
        negotiator
    }

    fn armed(read: CharProperties) -> GattNegotiator {
        let mut negotiator = negotiating();
        negotiator.on_link_up();
        negotiator.on_services_discovered(&nordic_services(read));
        negotiator.on_mtu_changed(247, true);
        negotiator
    }

    #[test]
    fn test_happy_path() {
        let mut negotiator = negotiating();
        assert_eq!(negotiator.state(), ConnectionState::Connecting);

        assert_eq!(
            negotiator.on_link_up(),
            vec![Action::Radio(RadioCommand::DiscoverServices)]
        );
        assert_eq!(
            negotiator.on_services_discovered(&nordic_services(CharProperties::NOTIFY)),
            vec![Action::Radio(RadioCommand::RequestMtu(512))]
        );
        assert_eq!(negotiator.state(), ConnectionState::NegotiatingMtu);
        assert_eq!(negotiator.profile(), Some(SerialProfile::NordicUart));
        let pair = negotiator.pair().expect("pair selected");
        assert_eq!((pair.read.handle, pair.write.handle), (READ_HANDLE, WRITE_HANDLE));

        let actions = negotiator.on_mtu_changed(247, true);
        assert_eq!(negotiator.payload_size(), 244);
        assert_eq!(
            actions,
            vec![Action::Radio(RadioCommand::EnableNotifications {
                handle: READ_HANDLE
            })]
        );

        let enable = RadioCommand::EnableNotifications {
            handle: READ_HANDLE,
        };
        assert_eq!(
            negotiator.on_command_accepted(&enable),
            vec![Action::Radio(RadioCommand::WriteDescriptor {
                handle: READ_HANDLE,
                descriptor: CCCD_UUID,
                value: ENABLE_NOTIFICATION_VALUE.to_vec(),
            })]
        );

        assert_eq!(
            negotiator.on_descriptor_written(READ_HANDLE, CCCD_UUID, true),
            vec![Action::Connected]
        );
        assert_eq!(negotiator.state(), ConnectionState::Ready);
        assert_eq!(
            negotiator.write_target(),
            Some((WRITE_HANDLE, WriteType::WithResponse))
        );
    }

    #[test]
    fn test_double_begin_rejected() {
        let mut negotiator = negotiating();
        assert!(matches!(
            negotiator.begin(DeviceRef::new("other")),
            Err(SerialError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_indication_preferred() {
        let mut negotiator = armed(CharProperties::NOTIFY.with(CharProperties::INDICATE));
        let actions = negotiator.on_command_accepted(&RadioCommand::EnableNotifications {
            handle: READ_HANDLE,
        });
        assert!(matches!(
            &actions[..],
            [Action::Radio(RadioCommand::WriteDescriptor { value, .. })] if value[..] == ENABLE_INDICATION_VALUE
        ));
    }

    #[test]
    fn test_mtu_unsupported_keeps_default() {
        let mut negotiator = negotiating();
        negotiator.on_link_up();
        negotiator.on_services_discovered(&nordic_services(CharProperties::NOTIFY));
        let actions =
            negotiator.on_command_rejected(&RadioCommand::RequestMtu(512), &RadioError::Unsupported);
        assert_eq!(negotiator.state(), ConnectionState::ArmingNotifications);
        assert_eq!(negotiator.payload_size(), 20);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_failed_mtu_status_keeps_default() {
        let mut negotiator = negotiating();
        negotiator.on_link_up();
        negotiator.on_services_discovered(&nordic_services(CharProperties::NOTIFY));
        negotiator.on_mtu_changed(185, false);
        assert_eq!(negotiator.payload_size(), 20);
    }

    #[test]
    fn test_link_down_before_ready_is_connect_error() {
        let mut negotiator = negotiating();
        assert_eq!(
            negotiator.on_link_down(133),
            vec![Action::ConnectFailed(TransportError::LinkError { status: 133 })]
        );
        assert_eq!(negotiator.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_link_down_after_ready_is_io_error() {
        let mut negotiator = armed(CharProperties::NOTIFY);
        negotiator.on_descriptor_written(READ_HANDLE, CCCD_UUID, true);
        assert_eq!(
            negotiator.on_link_down(8),
            vec![Action::LinkLost(TransportError::UnexpectedDisconnect { status: 8 })]
        );
        assert_eq!(negotiator.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn test_arming_failures() {
        let mut negotiator = armed(CharProperties::none());
        let actions = negotiator.on_command_accepted(&RadioCommand::EnableNotifications {
            handle: READ_HANDLE,
        });
        assert!(matches!(
            &actions[..],
            [Action::ConnectFailed(TransportError::NoIndicationOrNotification { .. })]
        ));

        let mut negotiator = armed(CharProperties::NOTIFY);
        let actions = negotiator.on_command_rejected(
            &RadioCommand::EnableNotifications {
                handle: READ_HANDLE,
            },
            &RadioError::Rejected("busy".into()),
        );
        assert_eq!(
            actions,
            vec![Action::ConnectFailed(TransportError::NotificationUnsupported)]
        );

        let mut negotiator = armed(CharProperties::NOTIFY);
        assert_eq!(
            negotiator.on_descriptor_written(READ_HANDLE, CCCD_UUID, false),
            vec![Action::ConnectFailed(TransportError::DescriptorWriteFailed)]
        );
    }

    #[test]
    fn test_missing_cccd() {
        let mut negotiator = negotiating();
        negotiator.on_link_up();
        let mut services = nordic_services(CharProperties::NOTIFY);
        services[1].characteristics[1].descriptors.clear();
        negotiator.on_services_discovered(&services);
        negotiator.on_mtu_changed(23, true);
        let actions = negotiator.on_command_accepted(&RadioCommand::EnableNotifications {
            handle: READ_HANDLE,
        });
        assert_eq!(
            actions,
            vec![Action::ConnectFailed(TransportError::MissingCccd)]
        );
    }

    #[test]
    fn test_pairing_request_only_for_current_device() {
        let mut negotiator = negotiating();
        assert!(negotiator
            .on_pairing_request(&DeviceRef::new("99:99:99:99:99:99"), 0)
            .is_empty());
        assert_eq!(
            negotiator.on_pairing_request(&DeviceRef::new("11:22:33:44:55:66"), 0),
            vec![Action::ConnectFailed(TransportError::PairingRequested)]
        );
    }

    #[test]
    fn test_early_notification_accepted() {
        let negotiator = armed(CharProperties::NOTIFY);
        assert_eq!(negotiator.state(), ConnectionState::ArmingNotifications);
        assert!(negotiator.accepts_notification(READ_HANDLE));
        assert!(!negotiator.accepts_notification(WRITE_HANDLE));
        assert_eq!(negotiator.write_target(), None);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut negotiator = armed(CharProperties::NOTIFY);
        assert!(negotiator.begin_teardown());
        negotiator.finish_teardown();
        assert_eq!(negotiator.state(), ConnectionState::Disconnected);
        assert!(negotiator.pair().is_none());
        assert!(negotiator.profile().is_none());
        assert!(!negotiator.begin_teardown());
        negotiator.finish_teardown();
        assert!(!negotiator.is_busy());
        assert!(negotiator.on_link_up().is_empty());
    }
}
