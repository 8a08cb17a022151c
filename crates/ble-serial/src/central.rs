//! btleplug-backed radio
//!
//! [`BtleplugRadio`] implements [`GattRadio`] on top of a btleplug adapter.
//! Each accepted request is carried out by a tokio task, and its outcome is
//! sent as a [`RadioEvent`] over an unbounded channel. [`pump_events`] feeds
//! that channel into a [`SerialTransport`].
//!
//! btleplug does not expose MTU negotiation, so `request_mtu` always reports
//! `Unsupported` and the transport keeps its default payload size. Arming the
//! CCCD goes through `subscribe`, which picks notify or indicate itself.

use std::collections::HashMap;
use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RadioError;
use crate::gatt::{CharProperties, DeviceRef, GattCharacteristic, GattService};
use crate::protocol::CCCD_UUID;
use crate::radio::{GattRadio, RadioEvent, WriteType};
use crate::transport::SerialTransport;

/// Status reported when a connect or discovery attempt fails
pub const GATT_ERROR_STATUS: i32 = 0x85;

/// Status reported when the adapter announces a disconnect
pub const LINK_LOST_STATUS: i32 = 0x13;

// ----------------------------------------------------------------------------
// Adapter Setup
// ----------------------------------------------------------------------------

/// First adapter reported by the platform manager
pub async fn first_adapter() -> Result<Adapter, RadioError> {
    let manager = Manager::new()
        .await
        .map_err(|e| RadioError::Rejected(format!("Failed to create BLE manager: {}", e)))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| RadioError::Rejected(format!("Failed to get BLE adapters: {}", e)))?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| RadioError::Rejected("No BLE adapters available".to_string()))
}

/// Feed radio events into the transport until the radio is dropped
pub async fn pump_events(
    transport: SerialTransport,
    mut events: mpsc::UnboundedReceiver<RadioEvent>,
) {
    while let Some(event) = events.recv().await {
        transport.handle_radio_event(event);
    }
    debug!("radio event channel closed");
}

// ----------------------------------------------------------------------------
// Radio
// ----------------------------------------------------------------------------

struct CentralLink {
    peripheral: Peripheral,
    characteristics: HashMap<u16, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl CentralLink {
    fn handle_for(&self, uuid: &Uuid) -> Option<u16> {
        self.characteristics
            .iter()
            .find(|(_, c)| c.uuid == *uuid)
            .map(|(handle, _)| *handle)
    }
}

/// The open link plus the connect attempt that may produce one.
///
/// Every `connect` and `disconnect` bumps `generation`. A connect task only
/// installs its link while its generation is still current; otherwise it
/// closes the peripheral it opened.
struct LinkSlot<L> {
    generation: u64,
    connecting: Option<JoinHandle<()>>,
    link: Option<L>,
}

impl<L> Default for LinkSlot<L> {
    fn default() -> Self {
        Self {
            generation: 0,
            connecting: None,
            link: None,
        }
    }
}

impl<L> LinkSlot<L> {
    /// Start a connect attempt; returns its generation and the previous
    /// attempt, which must finish first
    fn begin(&mut self) -> Result<(u64, Option<JoinHandle<()>>), RadioError> {
        if self.link.is_some() {
            return Err(RadioError::Rejected("link already open".to_string()));
        }
        self.generation += 1;
        Ok((self.generation, self.connecting.take()))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Install the link of attempt `generation`; hands it back if that
    /// attempt was cancelled
    fn install(&mut self, generation: u64, link: L) -> Result<(), L> {
        if !self.is_current(generation) {
            return Err(link);
        }
        self.link = Some(link);
        Ok(())
    }

    /// Cancel any connect attempt and take the open link
    fn cancel(&mut self) -> Option<L> {
        self.generation += 1;
        self.link.take()
    }

    fn link(&self) -> Option<&L> {
        self.link.as_ref()
    }

    fn link_mut(&mut self) -> Option<&mut L> {
        self.link.as_mut()
    }
}

type SharedSlot = Arc<Mutex<LinkSlot<CentralLink>>>;

/// Send `event` only while attempt `generation` has not been cancelled
fn report(
    slot: &Mutex<LinkSlot<CentralLink>>,
    generation: u64,
    events: &mpsc::UnboundedSender<RadioEvent>,
    event: RadioEvent,
) {
    if slot.lock().is_current(generation) {
        let _ = events.send(event);
    } else {
        debug!("dropping {:?} from cancelled connect", event);
    }
}

/// GATT central built on a btleplug adapter
pub struct BtleplugRadio {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<RadioEvent>,
    link: SharedSlot,
    watcher: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Wrap `adapter`; must be called inside a tokio runtime
    pub async fn new(
        adapter: Adapter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>), RadioError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let link: SharedSlot = Arc::new(Mutex::new(LinkSlot::default()));

        let mut central_events = adapter
            .events()
            .await
            .map_err(|e| RadioError::Rejected(format!("Failed to get adapter events: {}", e)))?;
        let watcher = {
            let link = Arc::clone(&link);
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(event) = central_events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        let ours = link
                            .lock()
                            .link()
                            .map(|l| l.peripheral.id() == id)
                            .unwrap_or(false);
                        if ours {
                            info!("peripheral disconnected");
                            let _ = events.send(RadioEvent::LinkDown {
                                status: LINK_LOST_STATUS,
                            });
                        }
                    }
                }
            })
        };

        Ok((
            Self {
                adapter,
                runtime: Handle::current(),
                events,
                link,
                watcher,
            },
            receiver,
        ))
    }

    fn peripheral(&self) -> Result<Peripheral, RadioError> {
        self.link
            .lock()
            .link()
            .map(|l| l.peripheral.clone())
            .ok_or(RadioError::NotConnected)
    }

    fn characteristic(&self, handle: u16) -> Result<(Peripheral, Characteristic), RadioError> {
        let slot = self.link.lock();
        let link = slot.link().ok_or(RadioError::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| RadioError::Rejected(format!("unknown handle {:#06x}", handle)))?;
        Ok((link.peripheral.clone(), characteristic))
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Some(link) = self.link.lock().link_mut() {
            link.tasks.retain(|t| !t.is_finished());
            link.tasks.push(task);
        }
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Option<Peripheral> {
    let peripherals = adapter.peripherals().await.ok()?;
    peripherals
        .into_iter()
        .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
}

fn convert_properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// Convert btleplug services, assigning handles in enumeration order
fn convert_services(peripheral: &Peripheral) -> (Vec<GattService>, HashMap<u16, Characteristic>) {
    let mut next_handle: u16 = 1;
    let mut handles = HashMap::new();
    let services = peripheral
        .services()
        .into_iter()
        .map(|service| {
            let characteristics = service
                .characteristics
                .into_iter()
                .map(|characteristic| {
                    let handle = next_handle;
                    next_handle = next_handle.wrapping_add(1);
                    let converted = GattCharacteristic {
                        uuid: characteristic.uuid,
                        handle,
                        properties: convert_properties(characteristic.properties),
                        descriptors: characteristic.descriptors.iter().map(|d| d.uuid).collect(),
                    };
                    handles.insert(handle, characteristic);
                    converted
                })
                .collect();
            GattService::new(service.uuid, characteristics)
        })
        .collect();
    (services, handles)
}

impl GattRadio for BtleplugRadio {
    fn connect(&self, device: &DeviceRef) -> Result<(), RadioError> {
        let (generation, previous) = self.link.lock().begin()?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let link = Arc::clone(&self.link);
        let address = device.address.clone();
        let task = self.runtime.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if !link.lock().is_current(generation) {
                debug!("connect to {} cancelled before start", address);
                return;
            }

            let Some(peripheral) = find_peripheral(&adapter, &address).await else {
                warn!("{}", RadioError::UnknownDevice { address });
                report(&link, generation, &events, RadioEvent::LinkDown {
                    status: GATT_ERROR_STATUS,
                });
                return;
            };
            if let Err(e) = peripheral.connect().await {
                error!("Failed to connect to {}: {}", address, e);
                report(&link, generation, &events, RadioEvent::LinkDown {
                    status: GATT_ERROR_STATUS,
                });
                return;
            }
            info!("Connected to peripheral {}", address);

            let notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    let _ = peripheral.disconnect().await;
                    report(&link, generation, &events, RadioEvent::LinkDown {
                        status: GATT_ERROR_STATUS,
                    });
                    return;
                }
            };

            let pump = {
                let link = Arc::clone(&link);
                let events = events.clone();
                tokio::spawn(async move {
                    let mut notifications = notifications;
                    while let Some(data) = notifications.next().await {
                        let handle = link.lock().link().and_then(|l| l.handle_for(&data.uuid));
                        if let Some(handle) = handle {
                            let _ = events.send(RadioEvent::CharacteristicChanged {
                                handle,
                                value: data.value,
                            });
                        }
                    }
                    debug!("notification stream ended");
                })
            };

            let installed = link.lock().install(
                generation,
                CentralLink {
                    peripheral,
                    characteristics: HashMap::new(),
                    tasks: vec![pump],
                },
            );
            match installed {
                Ok(()) => {
                    let _ = events.send(RadioEvent::LinkUp);
                }
                Err(cancelled) => {
                    info!("connect to {} cancelled, closing link", address);
                    for task in &cancelled.tasks {
                        task.abort();
                    }
                    if let Err(e) = cancelled.peripheral.disconnect().await {
                        error!("Failed to disconnect: {}", e);
                    }
                }
            }
        });
        self.link.lock().connecting = Some(task);
        Ok(())
    }

    fn discover_services(&self) -> Result<(), RadioError> {
        let peripheral = self.peripheral()?;
        let events = self.events.clone();
        let link = Arc::clone(&self.link);
        let task = self.runtime.spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                error!("Failed to discover services: {}", e);
                let _ = events.send(RadioEvent::LinkDown {
                    status: GATT_ERROR_STATUS,
                });
                return;
            }
            let (services, handles) = convert_services(&peripheral);
            if let Some(link) = link.lock().link_mut() {
                link.characteristics = handles;
            }
            let _ = events.send(RadioEvent::ServicesDiscovered(services));
        });
        self.track(task);
        Ok(())
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), RadioError> {
        Err(RadioError::Unsupported)
    }

    fn enable_notifications(&self, handle: u16) -> Result<(), RadioError> {
        // The notification stream is opened at connect time
        self.characteristic(handle).map(|_| ())
    }

    fn write_descriptor(&self, handle: u16, descriptor: Uuid, value: &[u8]) -> Result<(), RadioError> {
        if descriptor != CCCD_UUID || value.iter().all(|b| *b == 0) {
            return Err(RadioError::Unsupported);
        }
        let (peripheral, characteristic) = self.characteristic(handle)?;
        let events = self.events.clone();
        let task = self.runtime.spawn(async move {
            let success = match peripheral.subscribe(&characteristic).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    false
                }
            };
            let _ = events.send(RadioEvent::DescriptorWritten {
                handle,
                descriptor,
                success,
            });
        });
        self.track(task);
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: u16,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        let events = self.events.clone();
        let data = data.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };
        let task = self.runtime.spawn(async move {
            let success = match peripheral.write(&characteristic, &data, write_type).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to write to characteristic: {}", e);
                    false
                }
            };
            let _ = events.send(RadioEvent::CharacteristicWritten { handle, success });
        });
        self.track(task);
        Ok(())
    }

    fn disconnect(&self) {
        let Some(link) = self.link.lock().cancel() else {
            debug!("no open link; pending connect cancelled");
            return;
        };
        for task in &link.tasks {
            task.abort();
        }
        let peripheral = link.peripheral;
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                error!("Failed to disconnect: {}", e);
            }
            info!("Disconnected from peripheral");
        });
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.watcher.abort();
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_connect_cannot_install() {
        let mut slot: LinkSlot<&str> = LinkSlot::default();
        let (first, previous) = slot.begin().unwrap();
        assert!(previous.is_none());

        // disconnect while the attempt is still running
        assert_eq!(slot.cancel(), None);
        assert!(!slot.is_current(first));
        assert_eq!(slot.install(first, "stale"), Err("stale"));
        assert!(slot.link().is_none());

        let (second, _) = slot.begin().unwrap();
        assert_eq!(slot.install(second, "live"), Ok(()));
        assert!(matches!(slot.begin(), Err(RadioError::Rejected(_))));

        assert_eq!(slot.cancel(), Some("live"));
        assert!(slot.begin().is_ok());
    }

    #[test]
    fn test_property_flags() {
        let props = convert_properties(CharPropFlags::WRITE | CharPropFlags::INDICATE);
        assert!(props.write);
        assert!(props.indicate);
        assert!(!props.notify);
        assert!(!props.write_without_response);
    }
}
