//! Serial transport over a GATT link
//!
//! [`SerialTransport`] is the collaborator-facing handle. It feeds radio
//! callbacks into the negotiator, executes the resulting actions, drives the
//! write queue and forwards events to the broker.
//!
//! Two locks exist: the link lock (negotiator, write queue, held frames) and
//! the broker's own lock. They are never held together, and radio requests
//! are always issued with neither held.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broker::{Event, EventBroker, SerialListener};
use crate::config::TransportConfig;
use crate::dispatch::{DispatchContext, ThreadDispatcher};
use crate::error::{Result, SerialError, TransportError};
use crate::gatt::{DeviceRef, GattService};
use crate::negotiator::{Action, ConnectionState, GattNegotiator};
use crate::radio::{GattRadio, RadioEvent, WriteType};
use crate::write_queue::WriteQueue;

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

struct LinkState {
    negotiator: GattNegotiator,
    writes: WriteQueue,
    /// Frames held until `Connected` has been published
    early_frames: Vec<Vec<u8>>,
    holding: bool,
}

struct Inner {
    config: TransportConfig,
    radio: Arc<dyn GattRadio>,
    link: Mutex<LinkState>,
    broker: EventBroker,
}

/// A chunk ready to hand to the radio
struct ChunkWrite {
    handle: u16,
    write_type: WriteType,
    data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Serial Transport
// ----------------------------------------------------------------------------

/// Byte-stream transport over one BLE serial connection
#[derive(Clone)]
pub struct SerialTransport {
    inner: Arc<Inner>,
}

impl SerialTransport {
    /// Create a transport delivering events on `dispatcher`
    pub fn new(
        radio: Arc<dyn GattRadio>,
        dispatcher: Arc<dyn DispatchContext>,
        config: TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        let link = LinkState {
            negotiator: GattNegotiator::new(&config),
            writes: WriteQueue::new(),
            early_frames: Vec::new(),
            holding: false,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                radio,
                link: Mutex::new(link),
                broker: EventBroker::new(dispatcher),
            }),
        })
    }

    /// Create a transport with its own dispatch thread
    pub fn spawn(
        radio: Arc<dyn GattRadio>,
        config: TransportConfig,
    ) -> Result<(Self, Arc<ThreadDispatcher>)> {
        let dispatcher = Arc::new(ThreadDispatcher::spawn(config.dispatch_thread_name.clone())?);
        let transport = Self::new(radio, dispatcher.clone(), config)?;
        Ok((transport, dispatcher))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Collaborator API
    // ------------------------------------------------------------------------

    /// Start connecting to `device`. Progress is reported as events.
    pub fn connect(&self, device: DeviceRef) -> Result<()> {
        let actions = {
            let mut link = self.inner.link.lock();
            let actions = link.negotiator.begin(device.clone())?;
            link.writes.clear();
            link.early_frames.clear();
            link.holding = self.inner.config.hold_early_data;
            actions
        };
        self.inner.broker.open();

        for action in actions {
            match action {
                Action::Radio(command) => {
                    if let Err(error) = command.execute(self.inner.radio.as_ref()) {
                        warn!("connect to {} refused: {}", device, error);
                        self.inner.link.lock().negotiator.abandon();
                        self.inner.broker.close(false);
                        return Err(SerialError::ConnectFailed(error));
                    }
                }
                other => self.run(VecDeque::from([other])),
            }
        }
        Ok(())
    }

    /// Tear down the connection; no further events are delivered for it.
    ///
    /// Safe to call from a listener callback. Called from any other thread,
    /// it waits for a callback that is already running to return.
    pub fn disconnect(&self) {
        info!("disconnect");
        self.teardown(true);
    }

    /// Queue `data` for transmission
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let chunk = {
            let mut link = self.inner.link.lock();
            let Some((handle, write_type)) = link.negotiator.write_target() else {
                return Err(SerialError::NotConnected);
            };
            let payload_size = link.negotiator.payload_size();
            let gate_open = link.negotiator.write_gate_open();
            link.writes
                .enqueue(data, payload_size, gate_open)
                .map(|data| ChunkWrite {
                    handle,
                    write_type,
                    data,
                })
        };
        if let Some(chunk) = chunk {
            self.send_chunk(chunk);
        }
        Ok(())
    }

    /// Re-check the profile's flow-control gate and send the next queued
    /// chunk if it opened while no write was in flight.
    ///
    /// Profiles with a gate call this once the peer signals free buffer
    /// space; a write confirmation re-checks the gate on its own.
    pub fn resume_writes(&self) {
        let chunk = {
            let mut link = self.inner.link.lock();
            let Some((handle, write_type)) = link.negotiator.write_target() else {
                return;
            };
            let gate_open = link.negotiator.write_gate_open();
            link.writes.resume(gate_open).map(|data| ChunkWrite {
                handle,
                write_type,
                data,
            })
        };
        if let Some(chunk) = chunk {
            self.send_chunk(chunk);
        }
    }

    /// Bind a listener; must be called on the dispatch context
    pub fn attach(&self, listener: &Arc<dyn SerialListener>) -> Result<()> {
        self.inner.broker.attach(listener)
    }

    /// Unbind the listener; events are buffered until the next attach
    pub fn detach(&self) {
        self.inner.broker.detach();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().negotiator.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Current write chunk size
    pub fn payload_budget(&self) -> usize {
        self.inner.link.lock().negotiator.payload_size()
    }

    pub fn device(&self) -> Option<DeviceRef> {
        self.inner.link.lock().negotiator.device().cloned()
    }

    /// Reason of the most recent `ConnectError` or `IoError`
    pub fn last_failure(&self) -> Option<TransportError> {
        self.inner.link.lock().negotiator.last_failure().cloned()
    }

    /// Events waiting for a listener
    pub fn buffered_events(&self) -> usize {
        self.inner.broker.buffered()
    }

    // ------------------------------------------------------------------------
    // Radio Intake
    // ------------------------------------------------------------------------

    /// Feed one radio callback into the transport
    pub fn handle_radio_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::LinkUp => self.on_link_up(),
            RadioEvent::LinkDown { status } => self.on_link_down(status),
            RadioEvent::ServicesDiscovered(services) => self.on_services_discovered(&services),
            RadioEvent::MtuChanged { mtu, success } => self.on_mtu_changed(mtu, success),
            RadioEvent::DescriptorWritten {
                handle,
                descriptor,
                success,
            } => self.on_descriptor_write(handle, descriptor, success),
            RadioEvent::CharacteristicWritten { handle, success } => {
                self.on_characteristic_write(handle, success)
            }
            RadioEvent::CharacteristicChanged { handle, value } => {
                self.on_characteristic_changed(handle, value)
            }
            RadioEvent::PairingRequest { device, variant } => {
                self.on_pairing_request(&device, variant)
            }
            RadioEvent::BondStateChanged {
                device,
                previous,
                current,
            } => self.on_bond_state_changed(&device, previous, current),
        }
    }

    pub fn on_link_up(&self) {
        let actions = self.inner.link.lock().negotiator.on_link_up();
        self.run(actions.into());
    }

    pub fn on_link_down(&self, status: i32) {
        let actions = self.inner.link.lock().negotiator.on_link_down(status);
        self.run(actions.into());
    }

    pub fn on_services_discovered(&self, services: &[GattService]) {
        let actions = self
            .inner
            .link
            .lock()
            .negotiator
            .on_services_discovered(services);
        self.run(actions.into());
    }

    pub fn on_mtu_changed(&self, mtu: u16, success: bool) {
        let actions = self.inner.link.lock().negotiator.on_mtu_changed(mtu, success);
        self.run(actions.into());
    }

    pub fn on_descriptor_write(&self, handle: u16, descriptor: Uuid, success: bool) {
        let actions = self
            .inner
            .link
            .lock()
            .negotiator
            .on_descriptor_written(handle, descriptor, success);
        self.run(actions.into());
    }

    /// Write confirmation for the in-flight chunk
    pub fn on_characteristic_write(&self, handle: u16, success: bool) {
        let mut link = self.inner.link.lock();
        let Some((write_handle, write_type)) = link.negotiator.write_target() else {
            trace!("write confirmation ignored, not connected");
            return;
        };
        if handle != write_handle {
            trace!("write confirmation for handle {:#06x} ignored", handle);
            return;
        }

        if !success {
            link.writes.halt();
            let actions = link.negotiator.lose_link(TransportError::WriteFailed);
            drop(link);
            self.run(actions.into());
            return;
        }

        trace!("write complete on handle {:#06x}", handle);
        let gate_open = link.negotiator.write_gate_open();
        let next = link.writes.on_write_complete(gate_open);
        drop(link);
        if let Some(data) = next {
            self.send_chunk(ChunkWrite {
                handle: write_handle,
                write_type,
                data,
            });
        }
    }

    /// Inbound value change on any characteristic
    pub fn on_characteristic_changed(&self, handle: u16, value: Vec<u8>) {
        let frame = {
            let mut link = self.inner.link.lock();
            if !link.negotiator.accepts_notification(handle) {
                trace!("value change on handle {:#06x} ignored", handle);
                return;
            }
            if link.holding {
                link.early_frames.push(value);
                return;
            }
            value
        };
        trace!("received {} bytes: {}", frame.len(), hex::encode(&frame));
        self.inner.broker.publish_frame(frame);
    }

    pub fn on_pairing_request(&self, device: &DeviceRef, variant: i32) {
        let actions = self
            .inner
            .link
            .lock()
            .negotiator
            .on_pairing_request(device, variant);
        self.run(actions.into());
    }

    pub fn on_bond_state_changed(&self, device: &DeviceRef, previous: i32, current: i32) {
        self.inner
            .link
            .lock()
            .negotiator
            .on_bond_state_changed(device, previous, current);
    }

    // ------------------------------------------------------------------------
    // Action Execution
    // ------------------------------------------------------------------------

    fn run(&self, mut actions: VecDeque<Action>) {
        while let Some(action) = actions.pop_front() {
            match action {
                Action::Radio(command) => {
                    trace!("radio {:?}", command);
                    let result = command.execute(self.inner.radio.as_ref());
                    let follow_up = {
                        let mut link = self.inner.link.lock();
                        match &result {
                            Ok(()) => link.negotiator.on_command_accepted(&command),
                            Err(error) => link.negotiator.on_command_rejected(&command, error),
                        }
                    };
                    actions.extend(follow_up);
                }
                Action::Connected => {
                    self.inner.broker.publish(Event::Connected);
                    self.release_early_frames();
                }
                Action::ConnectFailed(error) => {
                    self.inner.broker.publish(Event::ConnectError(error));
                    self.teardown(false);
                }
                Action::LinkLost(error) => {
                    self.inner.broker.publish(Event::IoError(error));
                    self.teardown(false);
                }
            }
        }
    }

    /// Publish frames held before `Connected`, then stop holding
    fn release_early_frames(&self) {
        loop {
            let frames = {
                let mut link = self.inner.link.lock();
                if link.early_frames.is_empty() {
                    link.holding = false;
                    return;
                }
                std::mem::take(&mut link.early_frames)
            };
            debug!("releasing {} early frames", frames.len());
            for frame in frames {
                self.inner.broker.publish_frame(frame);
            }
        }
    }

    fn send_chunk(&self, chunk: ChunkWrite) {
        trace!(
            "write {} bytes to handle {:#06x}: {}",
            chunk.data.len(),
            chunk.handle,
            hex::encode(&chunk.data)
        );
        let result = self
            .inner
            .radio
            .write_characteristic(chunk.handle, &chunk.data, chunk.write_type);
        if let Err(error) = result {
            warn!("write refused: {}", error);
            let actions = {
                let mut link = self.inner.link.lock();
                link.writes.halt();
                link.negotiator.lose_link(TransportError::WriteFailed)
            };
            self.run(actions.into());
        }
    }

    /// Clear queues and release the radio. An explicit disconnect also
    /// discards undelivered events; a failure teardown keeps them so the
    /// error itself still reaches the listener.
    fn teardown(&self, discard_events: bool) {
        self.inner.broker.close(discard_events);
        let was_open = {
            let mut link = self.inner.link.lock();
            link.writes.clear();
            link.early_frames.clear();
            link.holding = false;
            link.negotiator.begin_teardown()
        };
        if was_open {
            info!("closing link");
            self.inner.radio.disconnect();
        }
        self.inner.link.lock().negotiator.finish_teardown();
    }
}
