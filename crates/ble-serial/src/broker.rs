//! Event delivery to a detachable listener
//!
//! The broker owns every event the transport produces until exactly one
//! listener invocation has consumed it. While a listener is attached, events
//! are queued in flight and one dispatch job per event is posted to the
//! dispatch context. While none is attached, events are buffered in one of
//! two queues:
//!
//! - the post-detach queue, for events produced after a listener detached
//!   during the current connection
//! - the pre-attach queue, for events produced before any listener attached
//!   (or after a new connection started without one)
//!
//! Attaching drains post-detach, then pre-attach, then anything still in
//! flight, in that order. Inbound frames are coalesced: a frame joins the
//! batch at the tail of the queue until that batch's dispatch job runs.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::dispatch::DispatchContext;
use crate::error::{Result, SerialError, TransportError};

// ----------------------------------------------------------------------------
// Events and Listener
// ----------------------------------------------------------------------------

/// Events produced by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    ConnectError(TransportError),
    /// Inbound frames in arrival order
    DataBatch(Vec<Vec<u8>>),
    IoError(TransportError),
}

impl Event {
    fn deliver(self, listener: &dyn SerialListener) {
        match self {
            Event::Connected => listener.on_connected(),
            Event::ConnectError(error) => listener.on_connect_error(&error),
            Event::DataBatch(frames) => listener.on_data_batch(frames),
            Event::IoError(error) => listener.on_io_error(&error),
        }
    }
}

/// Receiver of transport events; invoked only on the dispatch context
pub trait SerialListener: Send + Sync {
    fn on_connected(&self);

    fn on_connect_error(&self, error: &TransportError);

    /// One inbound frame
    fn on_data(&self, data: &[u8]) {
        let _ = data;
    }

    /// A coalesced burst of frames; forwards each to `on_data` by default
    fn on_data_batch(&self, frames: Vec<Vec<u8>>) {
        for frame in &frames {
            self.on_data(frame);
        }
    }

    fn on_io_error(&self, error: &TransportError);
}

// ----------------------------------------------------------------------------
// Broker State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    /// Cleared first on disconnect; closed brokers drop new events
    open: bool,
    listener: Option<Weak<dyn SerialListener>>,
    /// A listener was attached at some point during this connection
    listener_seen: bool,
    /// Bumped whenever in-flight events change owner; stale jobs compare it
    epoch: u64,
    in_flight: VecDeque<Event>,
    /// The tail of `in_flight` is a batch whose job has not run yet
    batch_open: bool,
    post_detach: VecDeque<Event>,
    pre_attach: VecDeque<Event>,
}

impl BrokerState {
    /// Current listener; a dropped listener counts as a detach
    fn live_listener(&mut self) -> Option<Arc<dyn SerialListener>> {
        let weak = self.listener.as_ref()?;
        match weak.upgrade() {
            Some(listener) => Some(listener),
            None => {
                debug!("listener dropped without detach");
                self.unbind();
                None
            }
        }
    }

    fn unbind(&mut self) {
        self.listener = None;
        let in_flight = std::mem::take(&mut self.in_flight);
        self.post_detach.extend(in_flight);
        self.batch_open = false;
        self.epoch += 1;
    }

    fn buffer_queue(&mut self) -> &mut VecDeque<Event> {
        if self.listener_seen {
            &mut self.post_detach
        } else {
            &mut self.pre_attach
        }
    }

    fn buffer(&mut self, event: Event) {
        let queue = self.buffer_queue();
        if let Event::DataBatch(frames) = event {
            if let Some(Event::DataBatch(tail)) = queue.back_mut() {
                tail.extend(frames);
                return;
            }
            queue.push_back(Event::DataBatch(frames));
        } else {
            queue.push_back(event);
        }
    }

    fn buffered(&self) -> usize {
        self.post_detach.len() + self.pre_attach.len()
    }

    fn clear(&mut self) {
        self.in_flight.clear();
        self.post_detach.clear();
        self.pre_attach.clear();
        self.batch_open = false;
        self.epoch += 1;
    }
}

// ----------------------------------------------------------------------------
// Event Broker
// ----------------------------------------------------------------------------

/// Buffers and dispatches transport events
pub struct EventBroker {
    state: Arc<Mutex<BrokerState>>,
    /// Held for each listener invocation; `close(true)` waits on it
    delivery: Arc<ReentrantMutex<()>>,
    dispatcher: Arc<dyn DispatchContext>,
}

impl EventBroker {
    pub fn new(dispatcher: Arc<dyn DispatchContext>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            delivery: Arc::new(ReentrantMutex::new(())),
            dispatcher,
        }
    }

    /// Accept events for a new connection
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.open = true;
        let attached = state.live_listener().is_some();
        state.listener_seen = attached;
    }

    /// Stop accepting events. With `discard`, everything not yet delivered
    /// is dropped as well, and the call returns only once no listener
    /// invocation is running on another thread.
    pub fn close(&self, discard: bool) {
        let _delivering = discard.then(|| self.delivery.lock());
        let mut state = self.state.lock();
        state.open = false;
        if discard {
            let dropped = state.buffered() + state.in_flight.len();
            if dropped > 0 {
                debug!("discarding {} undelivered events", dropped);
            }
            state.clear();
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of events waiting for a listener
    pub fn buffered(&self) -> usize {
        self.state.lock().buffered()
    }

    pub fn has_listener(&self) -> bool {
        self.state.lock().live_listener().is_some()
    }

    /// Produce a non-data event
    pub fn publish(&self, event: Event) {
        let mut state = self.state.lock();
        if !state.open {
            trace!("dropping {:?} after disconnect", event);
            return;
        }
        if state.live_listener().is_some() {
            state.in_flight.push_back(event);
            state.batch_open = false;
            let epoch = state.epoch;
            drop(state);
            self.schedule(epoch);
        } else {
            state.buffer(event);
        }
    }

    /// Produce one inbound frame, coalescing with the pending batch
    pub fn publish_frame(&self, frame: Vec<u8>) {
        let mut state = self.state.lock();
        if !state.open {
            trace!("dropping {} byte frame after disconnect", frame.len());
            return;
        }
        if state.live_listener().is_none() {
            state.buffer(Event::DataBatch(vec![frame]));
            return;
        }

        if state.batch_open {
            if let Some(Event::DataBatch(tail)) = state.in_flight.back_mut() {
                tail.push(frame);
                return;
            }
        }
        state.in_flight.push_back(Event::DataBatch(vec![frame]));
        state.batch_open = true;
        let epoch = state.epoch;
        drop(state);
        self.schedule(epoch);
    }

    fn schedule(&self, epoch: u64) {
        let state = Arc::clone(&self.state);
        let delivery = Arc::clone(&self.delivery);
        self.dispatcher
            .post(Box::new(move || run_dispatch(&state, &delivery, epoch)));
    }

    /// Bind a listener and hand it every buffered event.
    ///
    /// Must be called on the dispatch context. The backlog is handed over one
    /// event at a time, so a `detach` or `disconnect` issued from one of the
    /// callbacks stops the rest of it.
    pub fn attach(&self, listener: &Arc<dyn SerialListener>) -> Result<()> {
        if !self.dispatcher.is_current() {
            return Err(SerialError::WrongDispatchContext);
        }

        let (epoch, backlog) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.batch_open = false;
            let mut backlog: VecDeque<Event> = state.post_detach.drain(..).collect();
            backlog.extend(state.pre_attach.drain(..));
            backlog.extend(state.in_flight.drain(..));
            let count = backlog.len();
            state.in_flight = backlog;
            state.listener = Some(Arc::downgrade(listener));
            state.listener_seen = true;
            (state.epoch, count)
        };

        debug!("listener attached, delivering {} buffered events", backlog);
        for _ in 0..backlog {
            let _delivering = self.delivery.lock();
            let event = {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    debug!("backlog delivery interrupted");
                    break;
                }
                match state.in_flight.pop_front() {
                    Some(event) => event,
                    None => break,
                }
            };
            event.deliver(listener.as_ref());
        }
        Ok(())
    }

    /// Unbind the listener; later events are buffered
    pub fn detach(&self) {
        let mut state = self.state.lock();
        if state.listener.is_some() {
            debug!("listener detached");
            state.unbind();
        }
    }
}

/// Dispatch job body: deliver the oldest in-flight event
fn run_dispatch(state: &Mutex<BrokerState>, delivery: &ReentrantMutex<()>, epoch: u64) {
    let _delivering = delivery.lock();
    let (listener, event) = {
        let mut state = state.lock();
        if state.epoch != epoch {
            return;
        }
        let Some(listener) = state.live_listener() else {
            return;
        };
        let Some(event) = state.in_flight.pop_front() else {
            return;
        };
        if state.in_flight.is_empty() {
            state.batch_open = false;
        }
        (listener, event)
    };
    event.deliver(listener.as_ref());
}
