//! Dispatch contexts for listener delivery
//!
//! All listener callbacks run on one designated context. [`ThreadDispatcher`]
//! owns a dedicated named thread; [`ManualDispatcher`] queues jobs until the
//! owning thread drains them, which suits host event loops and tests.

use std::collections::VecDeque;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A unit of work posted to the dispatch context
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The single context on which listener callbacks run
pub trait DispatchContext: Send + Sync {
    /// Schedule a job; jobs run in posting order
    fn post(&self, job: Job);

    /// Whether the caller is currently running on this context
    fn is_current(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Thread Dispatcher
// ----------------------------------------------------------------------------

/// Runs jobs on a dedicated thread
pub struct ThreadDispatcher {
    sender: Option<mpsc::UnboundedSender<Job>>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl ThreadDispatcher {
    /// Spawn the dispatch thread
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                job();
            }
            debug!("dispatch thread exiting");
        })?;
        debug!("dispatch thread {} started", name);

        Ok(Self {
            sender: Some(sender),
            thread_id: handle.thread().id(),
            handle: Some(handle),
        })
    }

    /// Run `job` on the dispatch thread and wait for its result.
    ///
    /// Returns `None` if the dispatch thread is gone.
    pub fn run_sync<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Some(job());
        }
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        self.post(Box::new(move || {
            let _ = done_tx.send(job());
        }));
        done_rx.recv().ok()
    }
}

impl DispatchContext for ThreadDispatcher {
    fn post(&self, job: Job) {
        let sent = match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            warn!("dispatch thread gone, job dropped");
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the loop drain and exit. The last handle
        // may be dropped from a job, so never join from the dispatch thread.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if !self.is_current() {
                let _ = handle.join();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Manual Dispatcher
// ----------------------------------------------------------------------------

/// Queues jobs until the owning thread runs them
pub struct ManualDispatcher {
    jobs: Mutex<VecDeque<Job>>,
    owner: ThreadId,
}

impl ManualDispatcher {
    /// The calling thread becomes the dispatch context
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            owner: thread::current().id(),
        }
    }

    /// Run the oldest queued job; returns false when the queue is empty
    pub fn run_one(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including jobs posted meanwhile
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl Default for ManualDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchContext for ManualDispatcher {
    fn post(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_runs_in_order() {
        let dispatcher = ManualDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            dispatcher.post(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(dispatcher.pending(), 3);
        assert_eq!(dispatcher.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(dispatcher.is_current());
    }

    #[test]
    fn test_manual_is_current_only_on_owner() {
        let dispatcher = Arc::new(ManualDispatcher::new());
        let remote = Arc::clone(&dispatcher);
        let current = thread::spawn(move || remote.is_current()).join().unwrap();
        assert!(!current);
    }

    #[test]
    fn test_thread_dispatcher_runs_on_named_thread() {
        let dispatcher = Arc::new(ThreadDispatcher::spawn("serial-test").unwrap());
        assert!(!dispatcher.is_current());

        let seen = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&dispatcher);
        let out = Arc::clone(&seen);
        dispatcher.run_sync(move || {
            let name = thread::current().name().map(str::to_string);
            *out.lock() = Some((name, inner.is_current()));
        });
        assert_eq!(
            *seen.lock(),
            Some((Some("serial-test".to_string()), true))
        );
    }
}
