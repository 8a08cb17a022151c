//! Outbound write queue
//!
//! Each `write()` call becomes one logical unit split into payload-sized
//! chunks. Only one chunk is in flight at a time, and a unit's chunks go out
//! in order before any chunk of the next unit.

use std::collections::VecDeque;

use tracing::trace;

// ----------------------------------------------------------------------------
// Pending Writes
// ----------------------------------------------------------------------------

/// One caller write, split into chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    chunks: VecDeque<Vec<u8>>,
}

impl PendingWrite {
    /// Split `data` into chunks of at most `payload_size` bytes
    pub fn new(data: &[u8], payload_size: usize) -> Self {
        let size = payload_size.max(1);
        Self {
            chunks: data.chunks(size).map(<[u8]>::to_vec).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.pop_front()
    }
}

/// FIFO of logical writes with a single in-flight chunk
#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<PendingWrite>,
    in_flight: bool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write; returns a chunk to dispatch now if the queue was idle
    /// and the gate is open
    pub fn enqueue(&mut self, data: &[u8], payload_size: usize, gate_open: bool) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        let unit = PendingWrite::new(data, payload_size);
        trace!("queued write of {} bytes in {} chunks", data.len(), unit.remaining());
        self.pending.push_back(unit);

        if self.in_flight || !gate_open {
            return None;
        }
        self.take_next()
    }

    /// The in-flight chunk completed; returns the next chunk if the gate
    /// is open
    pub fn on_write_complete(&mut self, gate_open: bool) -> Option<Vec<u8>> {
        self.in_flight = false;
        if !gate_open {
            return None;
        }
        self.take_next()
    }

    /// The gate reopened while idle; returns the next chunk if one waits
    pub fn resume(&mut self, gate_open: bool) -> Option<Vec<u8>> {
        if self.in_flight || !gate_open {
            return None;
        }
        self.take_next()
    }

    fn take_next(&mut self) -> Option<Vec<u8>> {
        while let Some(unit) = self.pending.front_mut() {
            if let Some(chunk) = unit.next_chunk() {
                if unit.is_empty() {
                    self.pending.pop_front();
                }
                self.in_flight = true;
                return Some(chunk);
            }
            self.pending.pop_front();
        }
        None
    }

    /// Stop dispatching; a chunk refused by the radio is no longer in flight
    pub fn halt(&mut self) {
        self.in_flight = false;
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of logical writes not yet fully dispatched
    pub fn pending_units(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_chunks_respect_payload_size() {
        let unit = PendingWrite::new(&[0u8; 45], 20);
        assert_eq!(unit.remaining(), 3);
    }

    #[test]
    fn test_single_chunk_in_flight() {
        let mut queue = WriteQueue::new();
        let first = queue.enqueue(b"abcdef", 4, true);
        assert_eq!(first, Some(b"abcd".to_vec()));
        assert!(queue.is_in_flight());

        // second unit waits for completion
        assert_eq!(queue.enqueue(b"xyz", 4, true), None);

        assert_eq!(queue.on_write_complete(true), Some(b"ef".to_vec()));
        assert_eq!(queue.on_write_complete(true), Some(b"xyz".to_vec()));
        assert_eq!(queue.on_write_complete(true), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut queue = WriteQueue::new();
        assert_eq!(queue.enqueue(&[], 20, true), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_closed_gate_holds_chunks() {
        let mut queue = WriteQueue::new();
        assert_eq!(queue.enqueue(b"hello", 2, false), None);
        assert!(!queue.is_in_flight());
        assert_eq!(queue.pending_units(), 1);

        let mut queue = WriteQueue::new();
        queue.enqueue(b"hello", 2, true);
        assert_eq!(queue.on_write_complete(false), None);
        assert_eq!(queue.pending_units(), 1);
    }

    #[test]
    fn test_resume_after_gate_reopens() {
        let mut queue = WriteQueue::new();
        queue.enqueue(b"hello", 2, true);
        assert_eq!(queue.on_write_complete(false), None);
        assert_eq!(queue.resume(false), None);

        assert_eq!(queue.resume(true), Some(b"ll".to_vec()));
        // already in flight
        assert_eq!(queue.resume(true), None);
        assert_eq!(queue.on_write_complete(true), Some(b"o".to_vec()));
        assert_eq!(queue.on_write_complete(true), None);
        assert_eq!(queue.resume(true), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut queue = WriteQueue::new();
        queue.enqueue(b"hello world", 3, true);
        queue.clear();
        assert!(queue.is_idle());
        assert_eq!(queue.on_write_complete(true), None);
    }

    proptest! {
        #[test]
        fn prop_units_are_never_interleaved(
            writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..100), 1..10),
            payload_size in 1usize..32,
        ) {
            let mut queue = WriteQueue::new();
            let mut sent = Vec::new();
            for data in &writes {
                if let Some(chunk) = queue.enqueue(data, payload_size, true) {
                    sent.push(chunk);
                }
            }
            while let Some(chunk) = queue.on_write_complete(true) {
                sent.push(chunk);
            }

            prop_assert!(sent.iter().all(|c| !c.is_empty() && c.len() <= payload_size));
            let expected: Vec<u8> = writes.concat();
            prop_assert_eq!(sent.concat(), expected);
        }
    }
}
