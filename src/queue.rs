//! Transfer buffer and bounded, cancelable FIFO queue (C1).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Largest payload the engine will ever buffer for a single transfer.
pub const MAX_TRANSFER: usize = 4096;

/// How often blocked `push`/`pop` calls wake up to recheck the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// One in-flight transfer, bounded to [`MAX_TRANSFER`] bytes.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub direction: Direction,
    pub data: Vec<u8>,
    pub zero_length: bool,
    pub transformed: bool,
    pub sequence: u64,
}

impl TransferRecord {
    pub fn new(direction: Direction, data: Vec<u8>, sequence: u64) -> Self {
        debug_assert!(data.len() <= MAX_TRANSFER);
        let zero_length = data.is_empty();
        TransferRecord { direction, data, zero_length, transformed: false, sequence }
    }
}

/// A monotonic per-endpoint sequence counter, one per pipeline direction.
#[derive(Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        SequenceCounter(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// The single broadcast shutdown signal shared by every activity.
///
/// Rather than an asynchronous signal interrupting a specific thread
/// (the hazard called out in the design notes), every blocking call in
/// this engine is bounded by its own timeout and polls this flag on
/// every wakeup.
#[derive(Clone)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Shutdown(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub enum PushOutcome {
    Pushed,
    ShuttingDown,
}

pub enum PopOutcome {
    Popped(TransferRecord),
    ShuttingDown,
}

/// Fixed-capacity FIFO. Enqueue blocks while full, dequeue blocks while
/// empty; both unblock promptly once [`Shutdown::signal`] has been
/// called, returning a sentinel instead of a record.
pub struct Queue {
    capacity: usize,
    state: Mutex<VecDeque<TransferRecord>>,
    not_full: Condvar,
    not_empty: Condvar,
    shutdown: Shutdown,
}

impl Queue {
    pub fn new(capacity: usize, shutdown: Shutdown) -> Self {
        Queue {
            capacity,
            state: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            shutdown,
        }
    }

    pub fn push(&self, record: TransferRecord) -> PushOutcome {
        let mut guard = self.state.lock().unwrap();
        loop {
            if self.shutdown.is_signaled() {
                return PushOutcome::ShuttingDown;
            }
            if guard.len() < self.capacity {
                guard.push_back(record);
                self.not_empty.notify_one();
                return PushOutcome::Pushed;
            }
            let (g, _) = self.not_full.wait_timeout(guard, POLL_INTERVAL).unwrap();
            guard = g;
        }
    }

    pub fn pop(&self) -> PopOutcome {
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(record) = guard.pop_front() {
                self.not_full.notify_one();
                return PopOutcome::Popped(record);
            }
            if self.shutdown.is_signaled() {
                return PopOutcome::ShuttingDown;
            }
            let (g, _) = self.not_empty.wait_timeout(guard, POLL_INTERVAL).unwrap();
            guard = g;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

/// Queue capacity for an endpoint, chosen so buffered bytes stay under
/// `capacity * max_packet_size * 8` (spec §4.1).
pub fn default_capacity() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let shutdown = Shutdown::new();
        let q = Queue::new(4, shutdown);
        for i in 0..3u64 {
            q.push(TransferRecord::new(Direction::In, vec![i as u8], i));
        }
        for i in 0..3u64 {
            match q.pop() {
                PopOutcome::Popped(r) => assert_eq!(r.sequence, i),
                PopOutcome::ShuttingDown => panic!("unexpected shutdown"),
            }
        }
    }

    #[test]
    fn push_blocks_until_capacity_then_unblocks_on_pop() {
        let shutdown = Shutdown::new();
        let q = Arc::new(Queue::new(1, shutdown));
        q.push(TransferRecord::new(Direction::In, vec![0], 0));

        let q2 = q.clone();
        let handle = thread::spawn(move || {
            q2.push(TransferRecord::new(Direction::In, vec![1], 1));
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 1);
        match q.pop() {
            PopOutcome::Popped(r) => assert_eq!(r.sequence, 0),
            PopOutcome::ShuttingDown => panic!("unexpected shutdown"),
        }
        handle.join().unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn shutdown_unblocks_pop() {
        let shutdown = Shutdown::new();
        let q = Arc::new(Queue::new(4, shutdown.clone()));
        let q2 = q.clone();
        let handle = thread::spawn(move || matches!(q2.pop(), PopOutcome::ShuttingDown));
        thread::sleep(Duration::from_millis(50));
        shutdown.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn shutdown_unblocks_push_when_full() {
        let shutdown = Shutdown::new();
        let q = Arc::new(Queue::new(1, shutdown.clone()));
        q.push(TransferRecord::new(Direction::Out, vec![], 0));
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            matches!(q2.push(TransferRecord::new(Direction::Out, vec![], 1)), PushOutcome::ShuttingDown)
        });
        thread::sleep(Duration::from_millis(50));
        shutdown.signal();
        assert!(handle.join().unwrap());
    }
}
