//! Ring of recently forwarded payloads

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bounded FIFO of the most recent payloads; the oldest is evicted first
#[derive(Debug)]
pub struct PacketBuffer {
    packets: VecDeque<Bytes>,
    capacity: usize,
}

impl PacketBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, payload: Bytes) {
        if self.packets.len() == self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(payload);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-first copy of the buffered payloads
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.packets.iter().cloned().collect()
    }
}

/// Lock a shared buffer, carrying on with its contents if a holder panicked
pub(crate) fn lock(buffer: &Mutex<PacketBuffer>) -> MutexGuard<'_, PacketBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_exceeds_capacity() {
        let mut buffer = PacketBuffer::new(3);
        for i in 0..10u8 {
            buffer.push(Bytes::from(vec![i]));
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut buffer = PacketBuffer::new(2);
        buffer.push(Bytes::from_static(b"a"));
        buffer.push(Bytes::from_static(b"b"));
        buffer.push(Bytes::from_static(b"c"));

        assert_eq!(
            buffer.snapshot(),
            vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]
        );
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = PacketBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.push(Bytes::from_static(b"x"));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_poisoned_buffer_keeps_working() {
        use std::sync::Arc;

        let shared = Arc::new(Mutex::new(PacketBuffer::new(2)));
        lock(&shared).push(Bytes::from_static(b"before"));

        let poisoner = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(shared.is_poisoned());

        lock(&shared).push(Bytes::from_static(b"after"));
        assert_eq!(
            lock(&shared).snapshot(),
            vec![Bytes::from_static(b"before"), Bytes::from_static(b"after")]
        );
    }
}
