//! In-process transport connecting two endpoints without a socket.
//!
//! Useful for offline play and for driving two controllers against each
//! other. Events added to one end become visible to the other end only after
//! `flush_message`, one batch per flush, the same way frames behave on a
//! real connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_net::{EventError, EventHandler, NetworkNode};

#[derive(Default)]
struct Shared {
    /// Flushed batches travelling towards end `0` and end `1`.
    inbound: [VecDeque<Vec<Vec<u8>>>; 2],
    closed: bool,
}

/// One end of an in-process connection.
pub struct LocalNode {
    side: usize,
    shared: Arc<Mutex<Shared>>,
    pending: Vec<Vec<u8>>,
}

impl LocalNode {
    /// Two connected ends.
    pub fn pair() -> (LocalNode, LocalNode) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let a = LocalNode {
            side: 0,
            shared: Arc::clone(&shared),
            pending: Vec::new(),
        };
        let b = LocalNode {
            side: 1,
            shared,
            pending: Vec::new(),
        };
        (a, b)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        if event.len() > u16::MAX as usize {
            return Err(EventError::EventTooLarge(event.len()));
        }
        if self.lock().closed {
            return Ok(());
        }
        self.pending.push(event.to_vec());
        Ok(())
    }

    /// Batches flushed by the other end and not yet processed here.
    pub fn queued_batches(&self) -> usize {
        self.lock().inbound[self.side].len()
    }
}

impl NetworkNode for LocalNode {
    fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool {
        let batch = {
            let mut shared = self.lock();
            if shared.closed {
                return false;
            }
            shared.inbound[self.side].pop_front()
        };
        match batch {
            Some(events) => {
                for event in &events {
                    handler.process_event(event);
                }
                true
            }
            None => false,
        }
    }

    fn add_reliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.add_event(event)
    }

    fn add_unreliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.add_event(event)
    }

    fn flush_message(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let mut shared = self.lock();
        if !shared.closed {
            shared.inbound[1 - self.side].push_back(batch);
        }
    }

    fn close(&mut self) {
        self.pending.clear();
        let mut shared = self.lock();
        shared.closed = true;
        shared.inbound = Default::default();
    }

    fn is_connected(&self) -> bool {
        !self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(node: &mut LocalNode) -> Vec<Vec<u8>> {
        let mut events = Vec::new();
        while node.process_event(&mut |event: &[u8]| events.push(event.to_vec())) {}
        events
    }

    #[test]
    fn test_flush_delivers_in_order() {
        let (mut a, mut b) = LocalNode::pair();
        a.add_reliable_event(b"one").unwrap();
        a.add_unreliable_event(b"two").unwrap();
        assert!(drain(&mut b).is_empty());

        a.flush_message();
        assert_eq!(b.queued_batches(), 1);
        assert_eq!(drain(&mut b), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_both_directions() {
        let (mut a, mut b) = LocalNode::pair();
        b.add_reliable_event(b"back").unwrap();
        b.flush_message();
        assert_eq!(drain(&mut a), vec![b"back".to_vec()]);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_close_disconnects_both_ends() {
        let (mut a, mut b) = LocalNode::pair();
        a.add_reliable_event(b"lost").unwrap();
        a.flush_message();
        b.close();
        assert!(!a.is_connected());
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_oversized_event_rejected() {
        let (mut a, _b) = LocalNode::pair();
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            a.add_reliable_event(&big),
            Err(EventError::EventTooLarge(_))
        ));
    }
}
