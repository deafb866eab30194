//! Outbound message queue drained by the send worker

use crate::infrastructure::protocols::sip::message::SipMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

/// One message waiting to be written
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: SipMessage,
    /// Explicit datagram destination; the configured peer otherwise
    pub destination: Option<SocketAddr>,
}

impl Outbound {
    pub fn new(message: SipMessage) -> Self {
        Self {
            message,
            destination: None,
        }
    }

    pub fn to(message: SipMessage, destination: Option<SocketAddr>) -> Self {
        Self { message, destination }
    }
}

/// FIFO of outbound messages with a counting wake signal.
///
/// Every push releases one permit; `close` releases one more so a waiting
/// consumer sees an empty queue and can exit.
#[derive(Debug)]
pub struct SendQueue {
    items: Mutex<VecDeque<Outbound>>,
    wake: Semaphore,
    closed: AtomicBool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            wake: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a message. Returns false once the queue is closed.
    pub fn push(&self, item: Outbound) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.items.lock().push_back(item);
        self.wake.add_permits(1);
        true
    }

    /// Wait for the next item. `None` means a wake without an item, which
    /// only happens after `close`.
    pub async fn next(&self) -> Option<Outbound> {
        match self.wake.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return None,
        }
        self.items.lock().pop_front()
    }

    /// Take the next item without waiting
    pub fn try_next(&self) -> Option<Outbound> {
        self.wake.try_acquire().ok()?.forget();
        self.items.lock().pop_front()
    }

    /// Stop accepting items and wake the consumer once more
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.wake.add_permits(1);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop everything still queued
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::MessageType;
    use std::sync::Arc;
    use std::time::Duration;

    fn options(seq: u32) -> SipMessage {
        let mut msg = SipMessage::request(MessageType::Options, "sip:gw");
        msg.set_cseq(seq, MessageType::Options);
        msg
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = SendQueue::new();
        for seq in 1..=3 {
            assert!(queue.push(Outbound::new(options(seq))));
        }
        assert_eq!(queue.len(), 3);
        for seq in 1..=3 {
            assert_eq!(queue.next().await.unwrap().message.seq(), Some(seq));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(SendQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer woke")
            .unwrap();
        assert!(item.is_none());
        assert!(!queue.push(Outbound::new(options(9))));
    }

    #[test]
    fn test_try_next_does_not_wait() {
        let queue = SendQueue::new();
        assert!(queue.try_next().is_none());
        queue.push(Outbound::new(options(4)));
        let item = tokio_test::block_on(queue.next()).unwrap();
        assert_eq!(item.message.seq(), Some(4));
        assert_eq!(queue.clear(), 0);
    }

    #[tokio::test]
    async fn test_items_pushed_before_close_still_drain() {
        let queue = SendQueue::new();
        queue.push(Outbound::to(options(1), Some("10.0.0.1:5060".parse().unwrap())));
        queue.close();
        queue.close();

        let first = queue.next().await.unwrap();
        assert_eq!(first.destination, Some("10.0.0.1:5060".parse().unwrap()));
        assert!(queue.next().await.is_none());
    }
}
