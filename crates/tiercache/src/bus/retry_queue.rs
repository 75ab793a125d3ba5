use std::collections::VecDeque;

use parking_lot::Mutex;
use tiercache_core::InvalidationMessage;

/// Bounded FIFO of messages whose publish failed.
///
/// When full, the oldest message is dropped to make room. A message leaves
/// the queue only through [`RetryQueue::remove_front`] after it has been
/// published.
#[derive(Debug)]
pub struct RetryQueue {
    messages: Mutex<VecDeque<InvalidationMessage>>,
    max_size: Option<usize>,
}

impl RetryQueue {
    /// `max_size = None` leaves the queue unbounded; `Some(0)` keeps nothing.
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Appends `message`, returning the message dropped to make room.
    pub fn enqueue(&self, message: InvalidationMessage) -> Option<InvalidationMessage> {
        let mut messages = self.messages.lock();
        let dropped = match self.max_size {
            Some(0) => return Some(message),
            Some(max) if messages.len() >= max => messages.pop_front(),
            _ => None,
        };
        messages.push_back(message);
        dropped
    }

    /// Oldest queued message, left in place.
    pub fn front(&self) -> Option<InvalidationMessage> {
        self.messages.lock().front().cloned()
    }

    /// Removes the oldest message if it is still `published`.
    ///
    /// The front may have changed since it was read if an overflow dropped it
    /// meanwhile; in that case nothing is removed.
    pub fn remove_front(&self, published: &InvalidationMessage) -> bool {
        let mut messages = self.messages.lock();
        if messages.front() == Some(published) {
            messages.pop_front();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<InvalidationMessage> {
        self.messages.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> InvalidationMessage {
        InvalidationMessage::delete(vec![key.to_string()], None, "node")
    }

    #[test]
    fn test_bounded_drops_oldest() {
        let queue = RetryQueue::new(Some(3));
        for i in 0..4 {
            let dropped = queue.enqueue(message(&format!("k{i}")));
            if i < 3 {
                assert!(dropped.is_none());
            } else {
                assert_eq!(dropped.unwrap().keys, vec!["k0"]);
            }
        }

        let keys: Vec<String> = queue
            .snapshot()
            .into_iter()
            .flat_map(|m| m.keys)
            .collect();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let queue = RetryQueue::new(None);
        for i in 0..100 {
            assert!(queue.enqueue(message(&format!("k{i}"))).is_none());
        }
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let queue = RetryQueue::new(Some(0));
        let dropped = queue.enqueue(message("a"));
        assert_eq!(dropped.unwrap().keys, vec!["a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_front_only_matching() {
        let queue = RetryQueue::new(Some(2));
        queue.enqueue(message("a"));
        let front = queue.front().unwrap();

        queue.enqueue(message("b"));
        queue.enqueue(message("c"));

        assert!(!queue.remove_front(&front));
        assert_eq!(queue.len(), 2);

        let front = queue.front().unwrap();
        assert!(queue.remove_front(&front));
        assert_eq!(queue.front().unwrap().keys, vec!["c"]);
    }
}
