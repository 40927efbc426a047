//! Worker queue seam.
//!
//! Submissions are fire-and-forget: the caller enqueues a message and
//! observes completion through batch state in the store, never through a
//! reply channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

use super::message::BatchMessage;

/// Hands batch submissions to the worker side.
#[async_trait]
pub trait WorkerQueue: Send + Sync {
    async fn submit(&self, message: &BatchMessage) -> Result<()>;
}

/// In-process queue backed by a Vec; tests drain it with [`pop`].
///
/// [`pop`]: MemoryWorkerQueue::pop
#[derive(Debug, Default)]
pub struct MemoryWorkerQueue {
    messages: Mutex<Vec<BatchMessage>>,
}

impl MemoryWorkerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest pending message, if any.
    pub fn pop(&self) -> Option<BatchMessage> {
        let mut messages = self.messages.lock();
        if messages.is_empty() {
            None
        } else {
            Some(messages.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl WorkerQueue for MemoryWorkerQueue {
    async fn submit(&self, message: &BatchMessage) -> Result<()> {
        debug!(
            queue = message.queue_name(),
            batch_id = message.batch_id,
            attempt = message.attempt,
            "message enqueued"
        );
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_then_pop_is_fifo() {
        let queue = MemoryWorkerQueue::new();
        let first = BatchMessage::new(vec![], "p".into(), "e".into(), "plate".into(), 0);
        let second = BatchMessage::new(vec![], "p".into(), "e".into(), "plate".into(), 1);
        queue.submit(&first).await.unwrap();
        queue.submit(&second).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().batch_id, 0);
        assert_eq!(queue.pop().unwrap().batch_id, 1);
        assert!(queue.pop().is_none());
    }
}
