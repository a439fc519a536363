//! # Queue
//!
//! The bounded in-memory hand-off between the discovery loop and the processing workers.
//! Producers suspend while the queue is full, nothing is ever dropped, and every suspension point
//! gives up as soon as the cancellation token fires.
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::notification::NotificationItem;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue is closed")]
    Closed,
}

/// A FIFO queue of notifications with a fixed capacity.
///
/// Cloning yields another handle to the same queue. Any number of consumers may call `dequeue`
/// concurrently; each item is delivered to exactly one of them.
#[derive(Clone)]
pub struct NotificationQueue {
    sender: mpsc::Sender<NotificationItem>,
    receiver: Arc<Mutex<mpsc::Receiver<NotificationItem>>>,
}

/// A reserved place in the queue. Sending through it never waits.
pub struct QueueSlot<'a>(mpsc::Permit<'a, NotificationItem>);

impl QueueSlot<'_> {
    pub fn send(self, item: NotificationItem) {
        self.0.send(item);
    }
}

impl NotificationQueue {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.get());

        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Wait for a free place in the queue.
    ///
    /// Reserving first lets a producer persist whatever must be true before the item becomes
    /// visible to consumers, and only then publish it.
    pub async fn reserve(&self, cancel: &CancellationToken) -> Result<QueueSlot<'_>, QueueError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            permit = self.sender.reserve() => permit.map(QueueSlot).map_err(|_| QueueError::Closed),
        }
    }

    /// Append an item, suspending while the queue is full.
    pub async fn enqueue(
        &self,
        item: NotificationItem,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let slot = self.reserve(cancel).await?;
        slot.send(item);

        Ok(())
    }

    /// Take the oldest item, suspending while the queue is empty.
    /// Returns `None` once `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<NotificationItem> {
        let mut receiver = tokio::select! {
            biased;

            _ = cancel.cancelled() => return None,
            receiver = self.receiver.lock() => receiver,
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            item = receiver.recv() => item,
        }
    }

    /// Items in dequeue order, ending when `cancel` fires.
    pub fn stream(&self, cancel: CancellationToken) -> impl Stream<Item = NotificationItem> + '_ {
        stream::unfold(cancel, move |cancel| async move {
            let item = self.dequeue(&cancel).await?;
            Some((item, cancel))
        })
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}
