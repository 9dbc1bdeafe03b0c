//! Blocking dequeue over a polling queue plus a notification bus.
//!
//! The queue's storage identifier doubles as the bus channel name. `enqueue`
//! writes the item first and publishes an empty notification afterwards, so
//! a woken waiter always finds the item unless another waiter beat it to
//! it. Waiters also re-poll every `recheck_interval` to cover notifications
//! the bus dropped.
//!
//! There is no fairness among waiters: whoever polls first wins.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{handler_fn, Bus, Subscription};
use crate::collections::QueueHandle;
use crate::config::QueueConfig;
use crate::error::{Result, StoreError};
use crate::key::StorageId;
use crate::store::StorageHandle;

/// A queue whose `dequeue` waits for items instead of returning empty.
pub struct BlockingQueue<S, T, B> {
    queue: QueueHandle<S, T>,
    bus: Arc<B>,
    channel: String,
    notify: Arc<Notify>,
    recheck_interval: Duration,
    subscription: Subscription,
}

impl<S, T, B> BlockingQueue<S, T, B>
where
    S: StorageHandle,
    T: Send + Sync + 'static,
    B: Bus,
{
    /// Wrap `queue` and subscribe to its notification channel.
    pub async fn new(queue: QueueHandle<S, T>, bus: Arc<B>, config: &QueueConfig) -> Result<Self> {
        let channel = queue.storage_id().to_string();
        let notify = Arc::new(Notify::new());

        let waker = Arc::clone(&notify);
        let subscription = bus
            .subscribe(
                &channel,
                handler_fn(move |_| {
                    let waker = Arc::clone(&waker);
                    async move {
                        waker.notify_waiters();
                        Ok(())
                    }
                }),
            )
            .await?;

        Ok(Self {
            queue,
            bus,
            channel,
            notify,
            recheck_interval: config.recheck_interval(),
            subscription,
        })
    }

    /// Identifier of the underlying queue.
    pub fn storage_id(&self) -> &StorageId {
        self.queue.storage_id()
    }

    /// Bus channel carrying this queue's notifications.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The wrapped live queue handle.
    pub fn queue(&self) -> &QueueHandle<S, T> {
        &self.queue
    }

    /// Append `item` and wake waiters.
    pub async fn enqueue(&self, item: &T) -> Result<()> {
        self.queue.enqueue(item).await?;
        self.bus.publish(&self.channel, Vec::new()).await?;
        Ok(())
    }

    /// Non-blocking dequeue.
    pub async fn try_dequeue(&self) -> Result<Option<T>> {
        self.queue.dequeue_or_default().await
    }

    /// Number of queued items.
    pub async fn len(&self) -> Result<u64> {
        self.queue.len().await
    }

    /// Whether the queue currently holds no items.
    pub async fn is_empty(&self) -> Result<bool> {
        self.queue.is_empty().await
    }

    /// Wait for an item. Fails with [`StoreError::Cancelled`] once `cancel`
    /// fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T> {
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            // Register before polling so an enqueue between the poll and the
            // wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.queue.dequeue_or_default().await? {
                return Ok(item);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(channel = %self.channel, "dequeue cancelled");
                    return Err(StoreError::Cancelled);
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.recheck_interval) => {}
            }
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout` with `None`.
    pub async fn dequeue_timeout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.dequeue(cancel)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Drop the bus subscription and wait for its dispatcher to stop.
    pub async fn close(self) {
        self.subscription.unsubscribe().await;
    }
}
