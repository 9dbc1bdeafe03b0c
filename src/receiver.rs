//! Long-running consumer loop.
//!
//! A [`Receiver`] pulls messages from a [`MessageSource`] on a dedicated
//! task and hands each one to a [`MessageHandler`]. Failures never stop the
//! loop: they are sent on a bounded error channel, or logged when nobody
//! reads it. The source is closed on every exit path.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocking_queue::BlockingQueue;
use crate::bus::{Bus, Message, MessageHandler};
use crate::config::ReceiverConfig;
use crate::error::{Result, StoreError};
use crate::store::StorageHandle;

/// A pull-based message source.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Next message; `Ok(None)` once the source is exhausted. Returns
    /// [`StoreError::Cancelled`] when `cancel` fires while waiting.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Message>>;

    /// Release the underlying consumer.
    async fn close(&mut self);
}

/// Messages taken from a blocking queue of raw payloads.
pub struct QueueSource<S, B> {
    name: String,
    queue: Option<BlockingQueue<S, Vec<u8>, B>>,
}

impl<S: StorageHandle, B: Bus> QueueSource<S, B> {
    /// Consume `queue`; messages carry the queue's channel name.
    pub fn new(queue: BlockingQueue<S, Vec<u8>, B>) -> Self {
        Self {
            name: queue.channel().to_string(),
            queue: Some(queue),
        }
    }
}

#[async_trait]
impl<S: StorageHandle, B: Bus> MessageSource for QueueSource<S, B> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Message>> {
        let Some(queue) = &self.queue else {
            return Ok(None);
        };
        let payload = queue.dequeue(cancel).await?;
        Ok(Some(Message::new(self.name.clone(), payload)))
    }

    async fn close(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.close().await;
        }
    }
}

/// Messages taken from a bus channel stream.
pub struct BusSource {
    name: String,
    stream: Option<BroadcastStream<Message>>,
}

impl BusSource {
    /// Consume `stream`, reporting `channel` as the message channel.
    pub fn new(channel: impl Into<String>, stream: BroadcastStream<Message>) -> Self {
        Self {
            name: channel.into(),
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl MessageSource for BusSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<Message>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(message)) => return Ok(Some(message)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(source = %self.name, skipped, "bus source lagged; messages dropped");
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

/// A failure observed by the receiver loop.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("handler failed for message on {}: {}", .message.channel, .error)]
    Handler { message: Message, error: StoreError },

    #[error("handler panicked for message on {}", .message.channel)]
    HandlerPanicked { message: Message },

    #[error("source failed: {0}")]
    Source(StoreError),
}

/// Spawns consumer loops.
pub struct Receiver;

impl Receiver {
    /// Start consuming `source` on a new task.
    pub fn spawn<M: MessageSource>(
        source: M,
        handler: Arc<dyn MessageHandler>,
        config: &ReceiverConfig,
    ) -> ReceiverHandle {
        let (errors_tx, errors_rx) = mpsc::channel(config.error_capacity.max(1));
        let token = CancellationToken::new();
        let task = tokio::spawn(run(
            source,
            handler,
            errors_tx,
            token.clone(),
            config.error_backoff(),
        ));

        ReceiverHandle {
            token,
            task: Some(task),
            errors: Some(errors_rx),
        }
    }
}

fn report(errors: &mpsc::Sender<ReceiverError>, source: &str, error: ReceiverError) {
    match errors.try_send(error) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(error)) => {
            warn!(%source, %error, "receiver error channel full; error dropped");
        }
        Err(mpsc::error::TrySendError::Closed(error)) => {
            warn!(%source, %error, "unobserved receiver error");
        }
    }
}

async fn run<M: MessageSource>(
    mut source: M,
    handler: Arc<dyn MessageHandler>,
    errors: mpsc::Sender<ReceiverError>,
    token: CancellationToken,
    backoff: Duration,
) {
    let name = source.name().to_string();
    info!(source = %name, "receiver started");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = source.next(&token) => next,
        };

        match next {
            Ok(Some(message)) => {
                let handler = Arc::clone(&handler);
                let delivered = message.clone();
                match tokio::spawn(async move { handler.handle(delivered).await }).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        report(&errors, &name, ReceiverError::Handler { message, error })
                    }
                    Err(_) => report(&errors, &name, ReceiverError::HandlerPanicked { message }),
                }
            }
            Ok(None) => {
                debug!(source = %name, "source exhausted");
                break;
            }
            Err(StoreError::Cancelled) => break,
            Err(error) => {
                report(&errors, &name, ReceiverError::Source(error));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    source.close().await;
    info!(source = %name, "receiver stopped");
}

/// Owner of a running receiver. Dropping it cancels the loop.
pub struct ReceiverHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    errors: Option<mpsc::Receiver<ReceiverError>>,
}

impl ReceiverHandle {
    /// Take the error channel. Returns `None` after the first call.
    pub fn errors(&mut self) -> Option<mpsc::Receiver<ReceiverError>> {
        self.errors.take()
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Cancel the loop and wait until the source is closed.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "receiver task failed");
            }
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
