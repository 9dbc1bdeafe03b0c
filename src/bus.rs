//! Publish/subscribe bus.
//!
//! [`MemoryBus`] keeps one broadcast channel per channel name. Every
//! subscription runs its own dispatcher task, and every handler call runs in
//! a task of its own under the configured timeout, so a failing, panicking
//! or stuck handler never takes the publisher or the subscription down.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::error::Result;

/// A message delivered on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message for `channel`.
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Callback invoked for every message on a subscribed channel.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A pub/sub transport.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish to every current subscriber of `channel`; returns how many
    /// subscribers the message reached.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;

    /// Invoke `handler` for every message published on `channel` until the
    /// returned subscription is dropped or unsubscribed.
    async fn subscribe(&self, channel: &str, handler: Arc<dyn MessageHandler>)
        -> Result<Subscription>;
}

/// A live subscription. Dropping it stops delivery.
pub struct Subscription {
    channel: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a running dispatcher task and the token that stops it.
    pub fn new(channel: impl Into<String>, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            token,
            task: Some(task),
        }
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether delivery is still running.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop delivery and wait for the dispatcher to exit.
    pub async fn unsubscribe(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

/// In-process bus backed by tokio broadcast channels.
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    config: BusConfig,
}

impl MemoryBus {
    /// Create a bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with explicit channel capacity and handler timeout.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Message> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.config.capacity.max(1)).0)
            .clone()
    }

    /// Raw message stream for `channel`. Lagged receivers yield an error item
    /// and then continue with the newest messages.
    pub fn stream(&self, channel: &str) -> BroadcastStream<Message> {
        BroadcastStream::new(self.sender(channel).subscribe())
    }

    /// Number of live receivers on `channel` (subscriptions plus streams).
    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one handler call in its own task under `limit`.
fn dispatch(handler: Arc<dyn MessageHandler>, message: Message, limit: Duration) {
    tokio::spawn(async move {
        let channel = message.channel.clone();
        let call = tokio::spawn(async move { handler.handle(message).await });
        let abort = call.abort_handle();
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(%channel, error = %e, "message handler failed"),
            Ok(Err(e)) if e.is_panic() => warn!(%channel, "message handler panicked"),
            Ok(Err(_)) => debug!(%channel, "message handler cancelled"),
            Err(_) => {
                abort.abort();
                warn!(%channel, timeout = ?limit, "message handler timed out");
            }
        }
    });
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        let sender = self.sender(channel);
        // No receivers is not an error.
        let delivered = sender.send(Message::new(channel, payload)).unwrap_or(0);
        debug!(%channel, delivered, "publish");
        Ok(delivered)
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        let mut receiver = self.sender(channel).subscribe();
        let token = CancellationToken::new();
        let limit = self.config.handler_timeout();
        let name = channel.to_string();

        let task = {
            let token = token.clone();
            let channel = name.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        received = receiver.recv() => match received {
                            Ok(message) => dispatch(Arc::clone(&handler), message, limit),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(%channel, skipped, "subscriber lagged; messages dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                debug!(%channel, "subscription closed");
            })
        };

        debug!(channel = %name, "subscribed");
        Ok(Subscription::new(name, token, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_stream::StreamExt;

    fn forwarding(tx: mpsc::UnboundedSender<Message>) -> Arc<dyn MessageHandler> {
        handler_fn(move |message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe("orders", forwarding(tx)).await.unwrap();

        assert_eq!(bus.publish("orders", b"hello".to_vec()).await.unwrap(), 1);
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Message::new("orders", b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        assert_eq!(bus.publish("nobody", Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe("a", forwarding(tx)).await.unwrap();

        bus.publish("b", b"other".to_vec()).await.unwrap();
        bus.publish("a", b"mine".to_vec()).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.payload, b"mine");
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_stop_delivery() {
        let bus = MemoryBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                match message.payload.as_slice() {
                    b"fail" => Err(StoreError::invalid("bad message")),
                    b"panic" => panic!("handler panic"),
                    _ => Ok(()),
                }
            }
        });
        let sub = bus.subscribe("c", handler).await.unwrap();

        for payload in [&b"fail"[..], b"panic", b"ok"] {
            bus.publish("c", payload.to_vec()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(sub.is_active());
    }

    #[tokio::test]
    async fn test_stuck_handler_is_bounded() {
        let bus = MemoryBus::with_config(BusConfig {
            handler_timeout_ms: 50,
            ..BusConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |message: Message| {
            let tx = tx.clone();
            async move {
                if message.payload == b"stuck" {
                    std::future::pending::<()>().await;
                }
                let _ = tx.send(message);
                Ok(())
            }
        });
        let _sub = bus.subscribe("s", handler).await.unwrap();

        bus.publish("s", b"stuck".to_vec()).await.unwrap();
        bus.publish("s", b"next".to_vec()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, b"next");
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_stop_delivery() {
        let bus = MemoryBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe("u", forwarding(tx.clone())).await.unwrap();
        assert_eq!(bus.receiver_count("u"), 1);
        sub.unsubscribe().await;
        assert_eq!(bus.receiver_count("u"), 0);

        let sub = bus.subscribe("u", forwarding(tx)).await.unwrap();
        drop(sub);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.receiver_count("u"), 0);
        assert_eq!(bus.publish("u", Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream() {
        let bus = MemoryBus::new();
        let mut stream = bus.stream("events");

        bus.publish("events", b"1".to_vec()).await.unwrap();
        bus.publish("events", b"2".to_vec()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(second.payload, b"2");
    }
}
