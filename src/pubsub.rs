//! Channel subscriptions
//!
//! [`Subscription`] owns a background task that subscribes to one channel on a
//! [`CacheStore`] and hands every payload to a callback. If the subscription fails or
//! the stream ends, the task waits a jittered delay and subscribes again until it is
//! shut down.

use crate::traits::CacheStore;
use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handle to a running channel subscription
///
/// Dropping the handle detaches the task: it keeps delivering until
/// [`shutdown`](Self::shutdown) is called or, for subscriptions made through
/// [`CacheService::subscribe`](crate::CacheService::subscribe), until the service
/// shuts down.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Stop signal of one subscriber task
struct ShutdownSignal {
    own: broadcast::Receiver<()>,
    /// Owner-wide signal; a closed channel means the owner is gone
    parent: Option<broadcast::Receiver<()>>,
}

impl ShutdownSignal {
    async fn recv(&mut self) {
        match &mut self.parent {
            Some(parent) => {
                tokio::select! {
                    _ = self.own.recv() => {}
                    _ = parent.recv() => {}
                }
            }
            None => {
                let _ = self.own.recv().await;
            }
        }
    }
}

impl Subscription {
    /// Spawn the subscriber task
    ///
    /// `handler` is awaited for each message in arrival order.
    pub fn start<F, Fut>(
        store: Arc<dyn CacheStore>,
        channel: impl Into<String>,
        reconnect_delay: Duration,
        handler: F,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(store, channel.into(), reconnect_delay, handler, None)
    }

    /// Like [`start`](Self::start), but also stops when `parent` fires or closes
    pub(crate) fn start_linked<F, Fut>(
        store: Arc<dyn CacheStore>,
        channel: impl Into<String>,
        reconnect_delay: Duration,
        handler: F,
        parent: broadcast::Receiver<()>,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(store, channel.into(), reconnect_delay, handler, Some(parent))
    }

    fn spawn<F, Fut>(
        store: Arc<dyn CacheStore>,
        channel: String,
        reconnect_delay: Duration,
        handler: F,
        parent: Option<broadcast::Receiver<()>>,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, own) = broadcast::channel(1);
        // The task holds a sender so the channel outlives a dropped handle
        let keep_open = shutdown_tx.clone();
        let mut shutdown = ShutdownSignal { own, parent };
        let task_channel = channel.clone();

        let handle = tokio::spawn(async move {
            let _keep_open = keep_open;
            loop {
                match Self::run_subscriber_loop(store.as_ref(), &task_channel, &handler, &mut shutdown).await {
                    Ok(()) => {
                        info!(channel = %task_channel, backend = store.name(), "Subscriber shutting down");
                        break;
                    }
                    Err(e) => {
                        let delay = jittered(reconnect_delay);
                        error!(
                            channel = %task_channel,
                            backend = store.name(),
                            error = %e,
                            retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Subscriber error, resubscribing"
                        );

                        // Wait before reconnecting
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = shutdown.recv() => {
                                info!(channel = %task_channel, "Subscriber shutting down");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            channel,
            shutdown_tx,
            handle,
        }
    }

    /// `Ok` on shutdown, `Err` when the subscription could not be made or dropped
    async fn run_subscriber_loop<F, Fut>(
        store: &dyn CacheStore,
        channel: &str,
        handler: &F,
        shutdown: &mut ShutdownSignal,
    ) -> Result<()>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut stream = tokio::select! {
            subscribed = store.subscribe(channel) => subscribed?,
            () = shutdown.recv() => return Ok(()),
        };
        debug!(channel = %channel, backend = store.name(), "Subscribed to channel");

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(payload) => handler(payload).await,
                    None => return Err(anyhow!("message stream ended")),
                },
                () = shutdown.recv() => return Ok(()),
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the background task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the subscriber to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!(channel = %self.channel, error = %e, "Subscriber task failed");
        }
    }
}

/// `base` plus up to 25% random extra, so instances do not resubscribe in lockstep
fn jittered(base: Duration) -> Duration {
    let max_extra = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
    if max_extra == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalStore;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_delivers_messages_until_shutdown() {
        let store = Arc::new(LocalStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = Subscription::start(
            store.clone(),
            "events",
            Duration::from_millis(10),
            move |payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                }
            },
        );
        assert_eq!(subscription.channel(), "events");

        // Give the task a chance to subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.publish("events", "hello").await.unwrap(), 1);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));

        subscription.shutdown().await;
        assert_eq!(store.publish("events", "late").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_delivering() {
        let store = Arc::new(LocalStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = Subscription::start(store.clone(), "events", Duration::from_millis(10), move |payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
            }
        });
        drop(subscription);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.publish("events", "hello").await.unwrap(), 1);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_linked_subscription_stops_with_parent() {
        let store = Arc::new(LocalStore::new());
        let (parent_tx, parent_rx) = broadcast::channel(1);

        let subscription =
            Subscription::start_linked(store.clone(), "events", Duration::from_millis(10), |_| async {}, parent_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.publish("events", "ping").await.unwrap(), 1);

        parent_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(subscription.is_finished());
        assert_eq!(store.publish("events", "late").await.unwrap(), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(500));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
