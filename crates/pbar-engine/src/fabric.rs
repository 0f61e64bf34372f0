//! Subscription fabric.
//!
//! Long-poll readers register interest in one trace or a bar's full stream.
//! A router task per subscription drains the store's pub/sub channel into a
//! bounded queue; overflow drops the oldest message and marks the
//! subscription lagged, telling the reader to re-snapshot from the hot
//! state. Idle readers are torn down after the configured timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::FabricConfig;
use crate::error::EngineError;
use crate::hot_store::{keys, HotStore, PubSubMessage};

/// What a subscriber sees on each poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A trace mutation notification.
    Update(PubSubMessage),
    /// Messages were dropped; the reader must re-snapshot the hot state.
    Lagged,
}

/// Routes pub/sub messages to local subscribers.
#[derive(Debug)]
pub struct SubscriptionFabric {
    hot: Arc<dyn HotStore>,
    config: FabricConfig,
}

impl SubscriptionFabric {
    /// Create a fabric over the hot store.
    pub fn new(hot: Arc<dyn HotStore>, config: FabricConfig) -> Self {
        Self { hot, config }
    }

    /// Subscribe to one trace's update channel.
    pub async fn subscribe_trace(
        &self,
        owner: &str,
        bar_name: &str,
        trace_uid: &str,
    ) -> Result<Subscription, EngineError> {
        let rx = self
            .hot
            .subscribe(&keys::trace_channel(owner, bar_name, trace_uid))
            .await?;
        Ok(self.attach(rx))
    }

    /// Subscribe to every trace channel of a bar.
    pub async fn subscribe_bar(
        &self,
        owner: &str,
        bar_name: &str,
    ) -> Result<Subscription, EngineError> {
        let rx = self
            .hot
            .subscribe_prefix(&keys::bar_channel_prefix(owner, bar_name))
            .await?;
        Ok(self.attach(rx))
    }

    fn attach(&self, mut rx: broadcast::Receiver<PubSubMessage>) -> Subscription {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(self.config.queue_capacity)),
            notify: Notify::new(),
            lagged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let capacity = self.config.queue_capacity;
        let router = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => {
                            {
                                let mut queue = shared.queue.lock();
                                if queue.len() == capacity {
                                    queue.pop_front();
                                    shared.lagged.store(true, Ordering::Release);
                                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                                }
                                queue.push_back(message);
                            }
                            shared.notify.notify_one();
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // The store-side buffer overran before we could
                            // drain it; same contract as a queue overflow.
                            shared.lagged.store(true, Ordering::Release);
                            shared.dropped.fetch_add(skipped, Ordering::Relaxed);
                            shared.notify.notify_one();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            shared.closed.store(true, Ordering::Release);
                            shared.notify.notify_one();
                            break;
                        }
                    }
                }
            })
        };
        Subscription {
            shared,
            idle_timeout: self.config.idle_timeout(),
            router,
        }
    }
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<PubSubMessage>>,
    notify: Notify,
    lagged: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// One reader's bounded view of a trace (or bar) stream.
#[derive(Debug)]
pub struct Subscription {
    shared: Arc<Shared>,
    idle_timeout: Duration,
    router: JoinHandle<()>,
}

impl Subscription {
    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is torn down (closed upstream,
    /// explicitly closed, or idle past the timeout). A pending lag is
    /// reported before queued messages so the reader re-snapshots first.
    pub async fn recv(&self) -> Option<SubscriptionEvent> {
        loop {
            if self.shared.lagged.swap(false, Ordering::AcqRel) {
                return Some(SubscriptionEvent::Lagged);
            }
            if let Some(message) = self.shared.queue.lock().pop_front() {
                return Some(SubscriptionEvent::Update(message));
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            match tokio::time::timeout(self.idle_timeout, self.shared.notify.notified()).await {
                Ok(()) => continue,
                Err(_) => {
                    debug!("subscription idle past timeout, tearing down");
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Whether this subscription has dropped messages since the last
    /// `Lagged` report.
    pub fn is_lagged(&self) -> bool {
        self.shared.lagged.load(Ordering::Acquire)
    }

    /// Total messages dropped over the subscription's lifetime.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Tear the subscription down.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.router.abort();
        self.shared.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.abort();
    }
}
