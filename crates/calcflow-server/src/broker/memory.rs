//! In-process broker transport.
//!
//! Each topic is a `tokio::sync::broadcast` channel. Faults can be injected
//! to exercise retry and reconnect paths.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BrokerSession, BrokerTransport, MessageStream, TransportError};

const TOPIC_CAPACITY: usize = 1024;

/// In-memory pub/sub broker. Clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    connect_attempts: AtomicU32,
    fail_connects: AtomicU32,
    subscribe_attempts: AtomicU32,
    fail_subscribes: AtomicU32,
    fail_publish: AtomicBool,
    live: Mutex<CancellationToken>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscribe attempts.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.inner.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// Make every publish fail until reset.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe_attempts(&self) -> u32 {
        self.inner.subscribe_attempts.load(Ordering::SeqCst)
    }

    /// End every live subscription stream.
    pub fn disconnect_subscribers(&self) {
        let mut live = self.inner.live.lock();
        live.cancel();
        *live = CancellationToken::new();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Deliver a raw payload to current subscribers without recording it as
    /// published. Returns the number of receivers.
    pub fn inject(&self, topic: &str, payload: Vec<u8>) -> usize {
        self.sender(topic).send(payload).unwrap_or(0)
    }

    /// Payloads successfully published on `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Consume one unit of an injected failure budget.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn BrokerSession>, TransportError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.inner.fail_connects) {
            return Err(TransportError::Connection("injected connect failure".into()));
        }

        Ok(Box::new(MemorySession {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, TransportError> {
        self.inner.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.inner.fail_subscribes) {
            return Err(TransportError::Subscribe("injected subscribe failure".into()));
        }

        let rx = self.sender(topic).subscribe();
        let live = self.inner.live.lock().clone();
        debug!(topic = %topic, "Memory subscription opened");

        let stream = stream::unfold((rx, live), |(mut rx, live)| async move {
            loop {
                let received = tokio::select! {
                    _ = live.cancelled() => return None,
                    r = rx.recv() => r,
                };
                match received {
                    Ok(payload) => return Some((Ok(payload), (rx, live))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Memory subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct MemorySession {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("session closed".into()));
        }
        if self.broker.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("injected publish failure".into()));
        }

        self.broker
            .inner
            .published
            .lock()
            .push((topic.to_string(), payload.clone()));
        // No subscribers is not an error
        let _ = self.broker.sender(topic).send(payload);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
