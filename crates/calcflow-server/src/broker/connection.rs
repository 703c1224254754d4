use calcflow_core::encode_stable;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{BrokerError, BrokerSession, BrokerTransport, ConnectionState, RetryPolicy, TransportError};
use crate::metrics;

/// Process-wide broker handle.
///
/// `start()` is serialized through an init lock, so concurrent initializers
/// cannot open two sessions. `Closed` is terminal: once stopped, the
/// connection cannot be restarted.
pub struct BrokerConnection {
    transport: Arc<dyn BrokerTransport>,
    retry: RetryPolicy,
    drain_timeout: Duration,
    state: parking_lot::Mutex<ConnectionState>,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    init: Mutex<()>,
    shutdown: CancellationToken,
    inflight: TaskTracker,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn BrokerTransport>, retry: RetryPolicy, drain_timeout: Duration) -> Self {
        Self {
            transport,
            retry,
            drain_timeout,
            state: parking_lot::Mutex::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            init: Mutex::new(()),
            shutdown: CancellationToken::new(),
            inflight: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Token cancelled when `stop()` begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        debug!(from = %*state, to = %next, "Broker state transition");
        *state = next;
    }

    /// Establish the outbound session with bounded retry.
    ///
    /// Returns `StartupExhausted` after the last failed attempt, leaving the
    /// connection `Disconnected`. Calling `start()` on a connected handle is
    /// a no-op.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let _init = self.init.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => return Err(BrokerError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let attempts = self.retry.attempts;
        let endpoint = self.transport.endpoint();
        self.set_state(ConnectionState::Connecting);

        let mut last_error = None;
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(BrokerError::Closed),
                r = self.transport.connect() => r,
            };

            match outcome {
                Ok(session) => {
                    *self.session.write().await = Some(Arc::from(session));
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %endpoint, attempt, "Broker connected");
                    return Ok(());
                }
                Err(e) => {
                    metrics::record_broker_connect_failure();
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Broker connect attempt failed"
                    );
                    last_error = Some(e);

                    if attempt < attempts {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Err(BrokerError::Closed),
                            _ = sleep(self.retry.delay) => {}
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let last_error = last_error
            .unwrap_or_else(|| TransportError::Connection("no connect attempt made".into()));
        error!(
            endpoint = %endpoint,
            attempts,
            error = %last_error,
            "Broker unreachable, giving up"
        );
        Err(BrokerError::StartupExhausted {
            attempts,
            last_error,
        })
    }

    /// Publish `payload` with stable key ordering and wait for the broker's
    /// acknowledgement.
    pub async fn send<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<(), BrokerError> {
        // Held until the publish completes so `stop()` can drain it
        let _inflight = self.inflight.token();
        if self.shutdown.is_cancelled() || !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)?;

        let bytes = encode_stable(payload)?;
        session
            .publish(topic, bytes)
            .await
            .map_err(BrokerError::Publish)?;

        metrics::record_published(topic);
        Ok(())
    }

    /// Run the inbound receive loop on `topic` until `cancel` fires or the
    /// connection stops.
    ///
    /// Every message is decoded as a JSON object and handed to `handler`. A
    /// message that does not decode is logged and dropped; the loop keeps
    /// going. A lost subscription is re-established with the same retry
    /// policy as `start()`; running out of attempts returns
    /// `StartupExhausted`.
    pub async fn subscribe<F>(&self, topic: &str, cancel: CancellationToken, mut handler: F) -> Result<(), BrokerError>
    where
        F: FnMut(Map<String, Value>) + Send,
    {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closing | ConnectionState::Closed => return Err(BrokerError::Closed),
            _ => return Err(BrokerError::NotConnected),
        }

        let attempts = self.retry.attempts;
        let mut failures = 0u32;

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.shutdown.cancelled() => return Ok(()),
                r = self.transport.subscribe(topic) => r,
            };

            match opened {
                Ok(mut stream) => {
                    failures = 0;
                    debug!(topic = %topic, "Receive loop started");

                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(()),
                            _ = self.shutdown.cancelled() => return Ok(()),
                            m = stream.next() => m,
                        };

                        match next {
                            Some(Ok(bytes)) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                                Ok(map) => handler(map),
                                Err(e) => {
                                    metrics::record_ingest_dropped("decode");
                                    warn!(
                                        topic = %topic,
                                        error = %e,
                                        payload = %String::from_utf8_lossy(&bytes),
                                        "Dropping undecodable broker message"
                                    );
                                }
                            },
                            Some(Err(e)) => {
                                warn!(topic = %topic, error = %e, "Subscription lost");
                                break;
                            }
                            None => {
                                warn!(topic = %topic, "Subscription stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        topic = %topic,
                        attempt = failures,
                        max_attempts = attempts,
                        error = %e,
                        "Subscribe attempt failed"
                    );
                    if failures >= attempts {
                        error!(topic = %topic, attempts, "Giving up on subscription");
                        return Err(BrokerError::StartupExhausted {
                            attempts,
                            last_error: e,
                        });
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = sleep(self.retry.delay) => {}
            }
        }
    }

    /// Drain in-flight publishes and close the session.
    ///
    /// Idempotent, and safe on a connection that was never started. Unblocks
    /// any running `subscribe()` loop and any `start()` still retrying.
    pub async fn stop(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        self.shutdown.cancel();
        // Waits for a retrying start() to observe the cancellation
        let _init = self.init.lock().await;
        if self.state() == ConnectionState::Closed {
            return;
        }

        self.set_state(ConnectionState::Closing);
        self.inflight.close();
        if timeout(self.drain_timeout, self.inflight.wait()).await.is_err() {
            warn!(
                pending = self.inflight.len(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Broker drain timed out, closing with publishes in flight"
            );
        }

        if let Some(session) = self.session.write().await.take() {
            session.close().await;
        }

        self.set_state(ConnectionState::Closed);
        info!("Broker connection closed");
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.transport.endpoint())
            .field("state", &self.state())
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn connection(broker: &MemoryBroker, attempts: u32) -> BrokerConnection {
        BrokerConnection::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(attempts, Duration::from_millis(5)),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn connects_on_first_attempt() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, 5);

        conn.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn succeeds_on_attempt_k_without_further_retries() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let conn = connection(&broker, 5);

        conn.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 3);

        // Already connected: no new attempt
        conn.start().await.unwrap();
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn exhausts_after_exactly_the_bound() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);
        let conn = connection(&broker, 3);

        let err = conn.start().await.unwrap_err();
        match err {
            BrokerError::StartupExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let conn = connection(&broker, 0);

        assert!(conn.start().await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn send_requires_connected_state() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, 1);

        let err = conn.send("t", &json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));

        conn.start().await.unwrap();
        conn.send("t", &json!({"a": 1})).await.unwrap();

        conn.stop().await;
        let err = conn.send("t", &json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
        assert_eq!(broker.published("t").len(), 1);
    }

    #[tokio::test]
    async fn send_encodes_with_sorted_keys() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, 1);
        conn.start().await.unwrap();

        conn.send("t", &json!({"zeta": 1, "alpha": {"y": 2, "x": 1}}))
            .await
            .unwrap();

        let published = broker.published("t");
        assert_eq!(published[0], br#"{"alpha":{"x":1,"y":2},"zeta":1}"#.to_vec());
    }

    #[tokio::test]
    async fn publish_failure_surfaces_as_publish_error() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, 1);
        conn.start().await.unwrap();

        broker.set_fail_publish(true);
        let err = conn.send("t", &json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_terminal() {
        let broker = MemoryBroker::new();
        let never_started = connection(&broker, 1);
        never_started.stop().await;
        never_started.stop().await;
        assert_eq!(never_started.state(), ConnectionState::Closed);

        let conn = connection(&broker, 1);
        conn.start().await.unwrap();
        conn.stop().await;
        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.start().await, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn stop_interrupts_retrying_start() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(100);
        let conn = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(100, Duration::from_secs(60)),
            Duration::from_millis(100),
        ));

        let starter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.start().await })
        };
        while broker.connect_attempts() == 0 {
            tokio::task::yield_now().await;
        }

        timeout(Duration::from_secs(2), conn.stop()).await.unwrap();
        let result = starter.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn subscribe_drops_undecodable_messages_and_stops_on_cancel() {
        let broker = MemoryBroker::new();
        let conn = Arc::new(connection(&broker, 3));
        conn.start().await.unwrap();

        let received = Arc::new(StdMutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let task = {
            let conn = conn.clone();
            let received = received.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                conn.subscribe("events", cancel, move |map| received.lock().unwrap().push(map))
                    .await
            })
        };

        while broker.subscriber_count("events") == 0 {
            tokio::task::yield_now().await;
        }
        broker.inject("events", b"{not json".to_vec());
        broker.inject("events", br#"{"k":"v"}"#.to_vec());

        while received.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["k"], "v");
    }

    #[tokio::test]
    async fn subscribe_reestablishes_after_disconnect() {
        let broker = MemoryBroker::new();
        let conn = Arc::new(connection(&broker, 3));
        conn.start().await.unwrap();

        let received = Arc::new(StdMutex::new(0usize));
        let task = {
            let conn = conn.clone();
            let received = received.clone();
            tokio::spawn(async move {
                conn.subscribe("events", CancellationToken::new(), move |_| {
                    *received.lock().unwrap() += 1
                })
                .await
            })
        };

        while broker.subscriber_count("events") == 0 {
            tokio::task::yield_now().await;
        }
        broker.disconnect_subscribers();
        while broker.subscribe_attempts() < 2 || broker.subscriber_count("events") == 0 {
            tokio::task::yield_now().await;
        }
        broker.inject("events", br#"{"k":1}"#.to_vec());
        while *received.lock().unwrap() == 0 {
            tokio::task::yield_now().await;
        }

        // stop() unblocks the loop without a message arriving
        conn.stop().await;
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscribe_gives_up_after_retry_bound() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, 2);
        conn.start().await.unwrap();
        broker.fail_next_subscribes(5);

        let err = conn
            .subscribe("events", CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::StartupExhausted { attempts: 2, .. }));
        assert_eq!(broker.subscribe_attempts(), 2);
    }

    #[tokio::test]
    async fn subscribe_before_start_is_rejected() {
        let broker = MemoryBroker::new();
        let conn = connection(&broker, 1);
        let err = conn
            .subscribe("events", CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }
}
