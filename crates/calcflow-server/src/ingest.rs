//! Background consumer feeding broker events into the event ring.

use calcflow_core::{Event, EventRing};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, BrokerError};
use crate::metrics;

/// Validate one decoded broker message and append it to `ring`.
///
/// Returns `false` if the message was dropped.
pub fn ingest_message(ring: &EventRing, message: Map<String, Value>) -> bool {
    match Event::from_map(message) {
        Ok(event) => {
            debug!(operation = %event.operation, input = %event.input_repr, "Event ingested");
            if let Some(evicted) = ring.append(event) {
                debug!(timestamp = %evicted.timestamp, "Evicted oldest event");
            }
            metrics::record_ingest_accepted();
            true
        }
        Err(e) => {
            metrics::record_ingest_dropped("structure");
            warn!(error = %e, "Dropping malformed event");
            false
        }
    }
}

/// Subscribes to the event topic and appends every valid event to the ring.
pub struct EventIngestLoop {
    broker: Arc<BrokerConnection>,
    ring: Arc<EventRing>,
    topic: String,
}

impl EventIngestLoop {
    pub fn new(broker: Arc<BrokerConnection>, ring: Arc<EventRing>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            ring,
            topic: topic.into(),
        }
    }

    /// Spawn the loop on the current runtime.
    ///
    /// The loop's cancellation token is a child of the broker's shutdown
    /// token, so stopping the broker also stops the loop.
    pub fn spawn(self) -> IngestHandle {
        let ring = self.ring.clone();
        self.spawn_with(move |message| {
            ingest_message(&ring, message);
        })
    }

    /// Spawn the loop with `handler` receiving each decoded message in place
    /// of ring ingestion.
    pub fn spawn_with<F>(self, handler: F) -> IngestHandle
    where
        F: FnMut(Map<String, Value>) + Send + 'static,
    {
        let cancel = self.broker.shutdown_token().child_token();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            info!(topic = %self.topic, "Event ingest loop started");
            let result = self.broker.subscribe(&self.topic, loop_cancel, handler).await;

            match &result {
                Ok(()) => info!(topic = %self.topic, "Event ingest loop stopped"),
                Err(e) => error!(topic = %self.topic, error = %e, "Event ingest loop failed"),
            }
            result
        });

        IngestHandle {
            cancel,
            task: Some(task),
            outcome: None,
        }
    }
}

/// Why an ingest loop ended on its own.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("event ingest loop failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("event ingest task panicked: {0}")]
    Panicked(String),
}

/// How an ingest loop ended during shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestShutdown {
    /// The loop observed cancellation and returned.
    Clean,
    /// The loop had already ended with an error, or panicked.
    Failed(String),
    /// The loop did not finish in time and was aborted.
    TimedOut,
}

/// Handle to a running ingest loop.
pub struct IngestHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), BrokerError>>>,
    outcome: Option<IngestShutdown>,
}

impl IngestHandle {
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the loop to end without cancelling it.
    ///
    /// Cancel safe. Once the loop has ended, later calls return `Ok(())`.
    pub async fn finished(&mut self) -> Result<(), IngestError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        let result = match task.await {
            Ok(result) => result.map_err(IngestError::from),
            Err(join_err) => Err(IngestError::Panicked(join_err.to_string())),
        };
        self.task = None;
        self.outcome = Some(match &result {
            Ok(()) => IngestShutdown::Clean,
            Err(e) => IngestShutdown::Failed(e.to_string()),
        });
        result
    }

    /// Signal cancellation and wait up to `timeout` for the loop to finish
    /// the message it is processing.
    pub async fn shutdown(self, timeout: Duration) -> IngestShutdown {
        self.cancel.cancel();
        let Some(task) = self.task else {
            return self.outcome.unwrap_or(IngestShutdown::Clean);
        };
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(()))) => IngestShutdown::Clean,
            Ok(Ok(Err(e))) => IngestShutdown::Failed(e.to_string()),
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "Event ingest task panicked");
                IngestShutdown::Failed(join_err.to_string())
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Event ingest loop ignored cancellation, aborting"
                );
                abort.abort();
                IngestShutdown::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn event_map(input: &str) -> Map<String, Value> {
        match json!({
            "operation": "fibonacci",
            "input_repr": input,
            "result_repr": "55",
            "timestamp": "2024-05-01T12:00:00Z",
            "requester": "alice",
            "origin": "computed"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn accepts_well_formed_events() {
        let ring = EventRing::new(4);
        assert!(ingest_message(&ring, event_map("10")));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.snapshot()[0].input_repr, "10");
    }

    #[test]
    fn drops_structurally_invalid_messages() {
        let ring = EventRing::new(4);

        let mut missing = event_map("10");
        missing.remove("requester");
        assert!(!ingest_message(&ring, missing));

        let mut bad_time = event_map("10");
        bad_time.insert("timestamp".into(), json!("yesterday"));
        assert!(!ingest_message(&ring, bad_time));

        assert!(ring.is_empty());
    }

    #[test]
    fn origin_is_optional() {
        let ring = EventRing::new(4);
        let mut map = event_map("3");
        map.remove("origin");
        assert!(ingest_message(&ring, map));
        assert_eq!(ring.snapshot()[0].origin, None);
    }

    async fn connected(broker: &MemoryBroker, attempts: u32) -> Arc<BrokerConnection> {
        let conn = Arc::new(BrokerConnection::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(attempts, Duration::from_millis(5)),
            Duration::from_millis(200),
        ));
        conn.start().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn finished_reports_subscription_exhaustion() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribes(10);
        let conn = connected(&broker, 2).await;

        let mut handle =
            EventIngestLoop::new(conn.clone(), Arc::new(EventRing::new(4)), "events").spawn();
        let err = tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .expect("loop must end")
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Broker(BrokerError::StartupExhausted { attempts: 2, .. })
        ));
        assert!(handle.is_finished());
        assert!(handle.finished().await.is_ok());
        assert!(matches!(
            handle.shutdown(Duration::from_millis(50)).await,
            IngestShutdown::Failed(_)
        ));

        conn.stop().await;
    }

    #[tokio::test]
    async fn custom_handler_receives_messages() {
        let broker = MemoryBroker::new();
        let conn = connected(&broker, 2).await;
        let seen = Arc::new(AtomicBool::new(false));

        let handle = {
            let seen = seen.clone();
            EventIngestLoop::new(conn.clone(), Arc::new(EventRing::new(4)), "events")
                .spawn_with(move |_| seen.store(true, Ordering::SeqCst))
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.subscriber_count("events") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            broker.inject("events", b"{}".to_vec());
            while !seen.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler not called");

        assert_eq!(
            handle.shutdown(Duration::from_millis(200)).await,
            IngestShutdown::Clean
        );
        conn.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_handler_is_abandoned_after_timeout() {
        let broker = MemoryBroker::new();
        let conn = connected(&broker, 2).await;
        let entered = Arc::new(AtomicBool::new(false));

        let handle = {
            let entered = entered.clone();
            EventIngestLoop::new(conn.clone(), Arc::new(EventRing::new(4)), "events").spawn_with(
                move |_| {
                    entered.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(400));
                },
            )
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.subscriber_count("events") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            broker.inject("events", b"{}".to_vec());
            while !entered.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler not entered");

        let started = std::time::Instant::now();
        assert_eq!(
            handle.shutdown(Duration::from_millis(50)).await,
            IngestShutdown::TimedOut
        );
        assert!(started.elapsed() < Duration::from_millis(300));

        conn.stop().await;
    }
}
