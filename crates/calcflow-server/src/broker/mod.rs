//! Message broker connection for publishing and consuming operation events.
//!
//! # Architecture
//!
//! ```text
//!  ComputeOrchestrator ──send()──►┐
//!                                 │  BrokerConnection ──► BrokerSession ──► broker
//!  EventIngestLoop ◄─subscribe()──┘        │
//!                                          └──────────► BrokerTransport::subscribe
//! ```
//!
//! [`BrokerConnection`] owns the connection state machine; transports only
//! know how to connect, publish and open a subscription stream.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──start()──► Connecting ──ok──► Connected ──stop()──► Closing ──► Closed
//!       ▲                        │
//!       └──── attempts exhausted ┘
//! ```

mod connection;
mod memory;
mod redis;

pub use self::connection::BrokerConnection;
pub use self::memory::MemoryBroker;
pub use self::redis::RedisTransport;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// Stream of raw message payloads from a subscription.
///
/// The stream ending or yielding an error means the subscription was lost.
pub type MessageStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Connection state of a [`BrokerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Attempts below 1 are treated as 1.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscription stream ended")]
    StreamEnded,
}

/// Errors surfaced by [`BrokerConnection`].
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,

    #[error("broker connection is closed")]
    Closed,

    #[error("broker unreachable after {attempts} attempt(s): {last_error}")]
    StartupExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("publish failed: {0}")]
    Publish(#[source] TransportError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Establishes sessions and subscriptions against a concrete broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;

    /// Open an outbound publishing session.
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, TransportError>;

    /// Open an inbound subscription on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, TransportError>;
}

/// An established outbound session.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish `payload` and wait for the broker's acknowledgement.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Release the session's resources.
    async fn close(&self);
}
