//! Redis pub/sub transport.
//!
//! Publishing goes through a pooled connection; the `PUBLISH` reply (number
//! of receivers) is the acknowledgement. Subscribing needs a dedicated
//! connection, since pooled connections cannot enter SUBSCRIBE mode.

use async_trait::async_trait;
use deadpool_redis::{Pool, redis::AsyncCommands};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerSession, BrokerTransport, MessageStream, TransportError};

/// Broker transport over Redis pub/sub channels.
pub struct RedisTransport {
    url: String,
    timeout: Duration,
}

impl RedisTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    fn create_pool(&self) -> Result<Pool, TransportError> {
        let mut cfg = deadpool_redis::Config::from_url(&self.url);
        if let Some(ref mut pool_config) = cfg.pool {
            pool_config.max_size = 4;
            pool_config.timeouts.wait = Some(self.timeout);
            pool_config.timeouts.create = Some(self.timeout);
            pool_config.timeouts.recycle = Some(self.timeout);
        }
        cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

#[async_trait]
impl BrokerTransport for RedisTransport {
    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<Box<dyn BrokerSession>, TransportError> {
        let pool = self.create_pool()?;

        // Verify reachability before reporting the session as established
        let mut conn = pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let _: String = deadpool_redis::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        drop(conn);

        info!(url = %self.url, "Connected to Redis broker");
        Ok(Box::new(RedisSession { pool }))
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, TransportError> {
        use deadpool_redis::redis::Client;

        let client =
            Client::open(self.url.as_str()).map_err(|e| TransportError::Connection(e.to_string()))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        info!(channel = %topic, "Subscribed to Redis channel");

        let stream = pubsub
            .into_on_message()
            .map(|msg| Ok(msg.get_payload_bytes().to_vec()));
        Ok(stream.boxed())
    }
}

struct RedisSession {
    pool: Pool,
}

#[async_trait]
impl BrokerSession for RedisSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::Publish(format!("Redis pool error: {e}")))?;

        let receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        debug!(channel = %topic, receivers, "Published to Redis");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}
