use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::events::{event_payload, EventSink};
use crate::models::*;

/// Publishes change events on Redis pub/sub channels named after the topic
/// (`oparl:<entity_type>`).
#[derive(Clone)]
pub struct RedisEventSink {
    conn: ConnectionManager,
}

impl RedisEventSink {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| IngestionError::Configuration(format!("Invalid Redis URL: {}", e)))?;

        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let mut conn = self.conn.clone();
        let topic = event.topic();
        let payload = event_payload(event).to_string();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&topic)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(IngestionError::Redis)?;
        tracing::debug!(topic = %topic, external_id = %event.external_id, receivers = receivers, "Published change event");
        Ok(())
    }
}
