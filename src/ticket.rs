use crate::adapters::{ChatMessage, GenerationParams};
use crate::coordination::CoordinationStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A validated chat request staged between pre-check and the streaming
/// session that consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    #[serde(default)]
    pub params: GenerationParams,
}

const TICKET_KEY_PREFIX: &str = "ticket";

/// Single-use tickets over the coordination store: `put` stages a request
/// under a TTL, `take_once` is get-then-delete so a ticket can never be
/// redeemed twice.
#[derive(Clone)]
pub struct TicketCache {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl TicketCache {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn put(&self, staged: &StagedRequest) -> Result<String, String> {
        let ticket = uuid::Uuid::new_v4().simple().to_string();
        let payload = serde_json::to_string(staged).map_err(|err| err.to_string())?;
        let key = format!("{TICKET_KEY_PREFIX}:{ticket}");
        if !self.store.set_if_absent(&key, &payload, self.ttl).await? {
            return Err("ticket collision".to_string());
        }
        Ok(ticket)
    }

    pub async fn take_once(&self, ticket: &str) -> Result<Option<StagedRequest>, String> {
        let key = format!("{TICKET_KEY_PREFIX}:{ticket}");
        let Some(payload) = self.store.get(&key).await? else {
            return Ok(None);
        };
        self.store.delete(&key).await?;
        let staged: StagedRequest =
            serde_json::from_str(&payload).map_err(|err| err.to_string())?;
        Ok(Some(staged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Role;
    use crate::coordination::MemoryCoordinationStore;

    fn staged() -> StagedRequest {
        StagedRequest {
            model: "gpt-test".to_string(),
            messages: vec![ChatMessage::new(Role::User, "hello")],
            user_id: "user-1".to_string(),
            params: GenerationParams::default(),
        }
    }

    #[tokio::test]
    async fn ticket_is_consumed_exactly_once() {
        let cache = TicketCache::new(
            Arc::new(MemoryCoordinationStore::default()),
            Duration::from_secs(60),
        );
        let ticket = cache.put(&staged()).await.unwrap();
        assert!(cache.take_once(&ticket).await.unwrap().is_some());
        assert!(cache.take_once(&ticket).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ticket_is_invalid() {
        let cache = TicketCache::new(
            Arc::new(MemoryCoordinationStore::default()),
            Duration::from_secs(60),
        );
        let ticket = cache.put(&staged()).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.take_once(&ticket).await.unwrap().is_none());
    }
}
