use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Replays the first response recorded under an `Idempotency-Key`. Backed by
/// Redis when `REDIS_URL` is configured, otherwise by a process-local map.
#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, String)>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        let ttl = Duration::from_secs(crate::config::env_u64("IDEMPOTENCY_TTL_SECS", 3600));
        Self::new(redis, ttl)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match &self.redis {
            Some(client) => redis_get(client, key).await,
            None => {
                let mut guard = self.local.lock().await;
                match guard.get(key) {
                    Some((stored, _)) if stored.elapsed() > self.ttl => {
                        guard.remove(key);
                        None
                    }
                    Some((_, value)) => Some(value.clone()),
                    None => None,
                }
            }
        };
        raw.and_then(|value| serde_json::from_str(&value).ok())
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        match &self.redis {
            Some(client) => redis_set(client, key, json, self.ttl.as_secs().max(1)).await,
            None => {
                self.local
                    .lock()
                    .await
                    .insert(key.to_string(), (Instant::now(), json));
            }
        }
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<String> {
    let mut conn = client.get_multiplexed_async_connection().await.ok()?;
    conn.get::<_, Option<String>>(key).await.ok().flatten()
}

async fn redis_set(client: &redis::Client, key: &str, json: String, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
