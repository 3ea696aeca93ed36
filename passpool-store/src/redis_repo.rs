use async_trait::async_trait;
use redis::RedisResult;

/// INCR, then start the window only if the key has no expiry yet. A TTL of -1 also
/// covers a counter left behind without one.
const FIXED_WINDOW: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    if redis.call("TTL", KEYS[1]) < 0 then
        redis.call("EXPIRE", KEYS[1], ARGV[1])
    end
    return count
"#;

/// Counts requests per key in fixed windows
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request against `key` and report whether it is within `limit`
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_seconds: i64,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter. The window starts at the first request, later
    /// requests in it do not push the expiry back.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let count: i64 = redis::Script::new(FIXED_WINDOW)
            .key(key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

#[async_trait]
impl RateLimiter for RedisClient {
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_seconds: i64,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.check_rate_limit(key, limit, window_seconds).await?)
    }
}

pub fn rate_limit_key(user_id: &uuid::Uuid) -> String {
    format!("ratelimit:rider:{}", user_id)
}
