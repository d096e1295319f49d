// Fixed-window rate limiter backed by Redis.
//
// Atomic INCR with a TTL set on the first hit of each window. Rate limiting
// is a soft guard: on any backend error the check fails open.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

pub const AGENT_AUTH_LIMIT: u32 = 10;
pub const AGENT_PAYLOAD_LIMIT: u32 = 5;
pub const WINDOW_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct RateLimiter {
    conn: Option<ConnectionManager>,
}

impl RateLimiter {
    pub async fn connect(redis_url: &str) -> Self {
        let conn = match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "rate limiter Redis unavailable, failing open");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid Redis URL, rate limiter failing open");
                None
            }
        };
        RateLimiter { conn }
    }

    /// Rate limiter with no backend; every check is allowed.
    pub fn disconnected() -> Self {
        RateLimiter { conn: None }
    }

    /// Fixed-window check: returns `(allowed, count)` for this window.
    pub async fn check(&self, key: &str, limit: u32, window_seconds: i64) -> (bool, u64) {
        let Some(conn) = &self.conn else {
            return (true, 0);
        };
        let mut conn = conn.clone();

        let result: Result<(u64, i64), redis::RedisError> = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .ttl(key)
            .query_async(&mut conn)
            .await;

        match result {
            Ok((count, ttl)) => {
                if ttl < 0 {
                    let _: Result<(), redis::RedisError> =
                        conn.expire(key, window_seconds).await;
                }
                (count <= u64::from(limit), count)
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "rate limit backend error, failing open");
                (true, 0)
            }
        }
    }
}

pub fn agent_auth_key(device_id: uuid::Uuid) -> String {
    format!("agent_auth:{device_id}")
}

pub fn agent_payload_key(device_id: uuid::Uuid) -> String {
    format!("agent_payload:{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(agent_auth_key(id), format!("agent_auth:{id}"));
        assert_eq!(agent_payload_key(id), format!("agent_payload:{id}"));
    }

    #[tokio::test]
    async fn test_fail_open_without_backend() {
        let limiter = RateLimiter::disconnected();
        let (allowed, count) = limiter.check("agent_auth:test", 1, 60).await;
        assert!(allowed);
        assert_eq!(count, 0);
        // Repeated checks stay open with no backend.
        let (allowed, _) = limiter.check("agent_auth:test", 1, 60).await;
        assert!(allowed);
    }

    // Requires a running Redis instance:
    //   docker run -d -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_window_counting() {
        let limiter = RateLimiter::connect("redis://127.0.0.1:6379").await;
        let key = format!("test:rl:{}", uuid::Uuid::new_v4());

        for i in 1..=3 {
            let (allowed, count) = limiter.check(&key, 3, 60).await;
            assert!(allowed, "attempt {i} should pass");
            assert_eq!(count, i);
        }
        let (allowed, count) = limiter.check(&key, 3, 60).await;
        assert!(!allowed);
        assert_eq!(count, 4);
    }
}
