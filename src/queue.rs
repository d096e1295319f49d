// Durable background job queue on Redis.
//
// Jobs are deduplicated by caller-supplied job id: an id that is still
// queued or running is returned as-is, while ids in a terminal state are
// replaced. Delivery is at-least-once; consumers must be idempotent.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// How long terminal job records linger before Redis expires them.
const TERMINAL_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Background certificate jobs produced by the watcher and batch ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CertJob {
    Ingest { org_id: i32, path: String },
    DeleteByPath { org_id: i32, path: String },
}

/// Queue-visible job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<JobState> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "finished" => Some(JobState::Finished),
            "failed" => Some(JobState::Failed),
            "canceled" => Some(JobState::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Canceled)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend unavailable")]
    Unavailable,

    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct Queue {
    conn: Option<ConnectionManager>,
    name: String,
}

impl Queue {
    pub async fn connect(redis_url: &str, name: &str) -> Self {
        let conn = match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "job queue Redis unavailable");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid Redis URL for job queue");
                None
            }
        };
        Queue {
            conn,
            name: name.to_string(),
        }
    }

    /// Queue with no backend; every enqueue surfaces a transient error.
    pub fn disconnected(name: &str) -> Self {
        Queue {
            conn: None,
            name: name.to_string(),
        }
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.name)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.name, job_id)
    }

    /// Enqueues unless a job with this id is already queued or running.
    /// Returns `true` when the existing job was kept (deduplicated).
    pub async fn enqueue_unique(&self, job_id: &str, job: &CertJob) -> Result<bool, QueueError> {
        let Some(conn) = &self.conn else {
            return Err(QueueError::Unavailable);
        };
        let mut conn = conn.clone();

        let existing: Option<String> = conn.hget(self.job_key(job_id), "state").await?;
        if let Some(state) = existing.as_deref().and_then(JobState::parse) {
            if !state.is_terminal() {
                return Ok(true);
            }
        }

        let payload = serde_json::to_string(job)?;
        let _: () = redis::pipe()
            .atomic()
            .hset(self.job_key(job_id), "state", JobState::Queued.as_str())
            .ignore()
            .hset(self.job_key(job_id), "payload", payload)
            .ignore()
            .persist(self.job_key(job_id))
            .ignore()
            .lpush(self.pending_key(), job_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(false)
    }

    /// Blocks up to `timeout_secs` for the next job and marks it running.
    pub async fn dequeue(&self, timeout_secs: f64) -> Result<Option<(String, CertJob)>, QueueError> {
        let Some(conn) = &self.conn else {
            return Err(QueueError::Unavailable);
        };
        let mut conn = conn.clone();

        let popped: Option<(String, String)> =
            conn.brpop(self.pending_key(), timeout_secs).await?;
        let Some((_, job_id)) = popped else {
            return Ok(None);
        };

        let payload: Option<String> = conn.hget(self.job_key(&job_id), "payload").await?;
        let Some(payload) = payload else {
            // Record was dropped between push and pop; nothing to run.
            return Ok(None);
        };

        let _: () = conn
            .hset(self.job_key(&job_id), "state", JobState::Running.as_str())
            .await?;

        let job: CertJob = serde_json::from_str(&payload)?;
        Ok(Some((job_id, job)))
    }

    /// Records a terminal state and lets the record expire.
    pub async fn mark_terminal(&self, job_id: &str, state: JobState) -> Result<(), QueueError> {
        let Some(conn) = &self.conn else {
            return Err(QueueError::Unavailable);
        };
        let mut conn = conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(self.job_key(job_id), "state", state.as_str())
            .ignore()
            .expire(self.job_key(job_id), TERMINAL_TTL_SECONDS)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Lexically normalizes a path: absolute, with `.`/`..` components resolved.
/// Does not require the file to exist (deleted files are normalized too).
pub fn normalize_path(raw: &Path) -> PathBuf {
    let absolute = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(raw))
            .unwrap_or_else(|_| raw.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Finished,
            JobState::Failed,
            JobState::Canceled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("paused"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Finished.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_cert_job_serde() {
        let job = CertJob::Ingest {
            org_id: 1,
            path: "/srv/certs/a.pfx".to_string(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""kind":"ingest""#));
        let parsed: CertJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_normalize_path_resolves_dots() {
        let normalized = normalize_path(Path::new("/srv/certs/../certs/./a.pfx"));
        assert_eq!(normalized, PathBuf::from("/srv/certs/a.pfx"));
    }

    #[test]
    fn test_normalize_path_absolutizes() {
        let normalized = normalize_path(Path::new("relative.pfx"));
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("relative.pfx"));
    }

    #[test]
    fn test_enqueue_without_backend_is_transient_error() {
        let queue = Queue::disconnected("certs");
        let job = CertJob::DeleteByPath {
            org_id: 1,
            path: "/srv/certs/a.pfx".to_string(),
        };
        let result = tokio_test::block_on(queue.enqueue_unique("job-1", &job));
        assert!(matches!(result, Err(QueueError::Unavailable)));
    }

    // Requires a running Redis instance:
    //   docker run -d -p 6379:6379 redis:7-alpine
    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_enqueue_dedup_and_dequeue() {
        let queue = Queue::connect("redis://127.0.0.1:6379", "certs-test").await;
        let job = CertJob::Ingest {
            org_id: 1,
            path: "/tmp/a.pfx".to_string(),
        };
        let job_id = format!("test-{}", uuid::Uuid::new_v4());

        assert!(!queue.enqueue_unique(&job_id, &job).await.unwrap());
        // Second enqueue of a queued id deduplicates.
        assert!(queue.enqueue_unique(&job_id, &job).await.unwrap());

        let (popped_id, popped) = queue.dequeue(1.0).await.unwrap().unwrap();
        assert_eq!(popped_id, job_id);
        assert_eq!(popped, job);

        queue.mark_terminal(&job_id, JobState::Finished).await.unwrap();
        // Terminal ids are replaced by a fresh enqueue.
        assert!(!queue.enqueue_unique(&job_id, &job).await.unwrap());
    }
}
