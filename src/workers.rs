// Background worker: consumes the certificate job queue.
//
// Each job runs to completion exactly once per delivery; failures are
// recorded on the queue record. Ingest and delete handlers are idempotent,
// so at-least-once delivery is safe.

use crate::config::Settings;
use crate::db::certificates;
use crate::ingest;
use crate::queue::{CertJob, JobState, Queue, QueueError};
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEQUEUE_TIMEOUT_SECS: f64 = 5.0;
const BACKOFF_ON_ERROR: Duration = Duration::from_secs(5);

/// Runs the queue consumer until the process shuts down.
pub async fn run_worker(pool: PgPool, queue: Queue, settings: Arc<Settings>) {
    tracing::info!(queue = %settings.rq_queue_name, "certificate worker started");
    loop {
        match queue.dequeue(DEQUEUE_TIMEOUT_SECS).await {
            Ok(Some((job_id, job))) => {
                let outcome = execute_job(&pool, &settings, &job).await;
                let state = match outcome {
                    Ok(()) => JobState::Finished,
                    Err(ref e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "certificate job failed");
                        JobState::Failed
                    }
                };
                if let Err(e) = queue.mark_terminal(&job_id, state).await {
                    tracing::warn!(job_id = %job_id, error = %e, "unable to record job state");
                }
            }
            Ok(None) => {}
            Err(QueueError::Unavailable) => {
                tokio::time::sleep(BACKOFF_ON_ERROR).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "queue dequeue error");
                tokio::time::sleep(BACKOFF_ON_ERROR).await;
            }
        }
    }
}

async fn execute_job(
    pool: &PgPool,
    settings: &Settings,
    job: &CertJob,
) -> Result<(), crate::error::ApiError> {
    match job {
        CertJob::Ingest { org_id, path } => {
            tracing::info!(org_id, path = %path, "job ingest started");
            let (action, cert_id, error) = ingest::ingest_certificate_from_path(
                pool,
                *org_id,
                Path::new(path),
                &settings.openssl_path,
            )
            .await?;
            tracing::info!(
                org_id,
                path = %path,
                action = ?action,
                cert_id = ?cert_id,
                error = ?error,
                "job ingest finished"
            );
            Ok(())
        }
        CertJob::DeleteByPath { org_id, path } => {
            tracing::info!(org_id, path = %path, "job delete started");
            let action = match certificates::find_by_source_path(pool, *org_id, path).await? {
                Some(cert) => {
                    certificates::delete_certificate(pool, cert.id).await?;
                    "deleted"
                }
                None => "not_found",
            };
            tracing::info!(org_id, path = %path, action, "job delete finished");
            Ok(())
        }
    }
}
