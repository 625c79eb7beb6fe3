//! Detached background work: usage records and key last-used updates
//!
//! Handlers never await directory writes for bookkeeping. They hand a job to
//! a bounded queue with `try_send` and move on; a single worker drains the
//! queue. A full queue drops the job, a failed job is logged, and neither
//! ever reaches the client.

use chrono::{DateTime, Utc};
use gatekeeper_core::{TenantContext, UsageLogEntry};
use gatekeeper_storage::TenantDirectory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default capacity of the work queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Outcome of one request, as handed to the recorder.
///
/// `tenant_id` is absent when the request failed before a tenant was
/// resolved; such outcomes are counted but not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub tenant_id: Option<String>,
    pub api_key_id: Option<String>,
    pub endpoint: String,
    pub query_count: u32,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestOutcome {
    fn into_entry(self) -> Option<UsageLogEntry> {
        let tenant_id = self.tenant_id?;
        Some(UsageLogEntry {
            tenant_id,
            api_key_id: self.api_key_id,
            endpoint: self.endpoint,
            query_count: self.query_count,
            cache_hit: self.cache_hit,
            latency_ms: self.latency_ms,
            status_code: self.status_code,
            error: self.error,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundJob {
    RecordUsage(RequestOutcome),
    TouchApiKey {
        tenant_id: String,
        key_id: String,
        at: DateTime<Utc>,
    },
}

impl BackgroundJob {
    pub fn kind(&self) -> &'static str {
        match self {
            BackgroundJob::RecordUsage(_) => "record_usage",
            BackgroundJob::TouchApiKey { .. } => "touch_api_key",
        }
    }
}

/// Cheap-to-clone handle for submitting background jobs
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<BackgroundJob>,
}

impl WorkQueue {
    /// Returns the queue handle and the receiver for [`background_worker`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BackgroundJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue without waiting. Returns `false` if the job was dropped.
    pub fn submit(&self, job: BackgroundJob) -> bool {
        let kind = job.kind();
        match self.sender.try_send(job) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_background_job(kind, "queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job = kind, "Work queue full, job dropped");
                #[cfg(feature = "metrics")]
                crate::metrics::record_background_job(kind, "dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(job = kind, "Work queue closed, job dropped");
                #[cfg(feature = "metrics")]
                crate::metrics::record_background_job(kind, "dropped");
                false
            }
        }
    }
}

/// Appends one usage log entry per completed request, off the response path
#[derive(Clone)]
pub struct UsageRecorder {
    queue: WorkQueue,
}

impl UsageRecorder {
    pub fn new(queue: WorkQueue) -> Self {
        Self { queue }
    }

    pub fn record(&self, outcome: RequestOutcome) {
        self.queue.submit(BackgroundJob::RecordUsage(outcome));
    }
}

/// Drain the work queue until every sender is gone.
///
/// Each job runs under `job_timeout`. Failures are logged and the loop
/// continues.
pub async fn background_worker(
    mut receiver: mpsc::Receiver<BackgroundJob>,
    directory: Arc<dyn TenantDirectory>,
    job_timeout: Duration,
) {
    info!("Background worker started");

    while let Some(job) = receiver.recv().await {
        let kind = job.kind();
        let outcome = match tokio::time::timeout(job_timeout, run_job(directory.as_ref(), job))
            .await
        {
            Ok(Ok(())) => "completed",
            Ok(Err(e)) => {
                warn!(job = kind, error = %e, "Background job failed");
                "failed"
            }
            Err(_) => {
                warn!(job = kind, timeout = ?job_timeout, "Background job timed out");
                "failed"
            }
        };

        #[cfg(feature = "metrics")]
        crate::metrics::record_background_job(kind, outcome);
        #[cfg(not(feature = "metrics"))]
        let _ = outcome;
    }

    info!("Background worker shutting down");
}

async fn run_job(
    directory: &dyn TenantDirectory,
    job: BackgroundJob,
) -> gatekeeper_core::Result<()> {
    match job {
        BackgroundJob::RecordUsage(outcome) => {
            let endpoint = outcome.endpoint.clone();
            let status_code = outcome.status_code;
            match outcome.into_entry() {
                Some(entry) => {
                    let ctx = TenantContext::new(entry.tenant_id.clone())?;
                    directory.append_usage(&ctx, entry).await
                }
                None => {
                    debug!(endpoint = %endpoint, status_code, "Unattributed request, not persisted");
                    Ok(())
                }
            }
        }
        BackgroundJob::TouchApiKey {
            tenant_id,
            key_id,
            at,
        } => {
            let ctx = TenantContext::new(tenant_id)?;
            directory.touch_api_key(&ctx, &key_id, at).await
        }
    }
}
