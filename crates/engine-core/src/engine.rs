//! Engine / WorkerPool: claims jobs, dispatches to handlers, reports
//! stats (spec.md S4.6).

use crate::adaptive_controller::AdaptiveController;
use crate::adaptive_semaphore::AdaptiveSemaphore;
use crate::auto_rpm::AutoRpmController;
use crate::cancellation::Cancellation;
use crate::config::EngineConfig;
use crate::error::ErrorClass;
use crate::handler::Handler;
use crate::model::{Job, Outcome, OutcomeClass};
use crate::queue::JobStore;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, warn, Instrument};

/// Stats returned by [`Engine::run`] (spec.md S7's end-of-run block).
#[derive(Debug, Clone)]
pub struct RunStats {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duration: Duration,
    /// Jobs processed per second over the whole run.
    pub throughput: f64,
    pub effective_rpm_by_family: HashMap<String, f64>,
    pub adaptive_controller_snapshot: serde_json::Value,
}

impl RunStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "succeeded": self.succeeded,
            "failed": self.failed,
            "skipped": self.skipped,
            "duration_secs": self.duration.as_secs_f64(),
            "throughput": self.throughput,
            "effective_rpm_by_family": self.effective_rpm_by_family,
            "adaptive_controller_snapshot": self.adaptive_controller_snapshot,
        })
    }
}

/// Builds an [`Engine`]. Dependencies (queue, the rate controllers) are
/// constructed before `run` and handed in here; handlers are registered
/// afterward, before the first call to `run`.
pub struct EngineBuilder {
    config: EngineConfig,
    queue: Arc<dyn JobStore>,
    semaphore: AdaptiveSemaphore,
    auto_rpm: Arc<AutoRpmController>,
    adaptive_controller: Arc<AdaptiveController>,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl EngineBuilder {
    pub fn new(
        config: EngineConfig,
        queue: Arc<dyn JobStore>,
        semaphore: AdaptiveSemaphore,
        auto_rpm: Arc<AutoRpmController>,
        adaptive_controller: Arc<AdaptiveController>,
    ) -> Self {
        Self {
            config,
            queue,
            semaphore,
            auto_rpm,
            adaptive_controller,
            handlers: HashMap::new(),
        }
    }

    /// Maps a job type to a handler. Unknown-type jobs dispatched at run
    /// time are released as `permanent` and counted under `skipped`.
    pub fn register_handler(mut self, job_type: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        Arc::new(Engine {
            config: self.config,
            queue: self.queue,
            semaphore: self.semaphore,
            auto_rpm: self.auto_rpm,
            adaptive_controller: self.adaptive_controller,
            handlers: self.handlers,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    queue: Arc<dyn JobStore>,
    semaphore: AdaptiveSemaphore,
    auto_rpm: Arc<AutoRpmController>,
    adaptive_controller: Arc<AdaptiveController>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Engine {
    /// A diagnostic snapshot accessor (spec.md S6), usable at any point
    /// during a run, not only at the end.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "auto_rpm": self.auto_rpm.snapshot(),
            "adaptive_semaphore": self.adaptive_controller.snapshot(),
        })
    }

    /// Launches `worker_count` workers and drives them until
    /// `cancellation` fires or the queue has been empty for
    /// `drain_grace`. Returns after every worker has exited; since every
    /// handler dispatch awaits its own writer submissions before
    /// returning, all writes a completed job triggered are already
    /// committed by the time that job's outcome is counted here.
    pub async fn run(self: Arc<Self>, cancellation: Cancellation) -> RunStats {
        let start = Instant::now();

        let auto_rpm_task = {
            let controller = self.auto_rpm.clone();
            let cancel = cancellation.clone();
            tokio::spawn(async move { controller.start(cancel).await })
        };
        let adaptive_task = {
            let controller = self.adaptive_controller.clone();
            let cancel = cancellation.clone();
            tokio::spawn(async move { controller.start(cancel).await })
        };

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let mut workers = Vec::with_capacity(self.config.worker_count);
        for index in 0..self.config.worker_count {
            let engine = self.clone();
            let cancel = cancellation.clone();
            let activity = last_activity.clone();
            workers.push(tokio::spawn(async move {
                engine.worker_loop(index, cancel, activity).await
            }));
        }
        for worker in workers {
            if let Err(err) = worker.await {
                error!(?err, "worker task panicked");
            }
        }

        // The run is over either way; stop the background evaluators too.
        cancellation.cancel();
        let _ = auto_rpm_task.await;
        let _ = adaptive_task.await;

        let duration = start.elapsed();
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let total = succeeded + failed + skipped;
        let throughput = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        let mut effective_rpm_by_family = HashMap::new();
        effective_rpm_by_family.insert("default".to_string(), self.auto_rpm.current_rpm());

        RunStats {
            succeeded,
            failed,
            skipped,
            duration,
            throughput,
            effective_rpm_by_family,
            adaptive_controller_snapshot: self.snapshot(),
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_index: usize,
        cancellation: Cancellation,
        last_activity: Arc<Mutex<Instant>>,
    ) {
        loop {
            if cancellation.is_cancelled() {
                debug!(worker_index, "worker exiting: cancelled");
                return;
            }
            let idle_for = Instant::now().duration_since(*last_activity.lock().unwrap());
            if idle_for >= self.config.drain_grace {
                debug!(worker_index, "worker exiting: drain grace elapsed");
                return;
            }

            let claimed = self
                .queue
                .claim(
                    &self.config.lease_owner_tag,
                    self.config.lease_duration,
                    self.config.claim_batch_size,
                )
                .await;

            match claimed {
                Ok(jobs) if !jobs.is_empty() => {
                    *last_activity.lock().unwrap() = Instant::now();
                    for job in jobs {
                        if cancellation.is_cancelled() {
                            self.release_as_transient(job, "worker cancelled before dispatch").await;
                            return;
                        }
                        let permit = match self.semaphore.acquire(&cancellation).await {
                            Ok(permit) => permit,
                            Err(_cancelled) => {
                                self.release_as_transient(job, "worker cancelled while acquiring a slot").await;
                                return;
                            }
                        };
                        self.process_job(job, cancellation.clone()).await;
                        drop(permit);
                    }
                }
                Ok(_) => {
                    if cancellation
                        .race(tokio::time::sleep(self.config.poll_interval.max(self.config.idle_backoff)))
                        .await
                        .is_none()
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(?err, worker_index, "queue claim failed; backing off and retrying");
                    if cancellation
                        .race(tokio::time::sleep(self.config.idle_backoff))
                        .await
                        .is_none()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Releases a claimed-but-undispatched job as `transient` so a later
    /// run picks it back up, instead of leaving it leased until expiry.
    /// Used when cancellation fires between claim and dispatch.
    async fn release_as_transient(&self, job: Job, reason: &str) {
        let outcome = Outcome::transient(reason.to_string(), Duration::ZERO);
        if let Err(err) = self.queue.release(job.id, &outcome).await {
            error!(?err, job_id = job.id, "failed to release undispatched job; lease will expire and it will be reclaimed");
        }
    }

    async fn process_job(&self, job: Job, run_cancellation: Cancellation) {
        let span = info_span!("job", job_id = job.id, job_type = %job.job_type, attempt = job.attempts);
        async {
            let lease_remaining = job
                .lease_expires_at
                .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(self.config.lease_duration);
            // Overall deadline = min(handler deadline, lease deadline); the
            // engine has no separate handler deadline, so the lease alone
            // bounds this job's cancellation scope.
            let job_cancellation = run_cancellation.child_with_deadline(lease_remaining);

            let heartbeat_handle = self.spawn_heartbeat(job.id, job_cancellation.clone());

            let start = Instant::now();
            let handler = self.handlers.get(&job.job_type).cloned();
            let outcome = match handler {
                None => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(job_type = %job.job_type, "no handler registered; releasing as permanent");
                    Outcome::permanent(
                        format!("no handler registered for job type '{}'", job.job_type),
                        start.elapsed(),
                    )
                }
                Some(handler) => {
                    let dispatch = handler.handle(job_cancellation.child(), &job);
                    match AssertUnwindSafe(dispatch).catch_unwind().await {
                        Ok(Ok(())) => {
                            self.succeeded.fetch_add(1, Ordering::Relaxed);
                            Outcome::ok(start.elapsed())
                        }
                        Ok(Err(handler_err)) => {
                            self.failed.fetch_add(1, Ordering::Relaxed);
                            match handler_err.class {
                                ErrorClass::Transient => {
                                    Outcome::transient(handler_err.message, start.elapsed())
                                }
                                ErrorClass::Permanent => {
                                    Outcome::permanent(handler_err.message, start.elapsed())
                                }
                            }
                        }
                        Err(panic) => {
                            self.failed.fetch_add(1, Ordering::Relaxed);
                            let message = panic_message(panic.as_ref());
                            error!(message, "handler panicked; reporting as transient");
                            Outcome::transient(format!("handler panicked: {message}"), start.elapsed())
                        }
                    }
                }
            };

            // Handler is done; stop the heartbeat loop promptly.
            job_cancellation.cancel();
            let _ = heartbeat_handle.await;

            if let Err(err) = self.queue.release(job.id, &outcome).await {
                error!(?err, job_id = job.id, "failed to release job outcome; lease will expire and it will be reclaimed");
            }
        }
        .instrument(span)
        .await
    }

    fn spawn_heartbeat(
        &self,
        job_id: i64,
        job_cancellation: Cancellation,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let owner = self.config.lease_owner_tag.clone();
        let lease_duration = self.config.lease_duration;
        let half_period = lease_duration / 2;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = job_cancellation.cancelled() => return,
                    _ = tokio::time::sleep(half_period) => {
                        if let Err(err) = queue.heartbeat(job_id, &owner, lease_duration).await {
                            warn!(?err, job_id, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
