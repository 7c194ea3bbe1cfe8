//! An in-memory [`JobStore`], mirroring `engine-queue-sqlite`'s
//! semantics exactly (same claim ordering, same backoff, same dedup
//! rule) without a database, for fast unit and property tests of the
//! engine and worker loop.

use chrono::Utc;
use engine_core::{backoff, EnqueueOpts, EnqueueResult, Job, JobState, JobStore, Outcome, OutcomeClass, QueueStats};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

struct State {
    jobs: HashMap<i64, Job>,
    next_id: i64,
}

/// Cloneable handle over a shared in-memory job table.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: std::sync::Arc<Mutex<State>>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: std::sync::Arc::new(Mutex::new(State {
                jobs: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Snapshot all jobs, for assertions in property tests
    /// (e.g. "pending + leased + done + dead remains constant").
    pub fn all_jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }
}

fn is_claimable(job: &Job, now: chrono::DateTime<Utc>) -> bool {
    match job.state {
        JobState::Pending => job.available_at <= now,
        JobState::Leased => job.lease_expires_at.map(|d| d < now).unwrap_or(false),
        JobState::Done | JobState::Dead => false,
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, opts: EnqueueOpts) -> anyhow::Result<EnqueueResult> {
        let mut state = self.state.lock().unwrap();
        let dup = state
            .jobs
            .values()
            .any(|j| j.key == opts.key && !j.state.is_terminal());
        if dup {
            return Ok(EnqueueResult::Deduped);
        }

        let now = Utc::now();
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(
            id,
            Job {
                id,
                job_type: opts.job_type,
                key: opts.key,
                priority: opts.priority,
                payload: opts.payload,
                state: JobState::Pending,
                attempts: 0,
                max_attempts: opts.max_attempts,
                lease_owner: None,
                lease_expires_at: None,
                available_at: now,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(EnqueueResult::Ok)
    }

    async fn claim(&self, owner: &str, lease_duration: Duration, limit: i64) -> anyhow::Result<Vec<Job>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let mut ids: Vec<i64> = state
            .jobs
            .values()
            .filter(|j| is_claimable(j, now))
            .map(|j| j.id)
            .collect();
        // priority DESC, available_at ASC, id ASC
        ids.sort_by(|a, b| {
            let ja = &state.jobs[a];
            let jb = &state.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.available_at.cmp(&jb.available_at))
                .then(ja.id.cmp(&jb.id))
        });
        ids.truncate(limit.max(0) as usize);

        let lease_expires_at = now + chrono::Duration::from_std(lease_duration)?;
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let job = state.jobs.get_mut(&id).unwrap();
            job.state = JobState::Leased;
            job.lease_owner = Some(owner.to_string());
            job.lease_expires_at = Some(lease_expires_at);
            job.attempts += 1;
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn release(&self, id: i64, outcome: &Outcome) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("no such job {id}"))?;

        match outcome.class {
            OutcomeClass::Ok => {
                job.state = JobState::Done;
            }
            OutcomeClass::Permanent => {
                job.state = JobState::Dead;
                job.last_error = outcome.error.clone();
            }
            OutcomeClass::Transient => {
                if job.attempts < job.max_attempts {
                    job.state = JobState::Pending;
                    job.lease_owner = None;
                    job.lease_expires_at = None;
                    job.available_at = now
                        + chrono::Duration::from_std(backoff(
                            job.attempts,
                            Duration::from_secs(1),
                            Duration::from_secs(30),
                        ))?;
                    job.last_error = outcome.error.clone();
                } else {
                    job.state = JobState::Dead;
                    job.last_error = outcome.error.clone();
                }
            }
        }
        job.updated_at = now;
        Ok(())
    }

    async fn heartbeat(&self, id: i64, owner: &str, extension: Duration) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(());
        };
        if job.state == JobState::Leased && job.lease_owner.as_deref() == Some(owner) {
            job.lease_expires_at = Some(Utc::now() + chrono::Duration::from_std(extension)?);
        }
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<QueueStats> {
        let state = self.state.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Leased => stats.leased += 1,
                JobState::Done => stats.done += 1,
                JobState::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_matches_sqlite_store_semantics() {
        let store = InMemoryJobStore::new();
        let opts = EnqueueOpts::new("t", "k", b"x".to_vec());
        assert_eq!(store.enqueue(opts.clone()).await.unwrap(), EnqueueResult::Ok);
        assert_eq!(store.enqueue(opts).await.unwrap(), EnqueueResult::Deduped);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        store.enqueue(EnqueueOpts::new("t", "low", b"".to_vec()).with_priority(1)).await.unwrap();
        store.enqueue(EnqueueOpts::new("t", "high", b"".to_vec()).with_priority(10)).await.unwrap();

        let claimed = store.claim("owner", Duration::from_secs(30), 10).await.unwrap();
        assert_eq!(claimed[0].key, "high");
        assert_eq!(claimed[1].key, "low");
    }

    #[tokio::test]
    async fn conservation_of_jobs_across_claim_and_release() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.enqueue(EnqueueOpts::new("t", format!("k{i}"), b"".to_vec())).await.unwrap();
        }
        let claimed = store.claim("owner", Duration::from_secs(30), 10).await.unwrap();
        for (i, job) in claimed.iter().enumerate() {
            let outcome = if i % 2 == 0 {
                Outcome::ok(Duration::ZERO)
            } else {
                Outcome::permanent("nope", Duration::ZERO)
            };
            store.release(job.id, &outcome).await.unwrap();
        }
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending + stats.leased + stats.done + stats.dead, 5);
    }
}
