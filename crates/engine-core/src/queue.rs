//! The durable job queue interface (spec.md S4.1).
//!
//! `engine-core` only defines the contract; `engine-queue-sqlite` provides
//! the concrete SQLite-backed implementation, the same split the teacher
//! uses between its coordination crate and `seesaw-job-postgres`.

use crate::model::{EnqueueOpts, EnqueueResult, Job, Outcome, QueueStats};
use async_trait::async_trait;
use std::time::Duration;

/// Durable FIFO-by-priority queue with at-most-one-leaseholder jobs.
///
/// Implementations must uphold the invariants of spec.md S3: a job is
/// `leased` iff it has a non-null owner and a lease deadline in the
/// future; `Claim` atomically transitions exactly the rows it returns;
/// `attempts` never decreases; `done`/`dead` are absorbing.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a `pending` row, or return `Deduped` if `opts.key` already
    /// names a non-terminal row. One transaction.
    async fn enqueue(&self, opts: EnqueueOpts) -> anyhow::Result<EnqueueResult>;

    /// Atomically lease up to `limit` claimable rows (`pending` and due,
    /// or `leased` with an expired lease), ordered by
    /// `priority DESC, available_at ASC, id ASC`.
    async fn claim(&self, owner: &str, lease_duration: Duration, limit: i64)
        -> anyhow::Result<Vec<Job>>;

    /// Apply a handler's [`Outcome`] to the job: `ok` -> `done`;
    /// `transient` with attempts remaining -> `pending` with backoff;
    /// `transient` exhausted or `permanent` -> `dead`.
    async fn release(&self, id: i64, outcome: &Outcome) -> anyhow::Result<()>;

    /// Extend a held lease. A no-op (not an error) if the caller is no
    /// longer the lease owner — the job was already reclaimed by someone
    /// else, or released.
    async fn heartbeat(&self, id: i64, owner: &str, extension: Duration) -> anyhow::Result<()>;

    /// Point-in-time counts by state, for the engine's end-of-run stats
    /// block and operator inspection.
    async fn stats(&self) -> anyhow::Result<QueueStats>;
}
