//! An in-memory [`Transactor`], for driving a [`TxBatchWriter`] in
//! engine/worker-pool tests without a SQLite database. Each transaction
//! is just a `Vec<String>` of labels; ops push a label to say they ran,
//! tests assert on what committed.

use async_trait::async_trait;
use engine_core::Transactor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every op label that has committed, across every flushed
/// batch, plus how many batches committed. `fail_next_commit` injects
/// exactly one commit failure, to exercise the writer's rollback path.
/// Cloneable (all state lives behind `Arc`s) so a test can hold a handle
/// after moving the original into a [`engine_core::TxBatchWriter`].
#[derive(Clone, Default)]
pub struct RecordingWarehouse {
    committed_labels: Arc<Mutex<Vec<String>>>,
    commit_count: Arc<AtomicUsize>,
    fail_next_commit: Arc<AtomicBool>,
}

impl RecordingWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_labels(&self) -> Vec<String> {
        self.committed_labels.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// The next `commit` call fails and rolls back; subsequent calls
    /// succeed again.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transactor for RecordingWarehouse {
    type Tx = Vec<String>;

    async fn begin(&self) -> anyhow::Result<Self::Tx> {
        Ok(Vec::new())
    }

    async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected commit failure");
        }
        self.committed_labels.lock().unwrap().extend(tx);
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Build a [`engine_core::WriteOp`] that records `label` as having run,
/// for tests that only care about ordering and commit/rollback, not
/// warehouse schema.
pub fn label_op(label: impl Into<String>) -> engine_core::WriteOp<Vec<String>> {
    let label = label.into();
    Box::new(move |tx: &mut Vec<String>| {
        Box::pin(async move {
            tx.push(label);
            Ok(())
        })
    })
}
