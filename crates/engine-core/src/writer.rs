//! Transactional micro-batch writer serializing warehouse writes
//! (spec.md S4.5).
//!
//! The warehouse store has exactly one writer, by construction: every
//! [`WriteOp`] submitted here runs inside a batch transaction driven by a
//! single background task, never concurrently with another op. Batching
//! amortizes transaction overhead across many small handler writes while
//! giving each caller an awaitable per-op completion.
//!
//! `engine-core` only defines the generic contract (parameterized over a
//! [`Transactor`]'s transaction-handle type); `engine-warehouse-sqlite`
//! supplies the SQLite `Transactor` and the concrete write-op
//! constructors, and `engine-testing` supplies an in-memory one for tests
//! — the same split the teacher draws between its coordination crate and
//! `seesaw-outbox`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// A function-shaped unit of work taking a warehouse transaction handle.
/// Invoked exactly once, inside a batched transaction, in submission
/// order relative to the rest of its batch.
pub type WriteOp<Tx> =
    Box<dyn for<'a> FnOnce(&'a mut Tx) -> BoxFuture<'a, anyhow::Result<()>> + Send>;

/// Opens and commits the transactions [`TxBatchWriter`] batches ops into.
/// Implemented once per backing store (SQLite in production, an
/// in-memory recorder in tests).
#[async_trait]
pub trait Transactor: Send + Sync + 'static {
    type Tx: Send;

    async fn begin(&self) -> anyhow::Result<Self::Tx>;
    /// Commit. On `Err`, the implementation must guarantee no op's
    /// effects became visible (sqlx transactions roll back on drop
    /// without an explicit commit, which callers rely on here).
    async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Flush once this many ops are pending.
    pub batch_size: usize,
    /// Flush once the oldest pending op has waited this long.
    pub flush_interval: Duration,
    /// Bound on the in-flight submission channel; `submit` blocks once
    /// full, coupling handler throughput to warehouse write throughput.
    pub channel_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_millis(75),
            channel_capacity: 512,
        }
    }
}

struct Envelope<Tx> {
    op: WriteOp<Tx>,
    ack: oneshot::Sender<anyhow::Result<()>>,
}

/// Handle returned by [`TxBatchWriter::submit`]. Await it to learn
/// whether the op's batch committed.
pub struct Completion {
    rx: oneshot::Receiver<anyhow::Result<()>>,
}

impl Completion {
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("tx batch writer shut down before this op was acked"),
        }
    }
}

/// Serializes warehouse writes into micro-batched transactions.
pub struct TxBatchWriter<T: Transactor> {
    sender: mpsc::Sender<Envelope<T::Tx>>,
    worker: tokio::task::JoinHandle<()>,
}

impl<T: Transactor> TxBatchWriter<T> {
    pub fn new(transactor: T, config: BatchConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let worker = tokio::spawn(run_batches(transactor, receiver, config));
        Self { sender, worker }
    }

    /// Enqueue a write op; returns a handle the caller can await for
    /// error/ack. Blocks when the internal pending buffer is full.
    pub async fn submit(&self, op: WriteOp<T::Tx>) -> Completion {
        let (ack, rx) = oneshot::channel();
        let envelope = Envelope { op, ack };
        if self.sender.send(envelope).await.is_err() {
            // Writer task has exited; resolve immediately with an error
            // rather than hang the caller forever.
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(anyhow::anyhow!("tx batch writer is closed")));
            return Completion { rx };
        }
        Completion { rx }
    }

    /// Drains pending ops, commits the final partial batch, and returns.
    pub async fn close(self) {
        drop(self.sender);
        if let Err(err) = self.worker.await {
            error!(?err, "tx batch writer task panicked");
        }
    }
}

async fn run_batches<T: Transactor>(
    transactor: T,
    mut receiver: mpsc::Receiver<Envelope<T::Tx>>,
    config: BatchConfig,
) {
    let mut pending: Vec<Envelope<T::Tx>> = Vec::with_capacity(config.batch_size);
    loop {
        let timed_out = if pending.is_empty() {
            match receiver.recv().await {
                Some(envelope) => {
                    pending.push(envelope);
                    false
                }
                None => break,
            }
        } else {
            tokio::select! {
                biased;
                maybe_envelope = receiver.recv() => {
                    match maybe_envelope {
                        Some(envelope) => {
                            pending.push(envelope);
                            false
                        }
                        None => true, // channel closed: flush what we have, then exit
                    }
                }
                _ = tokio::time::sleep(config.flush_interval) => true,
            }
        };

        let channel_closed = receiver.is_closed() && pending.is_empty();
        if channel_closed {
            break;
        }

        let should_flush = timed_out || pending.len() >= config.batch_size;
        if should_flush && !pending.is_empty() {
            flush(&transactor, std::mem::take(&mut pending)).await;
        }

        if receiver.is_closed() {
            // Drain whatever arrived in the interim, then exit.
            while let Ok(envelope) = receiver.try_recv() {
                pending.push(envelope);
            }
            if !pending.is_empty() {
                flush(&transactor, std::mem::take(&mut pending)).await;
            }
            break;
        }
    }
    debug!("tx batch writer drained and exiting");
}

async fn flush<T: Transactor>(transactor: &T, batch: Vec<Envelope<T::Tx>>) {
    let n = batch.len();
    let (ops, acks): (Vec<_>, Vec<_>) = batch.into_iter().map(|e| (e.op, e.ack)).unzip();

    let result = run_one_batch(transactor, ops).await;
    match &result {
        Ok(()) => debug!(batch_size = n, "tx batch committed"),
        Err(err) => warn!(batch_size = n, %err, "tx batch rolled back"),
    }

    for ack in acks {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!("{err}")),
        };
        let _ = ack.send(reply);
    }
}

async fn run_one_batch<T: Transactor>(
    transactor: &T,
    ops: Vec<WriteOp<T::Tx>>,
) -> anyhow::Result<()> {
    let mut tx = transactor.begin().await?;
    for op in ops {
        // A panicking op must fail only its batch, not take down the
        // writer task: the next op's fate (and every later submitter's)
        // can't hinge on one caller's bug. Isolated the same way
        // `engine.rs` isolates handler panics.
        match AssertUnwindSafe(op(&mut tx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(panic) => anyhow::bail!("write op panicked: {}", panic_message(panic.as_ref())),
        }
    }
    transactor.commit(tx).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct CountingTransactor {
        committed_ops: Arc<AtomicUsize>,
        fail_next: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Transactor for CountingTransactor {
        type Tx = Vec<u32>;

        async fn begin(&self) -> anyhow::Result<Self::Tx> {
            Ok(Vec::new())
        }

        async fn commit(&self, tx: Self::Tx) -> anyhow::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("simulated commit failure");
            }
            self.committed_ops.fetch_add(tx.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn push_op(n: u32) -> WriteOp<Vec<u32>> {
        Box::new(move |tx: &mut Vec<u32>| {
            Box::pin(async move {
                tx.push(n);
                Ok(())
            })
        })
    }

    fn panicking_op() -> WriteOp<Vec<u32>> {
        Box::new(move |_tx: &mut Vec<u32>| Box::pin(async move { panic!("boom") }))
    }

    #[tokio::test]
    async fn batch_flushes_at_batch_size() {
        let transactor = CountingTransactor::default();
        let committed = transactor.committed_ops.clone();
        let writer = TxBatchWriter::new(
            transactor,
            BatchConfig {
                batch_size: 3,
                flush_interval: Duration::from_secs(60),
                channel_capacity: 16,
            },
        );

        let mut completions = Vec::new();
        for i in 0..3 {
            completions.push(writer.submit(push_op(i)).await);
        }
        for c in completions {
            c.wait().await.unwrap();
        }
        assert_eq!(committed.load(Ordering::SeqCst), 3);
        writer.close().await;
    }

    #[tokio::test]
    async fn batch_flushes_on_flush_interval() {
        let transactor = CountingTransactor::default();
        let committed = transactor.committed_ops.clone();
        let writer = TxBatchWriter::new(
            transactor,
            BatchConfig {
                batch_size: 100,
                flush_interval: Duration::from_millis(20),
                channel_capacity: 16,
            },
        );

        let completion = writer.submit(push_op(1)).await;
        completion.wait().await.unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        writer.close().await;
    }

    #[tokio::test]
    async fn failed_commit_fails_every_op_in_the_batch() {
        let transactor = CountingTransactor::default();
        transactor.fail_next.store(true, Ordering::SeqCst);
        let writer = TxBatchWriter::new(
            transactor,
            BatchConfig {
                batch_size: 2,
                flush_interval: Duration::from_secs(60),
                channel_capacity: 16,
            },
        );

        let a = writer.submit(push_op(1)).await;
        let b = writer.submit(push_op(2)).await;
        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
        writer.close().await;
    }

    #[tokio::test]
    async fn panicking_op_fails_its_batch_without_killing_the_writer() {
        let transactor = CountingTransactor::default();
        let committed = transactor.committed_ops.clone();
        let writer = TxBatchWriter::new(
            transactor,
            BatchConfig {
                batch_size: 2,
                flush_interval: Duration::from_secs(60),
                channel_capacity: 16,
            },
        );

        let a = writer.submit(panicking_op()).await;
        let b = writer.submit(push_op(1)).await;
        assert!(a.wait().await.is_err());
        assert!(b.wait().await.is_err());
        assert_eq!(committed.load(Ordering::SeqCst), 0);

        // The writer task must still be alive: a later op still commits.
        let c = writer.submit(push_op(2)).await;
        writer.close().await;
        c.wait().await.unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_flushes_a_final_partial_batch() {
        let transactor = CountingTransactor::default();
        let committed = transactor.committed_ops.clone();
        let writer = TxBatchWriter::new(
            transactor,
            BatchConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(60),
                channel_capacity: 16,
            },
        );

        let completion = writer.submit(push_op(7)).await;
        writer.close().await;
        completion.wait().await.unwrap();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }
}
