//! Dynamic cap on concurrent handler executions (spec.md S4.4).
//!
//! Built on `tokio::sync::Semaphore`, which only supports forgetting or
//! adding permits — there is no "shrink and wait for holders to give them
//! back" primitive. `SetCap` is implemented by tracking the cap we *want*
//! (`target_cap`) separately from the semaphore's actual total capacity
//! (`real_cap`, i.e. available permits plus permits currently held), and
//! reconciling: growing adds permits immediately (waking waiters);
//! shrinking forgets permits as they're released rather than all at once,
//! so current holders are never forcibly evicted and `real_cap` converges
//! to `target_cap` only as the in-flight work drains naturally. The
//! forget-vs-release decision at drop time compares `real_cap` to
//! `target_cap`, not the semaphore's `available_permits()` — a saturated
//! pool (`available == 0`) must still be able to shrink.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::cancellation::Cancellation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Cancelled,
}

struct Inner {
    semaphore: Semaphore,
    /// The cap the caller most recently asked for.
    target_cap: AtomicI64,
    /// The semaphore's actual total capacity right now: available permits
    /// plus permits currently held. May be temporarily out of sync with
    /// `target_cap` while a shrink is still draining.
    real_cap: AtomicI64,
}

/// A semaphore whose capacity can be resized live while permits are held.
#[derive(Clone)]
pub struct AdaptiveSemaphore {
    inner: Arc<Inner>,
}

/// RAII guard for one acquired slot. On drop, the permit returns to the
/// semaphore; if a shrink is still pending, the permit is forgotten
/// instead of released, which is how the cap actually comes down.
pub struct Permit<'a> {
    inner: Arc<Inner>,
    // `None` once forgotten (the shrink path consumed it).
    permit: Option<SemaphorePermit<'a>>,
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        // If real capacity is still above target, forget this permit
        // instead of returning it, shrinking the semaphore's real
        // capacity by one. This must hold even when the pool is fully
        // saturated (available_permits() == 0) — that's exactly when
        // shrinking matters.
        let target = self.inner.target_cap.load(Ordering::Relaxed);
        let real = self.inner.real_cap.load(Ordering::Relaxed);
        if real > target {
            permit.forget();
            self.inner.real_cap.fetch_sub(1, Ordering::Relaxed);
        }
        // else: default Drop impl of `permit` runs, releasing it back.
    }
}

impl AdaptiveSemaphore {
    pub fn new(initial_cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Semaphore::new(initial_cap),
                target_cap: AtomicI64::new(initial_cap as i64),
                real_cap: AtomicI64::new(initial_cap as i64),
            }),
        }
    }

    /// Block until a slot is free or `cancellation` fires.
    pub async fn acquire(&self, cancellation: &Cancellation) -> Result<Permit<'_>, AcquireOutcome> {
        match cancellation.race(self.inner.semaphore.acquire()).await {
            Some(Ok(permit)) => Ok(Permit {
                inner: self.inner.clone(),
                permit: Some(permit),
            }),
            Some(Err(_closed)) => Err(AcquireOutcome::Cancelled),
            None => Err(AcquireOutcome::Cancelled),
        }
    }

    /// Live resize. Growing adds permits immediately, waking blocked
    /// waiters. Shrinking does not forcibly evict current holders: it
    /// only lowers `target_cap`, and permits are forgotten as they're
    /// released (see [`Permit::drop`]) until `real_cap` converges,
    /// regardless of how many permits are currently held.
    pub fn set_cap(&self, new_cap: usize) {
        let new_cap = new_cap as i64;
        self.inner.target_cap.store(new_cap, Ordering::Relaxed);
        let real = self.inner.real_cap.load(Ordering::Relaxed);
        if new_cap > real {
            let added = new_cap - real;
            self.inner.semaphore.add_permits(added as usize);
            self.inner.real_cap.fetch_add(added, Ordering::Relaxed);
        }
        // Shrinks are lazy: nothing to do here but update target_cap; the
        // next `Permit::drop` calls will forget permits until `real_cap`
        // has come down to match.
    }

    pub fn cap(&self) -> usize {
        self.inner.target_cap.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_release_roundtrip() {
        let sem = AdaptiveSemaphore::new(2);
        let cancel = Cancellation::new();
        let a = sem.acquire(&cancel).await.unwrap();
        let b = sem.acquire(&cancel).await.unwrap();
        assert_eq!(sem.available_permits(), 0);
        drop(a);
        assert_eq!(sem.available_permits(), 1);
        drop(b);
        assert_eq!(sem.available_permits(), 2);
    }

    #[tokio::test]
    async fn growing_cap_wakes_waiters() {
        let sem = AdaptiveSemaphore::new(1);
        let cancel = Cancellation::new();
        let _a = sem.acquire(&cancel).await.unwrap();

        let sem2 = sem.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { sem2.acquire(&cancel2).await.is_ok() });

        tokio::time::sleep(Duration::from_millis(10)).await;
        sem.set_cap(2);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn shrinking_cap_drains_without_evicting_holders() {
        let sem = AdaptiveSemaphore::new(4);
        let cancel = Cancellation::new();
        let a = sem.acquire(&cancel).await.unwrap();
        let b = sem.acquire(&cancel).await.unwrap();
        let c = sem.acquire(&cancel).await.unwrap();
        let d = sem.acquire(&cancel).await.unwrap();

        sem.set_cap(1);
        // All four holders keep their permits; nothing is forcibly taken.
        assert_eq!(sem.available_permits(), 0);

        drop(a);
        drop(b);
        drop(c);
        // Three releases forgotten to come down from 4 to 1.
        assert_eq!(sem.available_permits(), 0);
        drop(d);
        // Fourth release returns the permit: now at target cap 1.
        assert_eq!(sem.available_permits(), 1);
        assert_eq!(sem.cap(), 1);
    }

    #[tokio::test]
    async fn shrink_drains_even_when_pool_is_fully_saturated() {
        // Reproduces spec.md S4.4/S8 scenario 5: all slots held (available
        // == 0) when a shrink is requested. The cap must still come down
        // as holders finish, not stay pinned because `available` never
        // rises above the old target in between.
        let sem = AdaptiveSemaphore::new(64);
        let cancel = Cancellation::new();
        let mut permits = Vec::new();
        for _ in 0..64 {
            permits.push(sem.acquire(&cancel).await.unwrap());
        }
        assert_eq!(sem.available_permits(), 0);

        sem.set_cap(44);
        for _ in 0..20 {
            drop(permits.pop().unwrap());
        }
        // Twenty holders released: all twenty forgotten to walk real
        // capacity down from 64 to 44; none come back as available.
        assert_eq!(sem.available_permits(), 0);
        assert_eq!(sem.cap(), 44);

        // The remaining 44 holders are still exactly at the new cap;
        // releasing one more now returns it for real.
        drop(permits.pop().unwrap());
        assert_eq!(sem.available_permits(), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_acquire() {
        let sem = AdaptiveSemaphore::new(1);
        let cancel = Cancellation::new();
        let _a = sem.acquire(&cancel).await.unwrap();
        cancel.cancel();
        assert_eq!(
            sem.acquire(&cancel).await.unwrap_err(),
            AcquireOutcome::Cancelled
        );
    }
}
