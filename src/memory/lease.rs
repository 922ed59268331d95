//! Per-address mutual exclusion with a monotonically increasing lock tag and
//! timer-based auto-release.
//!
//! The tag advances on every successful acquire AND every successful release,
//! so a release carrying the tag of an already-expired lease observes a
//! mismatch and becomes a no-op. That single rule makes release idempotent
//! under retries and makes lease reaping safe against late releasers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

struct LockState {
    held: bool,
    ltag: u64,
}

/// Cooperative per-address lock. `acquire` suspends while another holder has
/// the lock; there is no FIFO guarantee, but every release wakes a waiter.
pub struct LeaseLock {
    state: Mutex<LockState>,
    freed: Notify,
}

impl LeaseLock {
    /// `seed_tag` comes from the process-wide clock captured at startup so
    /// tags from different runs do not collide within a run.
    pub fn new(seed_tag: u64) -> Self {
        Self {
            state: Mutex::new(LockState {
                held: false,
                ltag: seed_tag,
            }),
            freed: Notify::new(),
        }
    }

    /// Block until the lock is free, take it, and return the bumped tag.
    pub async fn acquire(&self) -> u64 {
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.held {
                    state.held = true;
                    state.ltag = state.ltag.wrapping_add(1);
                    return state.ltag;
                }
            }
            // A release between the check above and this await leaves a
            // stored permit, so the wakeup is not lost.
            self.freed.notified().await;
        }
    }

    /// Release only if `expected` is still the current tag. On success the
    /// tag is bumped again and one waiter is woken; on mismatch nothing
    /// changes. Returns `(released, current_tag)`.
    pub async fn release(&self, expected: u64) -> (bool, u64) {
        let mut state = self.state.lock().await;
        if state.held && state.ltag == expected {
            state.ltag = state.ltag.wrapping_add(1);
            state.held = false;
            self.freed.notify_one();
            (true, state.ltag)
        } else {
            (false, state.ltag)
        }
    }

    /// Current tag without touching the lock.
    pub async fn tag(&self) -> u64 {
        self.state.lock().await.ltag
    }

    /// Arm the lease timer: after `lease`, release the lock only if the tag
    /// from the acquire is still current.
    pub fn schedule_release(lock: &Arc<Self>, ltag: u64, lease: Duration) {
        let lock = Arc::clone(lock);
        tokio::spawn(async move {
            tokio::time::sleep(lease).await;
            let (released, tag) = lock.release(ltag).await;
            if released {
                debug!(ltag, tag, "lease expired, lock reclaimed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_each_bump_the_tag() {
        let lock = LeaseLock::new(100);
        let t1 = lock.acquire().await;
        assert_eq!(t1, 101);
        let (released, t2) = lock.release(t1).await;
        assert!(released);
        assert_eq!(t2, 102);

        let t3 = lock.acquire().await;
        assert!(t3 >= t1 + 2);
    }

    #[tokio::test]
    async fn stale_release_is_a_no_op() {
        let lock = LeaseLock::new(0);
        let t1 = lock.acquire().await;
        let (released, _) = lock.release(t1).await;
        assert!(released);

        let t2 = lock.acquire().await;
        // A replay of the first release must not disturb the current holder.
        let (released, current) = lock.release(t1).await;
        assert!(!released);
        assert_eq!(current, t2);

        let (released, _) = lock.release(t2).await;
        assert!(released);
    }

    #[tokio::test]
    async fn release_on_a_free_lock_fails() {
        let lock = LeaseLock::new(0);
        let current = lock.tag().await;
        let (released, tag) = lock.release(current).await;
        assert!(!released);
        assert_eq!(tag, current);
    }

    #[tokio::test]
    async fn waiter_wakes_after_release() {
        let lock = Arc::new(LeaseLock::new(0));
        let t1 = lock.acquire().await;

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lock.release(t1).await;
        let t2 = waiter.await.unwrap();
        assert_eq!(t2, t1 + 2);
    }

    #[tokio::test]
    async fn lease_timer_reclaims_an_abandoned_lock() {
        let lock = Arc::new(LeaseLock::new(0));
        let t1 = lock.acquire().await;
        LeaseLock::schedule_release(&lock, t1, Duration::from_millis(30));

        // The holder "fails silently"; a second acquirer gets the lock once
        // the lease fires, with a strictly greater tag.
        let t2 = lock.acquire().await;
        assert!(t2 > t1);

        // The original holder's late release is a no-op.
        let (released, current) = lock.release(t1).await;
        assert!(!released);
        assert_eq!(current, t2);
    }

    #[tokio::test]
    async fn lease_timer_leaves_a_reacquired_lock_alone() {
        let lock = Arc::new(LeaseLock::new(0));
        let t1 = lock.acquire().await;
        LeaseLock::schedule_release(&lock, t1, Duration::from_millis(40));

        // Release and re-acquire before the lease fires.
        lock.release(t1).await;
        let t2 = lock.acquire().await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        // The timer saw a bumped tag and did nothing.
        assert_eq!(lock.tag().await, t2);
        let (released, _) = lock.release(t2).await;
        assert!(released);
    }
}
