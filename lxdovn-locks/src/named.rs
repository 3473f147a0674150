//! Process-local named mutual exclusion — spec.md §4.4.
//!
//! Implementation model per spec: a `name -> waitChannel` map behind a
//! single mutex. Absence of a key means "free"; acquiring installs a
//! fresh channel, unlocking signals it so every waiter observes the
//! release. `tokio::sync::watch` stands in for the "never-closed channel
//! that gets closed on unlock" primitive: `unlock` sends on it explicitly
//! rather than relying on the sender being dropped, since a waiter parked
//! in `tokio::select!` holds its own clone of the `Arc<Slot>` (needed to
//! keep subscribing across retries) and so keeps the sender alive too.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("lock wait was cancelled")]
pub struct Cancelled;

struct Slot {
    release: watch::Sender<()>,
    /// Present only while the holder is in the "friendly" phase, i.e.
    /// between acquiring the lock and calling `unlock_friendly`.
    friendly: watch::Sender<bool>,
}

#[derive(Default)]
pub struct NamedLocks {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

/// Held by the caller that actually acquired the lock. Dropping it without
/// calling `unlock` is a bug — the lock never releases — so callers must
/// call `unlock` explicitly; there is no `Drop` impl, matching the
/// "deadlock is not prevented" model of the original.
pub struct Lock {
    name: String,
    locks: Arc<NamedLocks>,
    slot: Arc<Slot>,
}

impl Lock {
    pub fn unlock(self) {
        let mut slots = self.locks.slots.lock();
        slots.remove(&self.name);
        drop(slots);
        // Every waiter parked on `release.changed()` holds its own clone
        // of this `Arc<Slot>`, so dropping ours here would not close the
        // channel. Signal explicitly instead.
        let _ = self.slot.release.send(());
    }

    /// Releases only the "friendly" waiters: everyone currently blocked in
    /// `lock_friendly` for this name wakes with `friendly=true`. The
    /// caller still owns the lock and must call `unlock` separately.
    pub fn unlock_friendly(&self) {
        let _ = self.slot.friendly.send(true);
    }
}

/// Outcome of [`NamedLocks::lock_friendly`].
pub enum FriendlyOutcome {
    /// This caller acquired the lock itself.
    Holder(Lock),
    /// Another caller is holding the lock and has since called
    /// `unlock_friendly`; this caller performs no work of its own.
    Followed,
}

impl NamedLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// `Lock(ctx, name) -> unlock`.
    pub async fn lock(self: &Arc<Self>, name: &str, cancel: &CancellationToken) -> Result<Lock, Cancelled> {
        loop {
            let existing = {
                let mut slots = self.slots.lock();
                match slots.get(name) {
                    Some(slot) => Some(slot.clone()),
                    None => {
                        let (release, _rx) = watch::channel(());
                        let (friendly, _frx) = watch::channel(false);
                        let slot = Arc::new(Slot { release, friendly });
                        slots.insert(name.to_string(), slot.clone());
                        None
                    }
                }
            };

            match existing {
                None => {
                    let slots = self.slots.lock();
                    let slot = slots.get(name).expect("just inserted").clone();
                    drop(slots);
                    return Ok(Lock {
                        name: name.to_string(),
                        locks: self.clone(),
                        slot,
                    });
                }
                Some(slot) => {
                    let mut rx = slot.release.subscribe();
                    tokio::select! {
                        _ = rx.changed() => continue,
                        _ = cancel.cancelled() => return Err(Cancelled),
                    }
                }
            }
        }
    }

    /// `LockFriendly(ctx, name) -> (unlock, unlockFriendly, friendly)`.
    ///
    /// The first caller gets `FriendlyOutcome::Holder`; every caller that
    /// arrives while the lock is held waits for `unlock_friendly` (not for
    /// the full `unlock`) and returns `Followed`.
    pub async fn lock_friendly(
        self: &Arc<Self>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<FriendlyOutcome, Cancelled> {
        loop {
            let existing = {
                let mut slots = self.slots.lock();
                match slots.get(name) {
                    Some(slot) => Some(slot.clone()),
                    None => {
                        let (release, _rx) = watch::channel(());
                        let (friendly, _frx) = watch::channel(false);
                        let slot = Arc::new(Slot { release, friendly });
                        slots.insert(name.to_string(), slot.clone());
                        None
                    }
                }
            };

            match existing {
                None => {
                    let slots = self.slots.lock();
                    let slot = slots.get(name).expect("just inserted").clone();
                    drop(slots);
                    return Ok(FriendlyOutcome::Holder(Lock {
                        name: name.to_string(),
                        locks: self.clone(),
                        slot,
                    }));
                }
                Some(slot) => {
                    if *slot.friendly.borrow() {
                        return Ok(FriendlyOutcome::Followed);
                    }
                    let mut frx = slot.friendly.subscribe();
                    let mut rx = slot.release.subscribe();
                    tokio::select! {
                        res = frx.changed() => {
                            if res.is_ok() && *frx.borrow() {
                                return Ok(FriendlyOutcome::Followed);
                            }
                            // friendly sender dropped without firing: the
                            // holder unlocked outright. Retry for the slot.
                            continue;
                        }
                        _ = rx.changed() => continue,
                        _ = cancel.cancelled() => return Err(Cancelled),
                    }
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_then_unlock_allows_next_caller() {
        let locks = NamedLocks::new();
        let cancel = CancellationToken::new();
        let l1 = locks.lock("net.ovn.uplink0", &cancel).await.unwrap();
        l1.unlock();
        let l2 = locks.lock("net.ovn.uplink0", &cancel).await.unwrap();
        l2.unlock();
    }

    #[tokio::test]
    async fn second_locker_waits_for_unlock() {
        let locks = NamedLocks::new();
        let cancel = CancellationToken::new();
        let l1 = locks.lock("k", &cancel).await.unwrap();

        let locks2 = locks.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { locks2.lock("k", &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        l1.unlock();
        let l2 = handle.await.unwrap().unwrap();
        l2.unlock();
    }

    #[tokio::test]
    async fn cancelled_waiter_returns_error_without_side_effects() {
        let locks = NamedLocks::new();
        let cancel = CancellationToken::new();
        let l1 = locks.lock("k", &cancel).await.unwrap();

        let locks2 = locks.clone();
        let waiter_cancel = CancellationToken::new();
        let waiter_cancel2 = waiter_cancel.clone();
        let handle = tokio::spawn(async move { locks2.lock("k", &waiter_cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_err());
        l1.unlock();
    }

    #[tokio::test]
    async fn friendly_followers_return_together_after_unlock_friendly() {
        let locks = NamedLocks::new();
        let cancel = CancellationToken::new();

        let holder = match locks.lock_friendly("k", &cancel).await.unwrap() {
            FriendlyOutcome::Holder(l) => l,
            FriendlyOutcome::Followed => panic!("first caller must be holder"),
        };

        let mut followers = Vec::new();
        for _ in 0..3 {
            let locks2 = locks.clone();
            let cancel2 = cancel.clone();
            followers.push(tokio::spawn(async move {
                locks2.lock_friendly("k", &cancel2).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.unlock_friendly();

        for f in followers {
            match f.await.unwrap().unwrap() {
                FriendlyOutcome::Followed => {}
                FriendlyOutcome::Holder(_) => panic!("followers must not become holder"),
            }
        }
        holder.unlock();
    }

    #[tokio::test]
    async fn late_friendly_follower_sees_already_fired_signal() {
        let locks = NamedLocks::new();
        let cancel = CancellationToken::new();

        let holder = match locks.lock_friendly("k", &cancel).await.unwrap() {
            FriendlyOutcome::Holder(l) => l,
            FriendlyOutcome::Followed => unreachable!(),
        };
        holder.unlock_friendly();

        match locks.lock_friendly("k", &cancel).await.unwrap() {
            FriendlyOutcome::Followed => {}
            FriendlyOutcome::Holder(_) => panic!("lock is still held, must follow"),
        }
        holder.unlock();
    }
}
