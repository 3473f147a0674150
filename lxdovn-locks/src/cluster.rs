//! Cluster-wide named locking — spec.md §4.5.
//!
//! Layered on [`crate::named::NamedLocks`] plus a distributed "Operation"
//! primitive, abstracted here as [`ClusterOperations`] so the retry/poll
//! logic is testable against an in-memory fake (spec.md §6, "external
//! interfaces" licenses a contract-only trait the same way `ClusterDb` and
//! `OvnClient` are contract-only).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lxdovn_types::{CoreError, CoreResult};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::named::{Cancelled, NamedLocks};

/// A running cluster operation, as created by [`ClusterOperations::create`].
/// The run-function behind it blocks until either the release channel or
/// the handle's own cancellation fires.
pub struct OperationHandle {
    pub id: Uuid,
    release: oneshot::Sender<()>,
}

impl OperationHandle {
    /// Ends the operation's run-function, which in turn drops the local
    /// `NamedLocks` guard it is holding.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// Outcome of attempting to create the well-known `"ClusterLock"` operation
/// for a given name.
pub enum CreateOutcome {
    Created(OperationHandle),
    /// A peer already holds the lock; the caller should wait for the
    /// operation named `uuid_v5(nil, name)` to finish, then retry.
    Conflict,
}

/// Contract for the cluster-operations collaborator (spec.md §6).
#[async_trait]
pub trait ClusterOperations: Send + Sync {
    /// Attempts to create and start the well-known `"ClusterLock"`
    /// operation named `name`. Returns `Conflict` if a peer already holds
    /// an operation of that name; any other failure is fatal and should be
    /// propagated as `CoreError::Transient` or `CoreError::Fatal`.
    async fn create(&self, name: &str) -> CoreResult<CreateOutcome>;

    /// Blocks until the operation identified by `uuid_v5(nil, name)`
    /// finishes on some cluster member, bounded by a poll interval and an
    /// overall deadline carried by `cancel`.
    async fn wait_for_completion(&self, name: &str, cancel: &CancellationToken) -> CoreResult<()>;
}

/// Single-process in-memory fake. Operations it creates complete
/// immediately once released; `wait_for_completion` polls a shared map.
#[derive(Default)]
pub struct InMemoryClusterOperations {
    held: Arc<parking_lot::Mutex<std::collections::HashSet<String>>>,
}

impl InMemoryClusterOperations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ClusterOperations for InMemoryClusterOperations {
    async fn create(&self, name: &str) -> CoreResult<CreateOutcome> {
        let mut held = self.held.lock();
        if held.contains(name) {
            return Ok(CreateOutcome::Conflict);
        }
        held.insert(name.to_string());
        drop(held);

        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v5(&Uuid::nil(), name.as_bytes());
        let held_set = self.held.clone();
        let name_owned = name.to_string();
        tokio::spawn(async move {
            let _ = rx.await;
            held_set.lock().remove(&name_owned);
        });

        Ok(CreateOutcome::Created(OperationHandle { id, release: tx }))
    }

    async fn wait_for_completion(&self, name: &str, cancel: &CancellationToken) -> CoreResult<()> {
        loop {
            if !self.held.lock().contains(name) {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(20)) => continue,
                _ = cancel.cancelled() => return Err(CoreError::Transient(
                    "timed out waiting for cluster lock operation to finish".into(),
                )),
            }
        }
    }
}

/// `ClusterLocks` degrades to plain `NamedLocks` when `clustered=false`,
/// and otherwise layers the distributed operation on top as described in
/// spec.md §4.5.
pub struct ClusterLocks {
    named: Arc<NamedLocks>,
    ops: Option<Arc<dyn ClusterOperations>>,
}

pub enum ClusterLock {
    Local(crate::named::Lock),
    Distributed {
        local: crate::named::Lock,
        operation: OperationHandle,
    },
}

impl ClusterLock {
    pub fn unlock(self) {
        match self {
            ClusterLock::Local(l) => l.unlock(),
            ClusterLock::Distributed { local, operation } => {
                operation.release();
                local.unlock();
            }
        }
    }
}

impl ClusterLocks {
    pub fn new(named: Arc<NamedLocks>, ops: Option<Arc<dyn ClusterOperations>>) -> Self {
        Self { named, ops }
    }

    /// `ClusterLock(ctx, s, name) -> unlock`.
    pub async fn lock(&self, name: &str, cancel: &CancellationToken) -> CoreResult<ClusterLock> {
        let local = self
            .named
            .lock(name, cancel)
            .await
            .map_err(|Cancelled| CoreError::Transient("lock wait cancelled".into()))?;

        let Some(ops) = &self.ops else {
            return Ok(ClusterLock::Local(local));
        };

        loop {
            match ops.create(name).await? {
                CreateOutcome::Created(operation) => {
                    return Ok(ClusterLock::Distributed { local, operation });
                }
                CreateOutcome::Conflict => {
                    ops.wait_for_completion(name, cancel).await?;
                    // retry create — the peer's operation finished, the
                    // name may now be free.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_clustered_degrades_to_named_lock() {
        let named = NamedLocks::new();
        let locks = ClusterLocks::new(named, None);
        let cancel = CancellationToken::new();
        let lock = locks.lock("net.ovn.uplink0", &cancel).await.unwrap();
        lock.unlock();
    }

    #[tokio::test]
    async fn clustered_lock_acquires_and_releases_operation() {
        let named = NamedLocks::new();
        let ops = InMemoryClusterOperations::new();
        let locks = ClusterLocks::new(named, Some(ops));
        let cancel = CancellationToken::new();
        let lock = locks.lock("net.ovn.uplink0", &cancel).await.unwrap();
        match &lock {
            ClusterLock::Distributed { .. } => {}
            ClusterLock::Local(_) => panic!("expected a distributed lock"),
        }
        lock.unlock();
    }

    #[tokio::test]
    async fn second_caller_waits_for_peer_operation_then_acquires() {
        let named = NamedLocks::new();
        let ops = InMemoryClusterOperations::new();
        let locks = Arc::new(ClusterLocks::new(named, Some(ops)));
        let cancel = CancellationToken::new();

        let first = locks.lock("net.ovn.uplink0", &cancel).await.unwrap();

        let locks2 = locks.clone();
        let cancel2 = CancellationToken::new();
        let handle =
            tokio::spawn(async move { locks2.lock("net.ovn.uplink0", &cancel2).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        first.unlock();
        let second = handle.await.unwrap().unwrap();
        second.unlock();
    }
}
