//! OVN object-store contract — spec.md §4.6.
//!
//! `OvnClient` is deliberately thin: the OVSDB wire protocol is an explicit
//! Non-goal, so this crate only needs a typed `Get`/`List`/`Transact`
//! surface plus the `nb_cfg`/`sb_cfg`/`hv_cfg` wait convention. A real
//! binary wires this to `libovsdb`-style bindings; tests and the rest of
//! this crate use [`InMemoryOvnClient`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lxdovn_types::{CoreError, CoreResult};
use serde_json::Value;

/// Idempotence mode for a single create/update within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MayExist {
    /// Fail if the row already exists.
    MustNotExist,
    /// Create if absent, otherwise update in place.
    CreateOrUpdate,
}

#[derive(Debug, Clone)]
pub enum TransactOp {
    Upsert {
        kind: String,
        name: String,
        fields: BTreeMap<String, Value>,
        mode: MayExist,
    },
    Delete {
        kind: String,
        name: String,
    },
}

impl TransactOp {
    pub fn upsert(kind: impl Into<String>, name: impl Into<String>, mode: MayExist) -> Self {
        TransactOp::Upsert {
            kind: kind.into(),
            name: name.into(),
            fields: BTreeMap::new(),
            mode,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let TransactOp::Upsert { fields, .. } = &mut self {
            fields.insert(key.into(), value.into());
        }
        self
    }

    pub fn delete(kind: impl Into<String>, name: impl Into<String>) -> Self {
        TransactOp::Delete {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Which acknowledgement a transaction should block for before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    #[default]
    None,
    SouthboundApplied,
    HypervisorsApplied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalObject {
    pub kind: String,
    pub name: String,
    pub fields: BTreeMap<String, Value>,
}

/// Typed object-store client (spec.md §4.6). A single mutable
/// `"global"` row carries the cfg counters a caller can wait on.
#[async_trait]
pub trait OvnClient: Send + Sync {
    async fn get(&self, kind: &str, name: &str) -> CoreResult<Option<LogicalObject>>;
    async fn list(&self, kind: &str) -> CoreResult<Vec<LogicalObject>>;
    async fn transact(&self, ops: Vec<TransactOp>, wait: WaitMode) -> CoreResult<()>;
}

/// In-memory fake. Every transaction bumps `nb_cfg`; since there is no
/// real southbound/hypervisor pipeline to wait on, `sb_cfg`/`hv_cfg` are
/// advanced to match immediately after the row mutation, so a caller
/// requesting a wait mode observes the same ordering guarantee a real
/// client would provide without actually blocking.
#[derive(Default)]
pub struct InMemoryOvnClient {
    rows: DashMap<(String, String), LogicalObject>,
    nb_cfg: AtomicU64,
    sb_cfg: AtomicU64,
    hv_cfg: AtomicU64,
}

impl InMemoryOvnClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nb_cfg(&self) -> u64 {
        self.nb_cfg.load(Ordering::SeqCst)
    }

    pub fn sb_cfg(&self) -> u64 {
        self.sb_cfg.load(Ordering::SeqCst)
    }

    pub fn hv_cfg(&self) -> u64 {
        self.hv_cfg.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OvnClient for InMemoryOvnClient {
    async fn get(&self, kind: &str, name: &str) -> CoreResult<Option<LogicalObject>> {
        Ok(self
            .rows
            .get(&(kind.to_string(), name.to_string()))
            .map(|r| r.clone()))
    }

    async fn list(&self, kind: &str) -> CoreResult<Vec<LogicalObject>> {
        Ok(self
            .rows
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn transact(&self, ops: Vec<TransactOp>, wait: WaitMode) -> CoreResult<()> {
        for op in ops {
            match op {
                TransactOp::Upsert {
                    kind,
                    name,
                    fields,
                    mode,
                } => {
                    let key = (kind.clone(), name.clone());
                    if mode == MayExist::MustNotExist && self.rows.contains_key(&key) {
                        return Err(CoreError::conflict(format!(
                            "{kind} {name} already exists"
                        )));
                    }
                    self.rows
                        .entry(key)
                        .and_modify(|row| row.fields.extend(fields.clone()))
                        .or_insert_with(|| LogicalObject { kind, name, fields });
                }
                TransactOp::Delete { kind, name } => {
                    self.rows.remove(&(kind, name));
                }
            }
        }

        let nb = self.nb_cfg.fetch_add(1, Ordering::SeqCst) + 1;
        self.sb_cfg.store(nb, Ordering::SeqCst);
        self.hv_cfg.store(nb, Ordering::SeqCst);

        match wait {
            WaitMode::None => {}
            WaitMode::SouthboundApplied => {
                while self.sb_cfg() < nb {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            WaitMode::HypervisorsApplied => {
                while self.hv_cfg() < nb {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn must_not_exist_conflicts_on_duplicate_create() {
        let client = InMemoryOvnClient::new();
        client
            .transact(
                vec![TransactOp::upsert(
                    "Logical_Router",
                    "lr-1",
                    MayExist::MustNotExist,
                )],
                WaitMode::None,
            )
            .await
            .unwrap();

        let err = client
            .transact(
                vec![TransactOp::upsert(
                    "Logical_Router",
                    "lr-1",
                    MayExist::MustNotExist,
                )],
                WaitMode::None,
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn create_or_update_is_idempotent() {
        let client = InMemoryOvnClient::new();
        for _ in 0..3 {
            client
                .transact(
                    vec![TransactOp::upsert(
                        "Logical_Router",
                        "lr-1",
                        MayExist::CreateOrUpdate,
                    )
                    .with_field("mac", "00:00:00:00:00:01")],
                    WaitMode::None,
                )
                .await
                .unwrap();
        }
        assert_eq!(client.list("Logical_Router").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_mode_observes_bumped_counters() {
        let client = InMemoryOvnClient::new();
        client
            .transact(
                vec![TransactOp::upsert(
                    "Logical_Router",
                    "lr-1",
                    MayExist::CreateOrUpdate,
                )],
                WaitMode::HypervisorsApplied,
            )
            .await
            .unwrap();
        assert_eq!(client.hv_cfg(), client.nb_cfg());
    }
}
