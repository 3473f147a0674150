//! IdentityCache — spec.md §4.3.
//!
//! `GetSecret`/`GetByOIDCSubject` are the only two lookups AuthFront needs.
//! The cache itself is read-mostly: one writer calls `reload` when upstream
//! identity policy changes, many readers call the getters concurrently —
//! spec.md §5 names this as one of the two justified pieces of global
//! mutable state.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lxdovn_types::{CoreError, CoreResult};

/// `(kind, identifier, name, shared_secret?)` from spec.md §3. `kind`
/// distinguishes certificate identities from OIDC identities from
/// devlxd/guest identities; `shared_secret` is only set for kinds that
/// authenticate via a symmetric bearer token (§4.2's client token path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub kind: String,
    pub identifier: String,
    pub name: String,
    pub shared_secret: Option<Vec<u8>>,
    pub oidc_subject: Option<String>,
}

#[async_trait]
pub trait IdentityCache: Send + Sync {
    async fn get_secret(&self, identifier: &str) -> CoreResult<Vec<u8>>;
    async fn get_by_oidc_subject(&self, subject: &str) -> CoreResult<Identity>;
    async fn get_by_identifier(&self, identifier: &str) -> CoreResult<Identity>;
}

/// Reloaded wholesale rather than patched incrementally — the lifecycle is
/// external (spec.md §3 "Lifecycle external"), so the cache never mutates
/// an entry on its own, only swaps the whole table on `reload`.
#[derive(Default)]
pub struct InMemoryIdentityCache {
    by_identifier: DashMap<String, Identity>,
    by_oidc_subject: DashMap<String, Identity>,
}

impl InMemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reload(&self, identities: Vec<Identity>) {
        self.by_identifier.clear();
        self.by_oidc_subject.clear();
        for identity in identities {
            if let Some(subject) = &identity.oidc_subject {
                self.by_oidc_subject
                    .insert(subject.clone(), identity.clone());
            }
            self.by_identifier
                .insert(identity.identifier.clone(), identity);
        }
    }
}

#[async_trait]
impl IdentityCache for InMemoryIdentityCache {
    async fn get_secret(&self, identifier: &str) -> CoreResult<Vec<u8>> {
        self.by_identifier
            .get(identifier)
            .and_then(|entry| entry.shared_secret.clone())
            .ok_or_else(|| CoreError::not_found(format!("no shared secret for {identifier}")))
    }

    async fn get_by_oidc_subject(&self, subject: &str) -> CoreResult<Identity> {
        self.by_oidc_subject
            .get(subject)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::not_found(format!("no identity for oidc subject {subject}")))
    }

    async fn get_by_identifier(&self, identifier: &str) -> CoreResult<Identity> {
        self.by_identifier
            .get(identifier)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::not_found(format!("no identity {identifier}")))
    }
}

/// Convenience constructor used by tests and by the bootstrap binary's
/// initial load before the first external reload arrives.
pub fn seed(identities: impl IntoIterator<Item = Identity>) -> Arc<InMemoryIdentityCache> {
    let cache = Arc::new(InMemoryIdentityCache::new());
    cache.reload(identities.into_iter().collect::<Vec<_>>());
    cache
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(identifier: &str, secret: Option<&str>, subject: Option<&str>) -> Identity {
        Identity {
            kind: "certificate".into(),
            identifier: identifier.into(),
            name: format!("name-{identifier}"),
            shared_secret: secret.map(|s| s.as_bytes().to_vec()),
            oidc_subject: subject.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn looks_up_secret_by_identifier() {
        let cache = seed([identity("fp:abc", Some("s3cr3t"), None)]);
        assert_eq!(cache.get_secret("fp:abc").await.unwrap(), b"s3cr3t");
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let cache = seed([identity("fp:abc", None, None)]);
        assert!(matches!(
            cache.get_secret("fp:abc").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            cache.get_secret("nope").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn looks_up_by_oidc_subject() {
        let cache = seed([identity("user:alice", None, Some("sub-1"))]);
        let identity = cache.get_by_oidc_subject("sub-1").await.unwrap();
        assert_eq!(identity.identifier, "user:alice");
    }

    #[tokio::test]
    async fn reload_replaces_the_whole_table() {
        let cache = InMemoryIdentityCache::new();
        cache.reload(vec![identity("fp:a", Some("x"), None)]);
        assert!(cache.get_secret("fp:a").await.is_ok());
        cache.reload(vec![identity("fp:b", Some("y"), None)]);
        assert!(matches!(
            cache.get_secret("fp:a").await,
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(cache.get_secret("fp:b").await.unwrap(), b"y");
    }
}
