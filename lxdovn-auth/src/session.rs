//! AuthSecret rotation and Session storage — spec.md §3, §4.14.
//!
//! `AuthSecretRing` is the ordered `(value, creation_time)` list: entry 0 is
//! newest, rotation prepends. A session token stays verifiable as long as
//! the secret that signed it is still somewhere in the ring — nothing here
//! ever removes an entry, that is an operator/retention decision outside
//! this core.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cookie::time::OffsetDateTime;
use cookie::{Cookie, SameSite};
use dashmap::DashMap;
use lxdovn_types::{CoreError, CoreResult};
use uuid::Uuid;

use crate::identity::Identity;

pub const SESSION_COOKIE_NAME: &str = "session";
pub const LOGIN_ID_COOKIE_NAME: &str = "login_id";

/// One entry in the rotation ring.
#[derive(Debug, Clone)]
pub struct AuthSecret {
    pub value: Vec<u8>,
    pub creation_time: DateTime<Utc>,
}

/// Newest-first list of signing secrets. `lxdovn-crypto::kdf` derives the
/// actual per-session key from whichever secret `signing_key_for` selects.
#[derive(Debug, Clone, Default)]
pub struct AuthSecretRing {
    secrets: Vec<AuthSecret>,
}

impl AuthSecretRing {
    pub fn new(initial: Vec<u8>, creation_time: DateTime<Utc>) -> Self {
        Self {
            secrets: vec![AuthSecret {
                value: initial,
                creation_time,
            }],
        }
    }

    /// Prepends a new head secret; every previously minted token remains
    /// verifiable because nothing here drops an existing entry.
    pub fn rotate(&mut self, value: Vec<u8>, creation_time: DateTime<Utc>) {
        self.secrets.insert(
            0,
            AuthSecret {
                value,
                creation_time,
            },
        );
    }

    pub fn head(&self) -> &AuthSecret {
        &self.secrets[0]
    }

    /// The newest secret whose `creation_time <= iat`, plus whether a
    /// strictly newer secret exists in the ring (spec.md §4.14 item 3's
    /// `staleSigningKey`).
    pub fn signing_key_for(&self, iat: DateTime<Utc>) -> CoreResult<(&AuthSecret, bool)> {
        for (index, secret) in self.secrets.iter().enumerate() {
            if secret.creation_time <= iat {
                return Ok((secret, index > 0));
            }
        }
        Err(CoreError::invalid_token())
    }
}

/// `(session_id uuid_v7, identity, tokens, expiry)` from spec.md §3. The
/// session id's embedded v7 timestamp is `iat`, so `AuthFront` can recover
/// which `AuthSecret` signed it without a second lookup.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub identity: Identity,
    pub token: String,
    pub expiry: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> CoreResult<()>;
    async fn get(&self, session_id: Uuid) -> CoreResult<Session>;
    async fn delete(&self, session_id: Uuid) -> CoreResult<()>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> CoreResult<()> {
        self.sessions.insert(session.session_id, session);
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> CoreResult<Session> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::not_found(format!("no session {session_id}")))
    }

    async fn delete(&self, session_id: Uuid) -> CoreResult<()> {
        self.sessions.remove(&session_id);
        Ok(())
    }
}

fn to_offset_date_time(at: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(at.timestamp()).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// `session` cookie per spec.md §6: HTTP-only, Secure, SameSite=Strict,
/// expiry = token expiry + 7 days, value = the session JWT.
pub fn build_session_cookie(token: String, token_expiry: DateTime<Utc>) -> Cookie<'static> {
    let expiry = token_expiry + chrono::Duration::days(7);
    Cookie::build((SESSION_COOKIE_NAME, token))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .path("/")
        .expires(to_offset_date_time(expiry))
        .build()
}

/// `login_id` cookie: HTTP-only, Secure, SameSite=Lax, value = a fresh
/// uuid v7 whose embedded timestamp identifies the `AuthSecretRing` entry
/// used to derive the securecookie key checked again on callback.
pub fn build_login_id_cookie(login_id: Uuid) -> Cookie<'static> {
    Cookie::build((LOGIN_ID_COOKIE_NAME, login_id.to_string()))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

pub fn expired_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .max_age(cookie::time::Duration::ZERO)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn signing_key_for_picks_newest_secret_not_newer_than_iat() {
        let mut ring = AuthSecretRing::new(b"s0".to_vec(), at(0));
        ring.rotate(b"s1".to_vec(), at(1800));
        // Before the rotation: only s0 qualifies, and it's the oldest entry
        // so nothing newer exists yet relative to this iat.
        let (secret, stale) = ring.signing_key_for(at(0)).unwrap();
        assert_eq!(secret.value, b"s0");
        assert!(!stale);
    }

    #[test]
    fn signing_key_for_reports_stale_when_a_newer_secret_exists() {
        let mut ring = AuthSecretRing::new(b"s0".to_vec(), at(0));
        ring.rotate(b"s1".to_vec(), at(1800));
        let (secret, stale) = ring.signing_key_for(at(900)).unwrap();
        assert_eq!(secret.value, b"s0");
        assert!(stale, "s1 is newer than the selected secret");
    }

    #[test]
    fn signing_key_for_picks_head_after_reissue() {
        let mut ring = AuthSecretRing::new(b"s0".to_vec(), at(0));
        ring.rotate(b"s1".to_vec(), at(1800));
        let (secret, stale) = ring.signing_key_for(at(1800)).unwrap();
        assert_eq!(secret.value, b"s1");
        assert!(!stale);
    }

    #[test]
    fn signing_key_for_rejects_iat_older_than_any_secret() {
        let ring = AuthSecretRing::new(b"s0".to_vec(), at(1000));
        assert!(matches!(
            ring.signing_key_for(at(0)),
            Err(CoreError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn session_store_round_trips() {
        let store = InMemorySessionStore::new();
        let session_id = Uuid::now_v7();
        let session = Session {
            session_id,
            identity: Identity {
                kind: "oidc".into(),
                identifier: "user:alice".into(),
                name: "alice".into(),
                shared_secret: None,
                oidc_subject: Some("sub-1".into()),
            },
            token: "jwt".into(),
            expiry: Utc::now(),
        };
        store.create(session).await.unwrap();
        let loaded = store.get(session_id).await.unwrap();
        assert_eq!(loaded.identity.identifier, "user:alice");
        store.delete(session_id).await.unwrap();
        assert!(store.get(session_id).await.is_err());
    }
}
