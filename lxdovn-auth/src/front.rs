//! AuthFront — spec.md §4.14's per-request dispatch algorithm.
//!
//! Four paths, tried in order: cluster client token, devlxd client token,
//! OIDC access token, OIDC session cookie. Everything here is pure request
//! logic — no axum types — so it can be unit tested without a server; see
//! `middleware` for the axum wiring that calls into this.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cookie::Cookie;
use parking_lot::RwLock;
use uuid::Uuid;

use lxdovn_crypto::token;
use lxdovn_types::{CoreError, CoreResult};

use crate::identity::{Identity, IdentityCache};
use crate::oidc::OidcVerifier;
use crate::session::{build_session_cookie, AuthSecretRing, Session, SessionStore};

fn cluster_audience(cluster_uuid: &str) -> String {
    format!("lxd:{cluster_uuid}")
}

fn devlxd_audience(cluster_uuid: &str) -> String {
    format!("devlxd:{cluster_uuid}")
}

/// Result of running the dispatch algorithm: the resolved identity, which
/// of the two client-token audiences matched (if any), and a cookie to set
/// on the response when a stale-signing-key session was transparently
/// refreshed.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub identity: Identity,
    pub is_guest: bool,
    pub reissue_cookie: Option<String>,
}

pub struct AuthFront {
    cluster_uuid: String,
    identity_cache: Arc<dyn IdentityCache>,
    oidc: Arc<dyn OidcVerifier>,
    sessions: Arc<dyn SessionStore>,
    secrets: Arc<RwLock<AuthSecretRing>>,
    session_token_expiry: Duration,
}

impl AuthFront {
    pub fn new(
        cluster_uuid: String,
        identity_cache: Arc<dyn IdentityCache>,
        oidc: Arc<dyn OidcVerifier>,
        sessions: Arc<dyn SessionStore>,
        secrets: Arc<RwLock<AuthSecretRing>>,
        session_token_expiry: Duration,
    ) -> Self {
        Self {
            cluster_uuid,
            identity_cache,
            oidc,
            sessions,
            secrets,
            session_token_expiry,
        }
    }

    /// Runs the four-path dispatch. Returns `Ok(None)` for "not
    /// authenticated" (step 4) rather than an error, since that is not a
    /// failure of the pipeline itself — callers decide whether the route
    /// requires authentication.
    pub async fn authenticate(
        &self,
        authorization_header: Option<&str>,
        session_cookie_value: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<AuthOutcome>> {
        if let Some(header) = authorization_header {
            if let Some(bearer) = header.strip_prefix("Bearer ") {
                return self.authenticate_bearer(bearer, now).await.map(Some);
            }
        }

        if let Some(cookie_value) = session_cookie_value {
            return self.authenticate_session(cookie_value, now).await.map(Some);
        }

        Ok(None)
    }

    async fn authenticate_bearer(&self, token_str: &str, now: DateTime<Utc>) -> CoreResult<AuthOutcome> {
        let claims = token::inspect(token_str)?;
        let expected_iss = format!("lxd:{}", self.cluster_uuid);
        let cluster_aud = cluster_audience(&self.cluster_uuid);
        let devlxd_aud = devlxd_audience(&self.cluster_uuid);

        if claims.iss == expected_iss && (claims.aud == cluster_aud || claims.aud == devlxd_aud) {
            let is_guest = claims.aud == devlxd_aud;
            let subject = claims.sub.clone();
            let secret = self.identity_cache.get_secret(&subject).await?;
            token::verify(token_str, &self.cluster_uuid, &[claims.aud.as_str()], now, |_| {
                Ok(secret.clone())
            })?;
            let identity = self.identity_cache.get_by_identifier(&subject).await?;
            return Ok(AuthOutcome {
                identity,
                is_guest,
                reissue_cookie: None,
            });
        }

        let oidc_claims = self.oidc.verify_access_token(token_str).await?;
        let identity = self
            .identity_cache
            .get_by_oidc_subject(&oidc_claims.subject)
            .await?;
        Ok(AuthOutcome {
            identity,
            is_guest: false,
            reissue_cookie: None,
        })
    }

    async fn authenticate_session(&self, token_str: &str, now: DateTime<Utc>) -> CoreResult<AuthOutcome> {
        let claims = token::inspect(token_str)?;
        let session_id =
            Uuid::parse_str(&claims.sub).map_err(|_| CoreError::invalid_token())?;
        let iat = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or_else(CoreError::invalid_token)?;

        let (secret, stale) = {
            let ring = self.secrets.read();
            let (secret, stale) = ring.signing_key_for(iat)?;
            (secret.clone(), stale)
        };

        let signing_key = lxdovn_crypto::kdf::token_signing_key(&secret.value, session_id.as_bytes())
            .map_err(|_| CoreError::invalid_token())?;
        token::verify(
            token_str,
            &self.cluster_uuid,
            &[cluster_audience(&self.cluster_uuid).as_str()],
            now,
            |_| Ok(signing_key),
        )?;

        let session = self.sessions.get(session_id).await?;
        let identity = session.identity.clone();

        let reissue_cookie = if stale {
            Some(self.reissue_session(&identity, now).await?)
        } else {
            None
        };

        Ok(AuthOutcome {
            identity,
            is_guest: false,
            reissue_cookie,
        })
    }

    /// Starts a fresh session signed with the current head secret and
    /// returns the `Set-Cookie` value for it — spec.md §4.14 item 3's
    /// "start a new session with current secret and reissue cookie".
    async fn reissue_session(&self, identity: &Identity, now: DateTime<Utc>) -> CoreResult<String> {
        let new_session_id = Uuid::now_v7();
        let head = self.secrets.read().head().clone();
        let new_token = token::issue_session_token(
            &head.value,
            new_session_id.as_bytes(),
            &self.cluster_uuid,
            &new_session_id.to_string(),
            now,
            self.session_token_expiry,
        )?;
        let expiry = now + self.session_token_expiry;
        self.sessions
            .create(Session {
                session_id: new_session_id,
                identity: identity.clone(),
                token: new_token.clone(),
                expiry,
            })
            .await?;
        Ok(build_session_cookie(new_token, expiry).to_string())
    }

    /// Derives the securecookie hash/block keys for a `login_id` value:
    /// the uuid's embedded v7 timestamp picks which `AuthSecret` produced
    /// them, exactly as a session token's `iat` picks its signing secret.
    pub fn login_id_cookie_keys(&self, login_id: Uuid) -> CoreResult<(Vec<u8>, Vec<u8>)> {
        let iat = login_id
            .get_timestamp()
            .and_then(|ts| {
                let (secs, nanos) = ts.to_unix();
                Utc.timestamp_opt(secs as i64, nanos).single()
            })
            .ok_or_else(CoreError::invalid_token)?;
        let ring = self.secrets.read();
        let (secret, _) = ring.signing_key_for(iat)?;
        let hash_key = lxdovn_crypto::kdf::cookie_hash_key(&secret.value, login_id.as_bytes())
            .map_err(|_| CoreError::invalid_token())?;
        let block_key = lxdovn_crypto::kdf::cookie_block_key(&secret.value, login_id.as_bytes())
            .map_err(|_| CoreError::invalid_token())?;
        Ok((hash_key, block_key))
    }

    /// Issues the first session for a successful OIDC login/callback —
    /// expiry on the cookie is `session_expiry + 7 days` so a session whose
    /// inner token has expired can still be refreshed against the IdP.
    pub async fn start_session(&self, identity: Identity, now: DateTime<Utc>) -> CoreResult<Cookie<'static>> {
        let session_id = Uuid::now_v7();
        let head = self.secrets.read().head().clone();
        let token = token::issue_session_token(
            &head.value,
            session_id.as_bytes(),
            &self.cluster_uuid,
            &session_id.to_string(),
            now,
            self.session_token_expiry,
        )?;
        let expiry = now + self.session_token_expiry;
        self.sessions
            .create(Session {
                session_id,
                identity,
                token: token.clone(),
                expiry,
            })
            .await?;
        Ok(build_session_cookie(token, expiry))
    }
}
