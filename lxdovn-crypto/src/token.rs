//! Token issuance and verification — spec.md §4.2.
//!
//! All tokens are HS512 JWTs. The signing key is never the raw cluster
//! secret: `issueSessionToken` derives it per-session via [`crate::kdf`] so
//! that rotating a session's salt invalidates only that session's tokens.
//! Every failure path — bad signature, wrong audience, expired, malformed —
//! collapses to [`CoreError::invalid_token`] before it reaches the caller.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use lxdovn_types::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

use crate::kdf;

/// Claims shaped per spec.md §6: `iss=lxd:<cluster_uuid>`,
/// `aud` is either the cluster audience or the devlxd audience, `sub` is
/// caller-supplied (certificate fingerprint, username, or session id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_cert_fingerprint: Option<String>,
}

fn cluster_audience(cluster_uuid: &str) -> String {
    format!("lxd:{cluster_uuid}")
}

fn devlxd_audience(cluster_uuid: &str) -> String {
    format!("devlxd:{cluster_uuid}")
}

fn issuer(cluster_uuid: &str) -> String {
    format!("lxd:{cluster_uuid}")
}

fn build_claims(
    cluster_uuid: &str,
    audience: String,
    subject: &str,
    now: DateTime<Utc>,
    expiry: chrono::Duration,
    server_cert_fingerprint: Option<String>,
) -> Claims {
    Claims {
        iss: issuer(cluster_uuid),
        aud: audience,
        sub: subject.to_string(),
        iat: now.timestamp(),
        nbf: now.timestamp(),
        exp: (now + expiry).timestamp(),
        server_cert_fingerprint,
    }
}

fn sign(key: &[u8], claims: &Claims) -> CoreResult<String> {
    encode(
        &Header::new(Algorithm::HS512),
        claims,
        &EncodingKey::from_secret(key),
    )
    .map_err(|_| CoreError::invalid_token())
}

/// Issues a client-certificate token: `sub` is the caller's certificate
/// fingerprint, audience is the cluster audience, and the fingerprint is
/// repeated in the claims so `verify` can bind the presented client
/// certificate to the one the token was issued for.
pub fn issue_client_token(
    signing_key: &[u8],
    cluster_uuid: &str,
    subject_fingerprint: &str,
    now: DateTime<Utc>,
    expiry: chrono::Duration,
) -> CoreResult<String> {
    if subject_fingerprint.is_empty() {
        return Err(CoreError::invalid_config(
            "client token requires a non-empty server certificate fingerprint",
        ));
    }
    let claims = build_claims(
        cluster_uuid,
        cluster_audience(cluster_uuid),
        subject_fingerprint,
        now,
        expiry,
        Some(subject_fingerprint.to_string()),
    );
    sign(signing_key, &claims)
}

/// Issues a devlxd token: audience is the devlxd audience, no certificate
/// fingerprint is bound since devlxd callers authenticate by vsock/unix
/// socket, not client certificate.
pub fn issue_dev_token(
    signing_key: &[u8],
    cluster_uuid: &str,
    subject: &str,
    now: DateTime<Utc>,
    expiry: chrono::Duration,
) -> CoreResult<String> {
    let claims = build_claims(
        cluster_uuid,
        devlxd_audience(cluster_uuid),
        subject,
        now,
        expiry,
        None,
    );
    sign(signing_key, &claims)
}

/// Issues a session token (browser/OIDC flow). The signing key is derived
/// fresh from the cluster secret using the session id as salt, per spec.md
/// §4.1/§4.2, so the key never has to be stored alongside the session.
pub fn issue_session_token(
    cluster_secret: &[u8],
    session_id: &[u8],
    cluster_uuid: &str,
    subject: &str,
    now: DateTime<Utc>,
    expiry: chrono::Duration,
) -> CoreResult<String> {
    let signing_key = kdf::token_signing_key(cluster_secret, session_id)
        .map_err(|_| CoreError::invalid_token())?;
    let claims = build_claims(
        cluster_uuid,
        cluster_audience(cluster_uuid),
        subject,
        now,
        expiry,
        None,
    );
    sign(&signing_key, &claims)
}

/// Parses a token's claims without verifying its signature. Used only to
/// read `sub`/`iat`/`aud` so a verifier can look up which key to check
/// against (e.g. resolve a session id from `sub`, then derive that
/// session's signing key) — never trust the result until [`verify`] also
/// succeeds against the same token.
pub fn inspect(token: &str) -> CoreResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS512);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    let key = DecodingKey::from_secret(&[]);
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|_| CoreError::invalid_token())
}

/// Verifies a token's signature, issuer, audience, and `nbf`/`exp` window
/// against `now`, with zero leeway. `key_fn` resolves the signing key for
/// the claimed subject/audience so callers can look up per-session or
/// per-cluster keys before the signature is actually checked.
pub fn verify<F>(
    token: &str,
    cluster_uuid: &str,
    expected_audiences: &[&str],
    now: DateTime<Utc>,
    key_fn: F,
) -> CoreResult<Claims>
where
    F: FnOnce(&Claims) -> CoreResult<Vec<u8>>,
{
    let claims = inspect(token)?;
    let key_bytes = key_fn(&claims)?;

    let mut validation = Validation::new(Algorithm::HS512);
    validation.leeway = 0;
    validation.set_issuer(&[issuer(cluster_uuid)]);
    validation.set_audience(expected_audiences);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&key_bytes), &validation)
        .map_err(|_| CoreError::invalid_token())?;

    if data.claims.nbf > now.timestamp() || data.claims.exp <= now.timestamp() {
        return Err(CoreError::invalid_token());
    }

    Ok(data.claims)
}
