//! Axum middleware wiring `AuthFront` into a request pipeline.
//!
//! The router and its handlers are an external collaborator (spec.md's
//! Non-goals exclude the REST surface); this layer only runs the dispatch
//! algorithm, stashes the resolved identity in request extensions for
//! handlers downstream to read, and appends a `Set-Cookie` header when
//! `AuthFront` transparently refreshed a stale-signing-key session.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use cookie::Cookie;
use tracing::{debug, warn};

use lxdovn_types::CoreError;

use crate::front::AuthFront;
use crate::identity::Identity;
use crate::session::SESSION_COOKIE_NAME;

/// Per-request auth result, stashed in request extensions alongside the
/// resolved `Identity` so handlers can tell a guest (devlxd) caller from an
/// ordinary API caller without re-deriving it.
#[derive(Debug, Clone, Copy)]
pub struct RequestAuth {
    pub is_guest: bool,
}

fn session_cookie_value(raw_cookie_header: &str) -> Option<String> {
    Cookie::split_parse(raw_cookie_header.to_string())
        .filter_map(Result::ok)
        .find(|c| c.name() == SESSION_COOKIE_NAME)
        .map(|c| c.value().to_string())
}

/// `axum::middleware::from_fn_with_state(front, require_auth)`. Rejects
/// with 401 when no credential authenticates and with 503 when the
/// failure was transient (OVN/IdP-adjacent, spec.md §7's distinct
/// recoverable kind) so callers know to retry after reconfiguration.
pub async fn require_auth(
    State(front): State<Arc<AuthFront>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let session_cookie = request
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_cookie_value);

    let now = Utc::now();
    let outcome = front
        .authenticate(auth_header.as_deref(), session_cookie.as_deref(), now)
        .await;

    match outcome {
        Ok(Some(outcome)) => {
            debug!(identifier = %outcome.identity.identifier, guest = outcome.is_guest, "request authenticated");
            request.extensions_mut().insert::<Identity>(outcome.identity);
            request.extensions_mut().insert(RequestAuth {
                is_guest: outcome.is_guest,
            });
            let mut response = next.run(request).await;
            if let Some(cookie_value) = outcome.reissue_cookie {
                if let Ok(header_value) = HeaderValue::from_str(&cookie_value) {
                    response.headers_mut().append(SET_COOKIE, header_value);
                }
            }
            Ok(response)
        }
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(CoreError::Transient(reason)) => {
            warn!(reason = %reason, "auth pipeline hit a transient collaborator error");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(_) => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_value_finds_the_named_cookie_among_others() {
        let raw = "login_id=abc; session=the-jwt; other=1";
        assert_eq!(session_cookie_value(raw).as_deref(), Some("the-jwt"));
    }

    #[test]
    fn session_cookie_value_is_none_when_absent() {
        assert_eq!(session_cookie_value("login_id=abc"), None);
    }
}
