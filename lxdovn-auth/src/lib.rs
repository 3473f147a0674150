//! Request Authentication Pipeline — spec.md §4.3, §4.14.
//!
//! `identity` is the IdentityCache, `session`/`oidc` are the building
//! blocks AuthFront's session-cookie and OIDC-access-token paths are built
//! from, `front` is the dispatch algorithm itself, and `middleware` wires
//! it into an axum request pipeline. The router and its handlers live
//! outside this crate.

mod front;
mod identity;
mod middleware;
mod oidc;
mod session;

pub use front::{AuthFront, AuthOutcome};
pub use identity::{seed, Identity, IdentityCache, InMemoryIdentityCache};
pub use middleware::{require_auth, RequestAuth};
pub use oidc::{FakeOidcVerifier, OidcClaims, OidcConfig, OidcVerifier, OpenIdConnectVerifier};
pub use session::{
    build_login_id_cookie, build_session_cookie, expired_cookie, AuthSecret, AuthSecretRing,
    InMemorySessionStore, Session, SessionStore, LOGIN_ID_COOKIE_NAME, SESSION_COOKIE_NAME,
};

