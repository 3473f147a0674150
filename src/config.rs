//! Root configuration, assembled from a config file plus environment
//! overrides via the `config` crate (SPEC_FULL.md's ambient-stack section;
//! the teacher's own `aerolithdb-core::config` hand-rolls JSON file I/O,
//! but a layered `config`-crate loader is the more idiomatic ecosystem
//! choice and what this binary commits to instead).
//!
//! Every field here is a plain typed struct handed wholesale to the crate
//! that owns it; nothing downstream re-parses a free-form map.

use serde::Deserialize;

use lxdovn_auth::OidcConfig;

/// `LXDOVN_CONFIG` points at an optional config file; every key can also be
/// set as an environment variable prefixed `LXDOVN__`, double-underscore
/// separating nesting (e.g. `LXDOVN__OIDC__ISSUER`).
const CONFIG_FILE_ENV: &str = "LXDOVN_CONFIG";
const ENV_PREFIX: &str = "LXDOVN";

#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    /// Identifies this cluster in issued token `iss`/`aud` claims
    /// (spec.md §3).
    pub cluster_uuid: String,

    /// This member's own name, as carried in `ClusterMember::name`.
    pub local_member: String,

    /// Fingerprint embedded in client tokens' `server_cert_fingerprint`
    /// claim and checked by `NetworkProjection` (spec.md §4.6).
    pub server_cert_fingerprint: String,

    /// Whether `ClusterLocks` layers the distributed operation on top of
    /// process-local locking, or degrades to plain `NamedLocks`
    /// (spec.md §4.5).
    #[serde(default)]
    pub clustered: bool,

    pub oidc: Option<OidcConfig>,

    #[serde(default = "default_session_token_expiry_secs")]
    pub session_token_expiry_secs: i64,

    /// Base64-encoded initial signing secret seeded into the
    /// `AuthSecretRing` at startup. Generated and persisted by the
    /// operator the same way the teacher persists a generated config back
    /// to disk on first run.
    pub initial_auth_secret: String,
}

fn default_session_token_expiry_secs() -> i64 {
    3600
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            cluster_uuid: uuid::Uuid::now_v7().to_string(),
            local_member: "local".to_string(),
            server_cert_fingerprint: String::new(),
            clustered: false,
            oidc: None,
            session_token_expiry_secs: default_session_token_expiry_secs(),
            initial_auth_secret: String::new(),
        }
    }
}

impl RootConfig {
    /// Layers `config/lxdovn.toml` (or whatever `LXDOVN_CONFIG` points at,
    /// if set) under environment overrides, then falls back to built-in
    /// defaults for anything still unset — the same file-then-env-then-
    /// default layering the `config` crate exists to provide.
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        let file_path = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| "config/lxdovn".to_string());
        builder = builder.add_source(config::File::with_name(&file_path).required(false));
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let assembled = builder.build()?;
        match assembled.try_deserialize::<RootConfig>() {
            Ok(config) => Ok(config),
            Err(reason) => {
                tracing::warn!(%reason, "no usable configuration found, starting from defaults");
                Ok(RootConfig::default())
            }
        }
    }
}
