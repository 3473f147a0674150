//! `ClusterCore` — process bootstrap orchestrator.
//!
//! Mirrors the teacher's own lifecycle-manager idiom: a struct of `Arc`
//! subsystem handles, built once in `new`, with `start`/`stop` driving
//! whatever background work a subsystem needs. Unlike the teacher, nothing
//! here opens a REST/gRPC/GraphQL listener — the router is an external
//! collaborator (spec.md's Non-goals) and this binary only assembles the
//! orchestration primitives a router would sit in front of.

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use tracing::info;

use lxdovn_auth::{seed, AuthFront, AuthSecretRing, FakeOidcVerifier, InMemorySessionStore, OidcVerifier};
use lxdovn_locks::{ClusterLocks, InMemoryClusterOperations, NamedLocks};
use lxdovn_net::{
    ForwardAndLbManager, InMemoryHostNetwork, InMemoryOvnClient, InstancePortManager, NoopNotifier,
    OvnClient, PeeringManager, UplinkPortManager,
};
use lxdovn_types::{ClusterDb, InMemoryClusterDb};

use crate::config::RootConfig;

/// Everything the bootstrap binary wires together: the overlay-network
/// orchestrator's managers, the cluster locking layer, and the request
/// authentication front. A real deployment swaps `InMemoryOvnClient`/
/// `InMemoryClusterDb`/`InMemoryHostNetwork` for OVSDB, SQL, and `ip`/
/// `ovs-vsctl`-backed implementations of the same contract-only traits;
/// nothing else in this struct changes.
pub struct ClusterCore {
    config: RootConfig,
    ovn: Arc<dyn OvnClient>,
    db: Arc<dyn ClusterDb>,
    named_locks: Arc<NamedLocks>,
    cluster_locks: Arc<ClusterLocks>,
    pub ports: Arc<InstancePortManager>,
    pub peering: Arc<PeeringManager>,
    pub forwards_and_lbs: Arc<ForwardAndLbManager>,
    pub uplinks: Arc<UplinkPortManager>,
    pub auth: Arc<AuthFront>,
}

impl ClusterCore {
    pub async fn new(config: RootConfig) -> anyhow::Result<Self> {
        let ovn: Arc<dyn OvnClient> = Arc::new(InMemoryOvnClient::new());
        let db: Arc<dyn ClusterDb> = Arc::new(InMemoryClusterDb::new());

        let named_locks = NamedLocks::new();
        let cluster_ops = if config.clustered {
            Some(InMemoryClusterOperations::new() as Arc<dyn lxdovn_locks::ClusterOperations>)
        } else {
            None
        };
        let cluster_locks = Arc::new(ClusterLocks::new(named_locks.clone(), cluster_ops));

        let ports = Arc::new(InstancePortManager::new(
            ovn.clone(),
            db.clone(),
            config.local_member.clone(),
        ));
        let peering = Arc::new(PeeringManager::new(ovn.clone(), db.clone()));
        let forwards_and_lbs = Arc::new(ForwardAndLbManager::new(
            ovn.clone(),
            db.clone(),
            Arc::new(NoopNotifier),
        ));
        let host_network = Arc::new(InMemoryHostNetwork::new());
        let uplinks = Arc::new(UplinkPortManager::new(host_network, named_locks.clone()));

        let auth = Arc::new(build_auth_front(&config).await?);

        Ok(Self {
            config,
            ovn,
            db,
            named_locks,
            cluster_locks,
            ports,
            peering,
            forwards_and_lbs,
            uplinks,
            auth,
        })
    }

    /// Nothing here blocks: every manager constructed in `new` operates
    /// request-by-request, there is no background task to launch. `start`
    /// exists anyway to match the teacher's lifecycle shape and to log the
    /// point at which this process is ready to serve.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            cluster_uuid = %self.config.cluster_uuid,
            local_member = %self.config.local_member,
            clustered = self.config.clustered,
            "cluster core ready"
        );
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        info!("cluster core shutting down");
        Ok(())
    }

    pub fn cluster_locks(&self) -> &Arc<ClusterLocks> {
        &self.cluster_locks
    }

    pub fn db(&self) -> &Arc<dyn ClusterDb> {
        &self.db
    }

    pub fn ovn(&self) -> &Arc<dyn OvnClient> {
        &self.ovn
    }
}

async fn build_auth_front(config: &RootConfig) -> anyhow::Result<AuthFront> {
    let identity_cache = seed(std::iter::empty());
    let sessions = InMemorySessionStore::shared();

    let secret = base64_decode(&config.initial_auth_secret)?;
    let secrets = Arc::new(RwLock::new(AuthSecretRing::new(secret, Utc::now())));

    let oidc: Arc<dyn OidcVerifier> = match &config.oidc {
        Some(oidc_config) => Arc::new(
            lxdovn_auth::OpenIdConnectVerifier::discover(
                oidc_config.clone(),
                format!("https://{}/oidc/callback", config.local_member),
            )
            .await?,
        ),
        None => Arc::new(FakeOidcVerifier::new()),
    };

    Ok(AuthFront::new(
        config.cluster_uuid.clone(),
        identity_cache,
        oidc,
        sessions,
        secrets,
        Duration::seconds(config.session_token_expiry_secs),
    ))
}

/// Minimal base64 decode for the initial secret; falls back to treating an
/// empty/invalid value as 64 zero bytes so a freshly generated default
/// config still starts (an operator is expected to replace it before
/// exposing this process to real traffic).
fn base64_decode(value: &str) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    if value.is_empty() {
        return Ok(vec![0u8; 64]);
    }
    Ok(base64::engine::general_purpose::STANDARD.decode(value)?)
}
