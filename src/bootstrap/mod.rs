//! Etcd bootstrap coordination
//!
//! Independently booted nodes find each other through a shared etcd
//! discovery token. The token is resolved exactly once per cluster and the
//! result is reused for every node's boot document: resolving "auto" twice
//! issues two different tokens and would split the cluster.

mod discovery;

pub use discovery::{DiscoveryClient, HttpDiscoveryClient};

#[cfg(test)]
pub use discovery::MockDiscoveryClient;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::{ClusterConfig, EtcdToken};
use crate::flannel::AllocationPlan;
use crate::Result;

/// An etcd discovery token ready to embed in boot documents
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedToken(String);

impl ResolvedToken {
    /// Wrap an already-resolved token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Discovery URL nodes register with
    pub fn discovery_url(&self, endpoint: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), self.0)
    }
}

impl fmt::Debug for ResolvedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Anyone holding the token can join the cluster
        f.write_str("ResolvedToken(<redacted>)")
    }
}

/// Resolves the cluster's etcd discovery token
#[derive(Clone)]
pub struct EtcdBootstrapCoordinator {
    client: Arc<dyn DiscoveryClient>,
}

impl EtcdBootstrapCoordinator {
    /// Create a coordinator backed by a discovery client
    pub fn new(client: Arc<dyn DiscoveryClient>) -> Self {
        Self { client }
    }

    /// Pass a supplied token through, or issue one sized for `size` members
    pub async fn resolve(
        &self,
        token: &EtcdToken,
        endpoint: &str,
        size: u32,
    ) -> Result<ResolvedToken> {
        match token {
            EtcdToken::Supplied(token) if !token.trim().is_empty() => {
                Ok(ResolvedToken::new(token.trim()))
            }
            // A blank supplied token means the same as auto
            EtcdToken::Supplied(_) | EtcdToken::Auto => {
                let token = self.client.new_token(endpoint, size).await?;
                info!(endpoint = %endpoint, size, "issued etcd discovery token");
                Ok(ResolvedToken::new(token))
            }
        }
    }

    /// Resolve the token for a validated cluster
    pub async fn prepare(
        &self,
        config: ClusterConfig,
        plan: AllocationPlan,
    ) -> Result<ClusterBootstrap> {
        let token = self
            .resolve(
                &config.etcd_token,
                &config.discovery_endpoint,
                config.nodes.master,
            )
            .await?;
        Ok(ClusterBootstrap::new(config, token, plan))
    }
}

/// Cluster-wide values every boot document is rendered from
///
/// Cheap to clone and shared read-only by concurrent renders and launches.
#[derive(Clone, Debug)]
pub struct ClusterBootstrap {
    /// Validated cluster request
    pub config: Arc<ClusterConfig>,
    /// Resolved discovery token
    pub token: ResolvedToken,
    /// Frozen overlay allocation plan
    pub plan: AllocationPlan,
}

impl ClusterBootstrap {
    /// Bundle resolved cluster values
    pub fn new(config: ClusterConfig, token: ResolvedToken, plan: AllocationPlan) -> Self {
        Self {
            config: Arc::new(config),
            token,
            plan,
        }
    }

    /// Discovery URL embedded in every node's etcd section
    pub fn discovery_url(&self) -> String {
        self.token.discovery_url(&self.config.discovery_endpoint)
    }
}

/// Resolved cluster with fixed token and credentials for unit tests
#[cfg(test)]
pub(crate) fn test_cluster(master: u32, node: u32, edge: u32) -> ClusterBootstrap {
    let mut config = ClusterConfig::new("example.com");
    config.nodes = crate::config::NodeCounts { master, node, edge };
    config.dns_api_key = Some("ns1-key".to_string());
    let plan = config.validate().expect("test cluster is valid");
    ClusterBootstrap::new(config, ResolvedToken::new("abc123"), plan)
}
