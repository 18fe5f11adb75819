//! Infrastructure provider abstraction layer
//!
//! Every backend implements [`ProviderAdapter`]: an idempotent `setup`, a
//! whole-cluster `deploy` and a single-instance `run`. Backends talk to
//! their infrastructure API through a narrow capability trait
//! ([`Ec2Api`], [`PacketApi`]) so provisioning logic is testable without
//! credentials.
//!
//! # Supported Providers
//!
//! - [`Ec2Provisioner`] - private VPC scaffold plus role-tagged instances
//! - [`PacketProvisioner`] - bare-metal devices in a flat project
//!
//! Provisioners never retry and never tear down what they created. Retry
//! policy belongs to the caller (see [`crate::retry`]).

mod ec2;
#[cfg(feature = "aws")]
mod ec2_client;
mod launch;
mod packet;
mod packet_client;

pub use ec2::{
    Ec2Api, Ec2Provisioner, InstanceRequest, NetworkTopology, RuleSource, SecurityRule, Tag,
    TAG_DOMAIN, TAG_HOST_INDEX, TAG_ROLE,
};
#[cfg(feature = "aws")]
pub use ec2_client::AwsEc2Client;
pub use launch::{LaunchPool, LaunchSlot, DEFAULT_LAUNCH_CONCURRENCY};
pub use packet::{Device, DeviceRequest, PacketApi, PacketProvisioner, Project};
pub use packet_client::{PacketHttpClient, PACKET_API_URL};

#[cfg(test)]
pub use ec2::MockEc2Api;
#[cfg(test)]
pub use packet::MockPacketApi;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::config::{Ec2Config, NodeRole, PacketConfig, ProviderConfig};
use crate::error::ProviderError;
use crate::template::BootDocument;
use crate::Result;

/// Identifies one launched instance or device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Provider-assigned identifier
    pub id: String,
    /// Hostname the instance was launched under
    pub hostname: String,
    /// Role, when launched as part of a cluster
    pub role: Option<NodeRole>,
    /// Host index within the role
    pub host_index: Option<u32>,
    /// Public address, when one was requested
    pub public_ip: Option<String>,
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.hostname)
    }
}

/// Outcome of an idempotent setup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetupReport {
    /// True when resources were created, false when reused or already enabled
    pub created: bool,
    /// Identifiers of the resources set up or found
    pub resources: Vec<String>,
}

/// Outcome of a fully successful deploy
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployReport {
    /// Instances launched, by role then host index
    pub launched: Vec<InstanceHandle>,
}

/// Partial deploy: what launched, what failed, what was never issued
///
/// Launched instances are left running so the operator can retry only the
/// failed and abandoned slots.
#[derive(Debug)]
pub struct DeployFailure {
    /// Instances that launched before the deploy stopped
    pub launched: Vec<InstanceHandle>,
    /// Launches that failed, each naming its role and host index
    pub failed: Vec<ProviderError>,
    /// Launches never issued after the first failure
    pub abandoned: usize,
}

impl fmt::Display for DeployFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} launched, {} failed, {} abandoned",
            self.launched.len(),
            self.failed.len(),
            self.abandoned
        )?;
        for err in &self.failed {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

/// Lifecycle contract every infrastructure backend implements
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Backend name (`ec2`, `packet`)
    fn name(&self) -> &'static str;

    /// Create prerequisite resources, reusing whatever already exists
    async fn setup(&self) -> Result<SetupReport>;

    /// Launch one instance per document, scaffolding the network if absent
    ///
    /// Every document must carry its role and hostname. Launches stop being
    /// issued on the first failure or when `cancel` fires.
    async fn deploy(
        &self,
        documents: Vec<BootDocument>,
        cancel: CancellationToken,
    ) -> Result<DeployReport>;

    /// Launch exactly one instance with a pre-rendered document
    async fn run(&self, document: &BootDocument) -> Result<InstanceHandle>;
}

/// Builds API capabilities from provider configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiConnector: Send + Sync {
    /// EC2 API for the configured region
    async fn ec2(&self, config: &Ec2Config) -> Result<Arc<dyn Ec2Api>>;

    /// Packet API authenticated with the configured key
    async fn packet(&self, config: &PacketConfig) -> Result<Arc<dyn PacketApi>>;
}

/// Connector backed by the real provider APIs
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConnector;

#[async_trait]
impl ApiConnector for DefaultConnector {
    #[cfg(feature = "aws")]
    async fn ec2(&self, config: &Ec2Config) -> Result<Arc<dyn Ec2Api>> {
        Ok(Arc::new(AwsEc2Client::connect(&config.region).await))
    }

    #[cfg(not(feature = "aws"))]
    async fn ec2(&self, _config: &Ec2Config) -> Result<Arc<dyn Ec2Api>> {
        Err(crate::Error::Unsupported {
            provider: "ec2",
            operation: "API access in builds without the `aws` feature",
        })
    }

    async fn packet(&self, config: &PacketConfig) -> Result<Arc<dyn PacketApi>> {
        Ok(Arc::new(PacketHttpClient::new(&config.api_key)?))
    }
}

/// Create the adapter matching the active provider variant
///
/// `domain` scopes EC2 network lookups; `concurrency` bounds launches per
/// role group during deploy.
pub async fn create_provider(
    config: &ProviderConfig,
    domain: Option<&str>,
    connector: &dyn ApiConnector,
    concurrency: usize,
) -> Result<Box<dyn ProviderAdapter>> {
    match config {
        ProviderConfig::Ec2(cfg) => {
            let api = connector.ec2(cfg).await?;
            Ok(Box::new(
                Ec2Provisioner::new(api, cfg.clone(), domain.map(str::to_string))
                    .with_concurrency(concurrency),
            ))
        }
        ProviderConfig::Packet(cfg) => {
            let api = connector.packet(cfg).await?;
            Ok(Box::new(PacketProvisioner::new(api, cfg.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;

    #[test]
    fn test_deploy_failure_names_failed_slots() {
        let failure = DeployFailure {
            launched: vec![InstanceHandle {
                id: "i-1".to_string(),
                hostname: "master-0.example.com".to_string(),
                role: Some(NodeRole::Master),
                host_index: Some(0),
                public_ip: None,
            }],
            failed: vec![ProviderError::new(
                "ec2",
                "run-instance",
                ApiError::capacity("InsufficientInstanceCapacity"),
            )
            .with_slot(NodeRole::Node, 1)],
            abandoned: 2,
        };
        let msg = failure.to_string();
        assert!(msg.starts_with("1 launched, 1 failed, 2 abandoned"));
        assert!(msg.contains("for node-1"));
    }

    #[tokio::test]
    async fn test_create_provider_selects_variant() {
        let mut connector = MockApiConnector::new();
        connector.expect_ec2().times(0);
        connector
            .expect_packet()
            .times(1)
            .returning(|_| Ok(Arc::new(MockPacketApi::new())));

        let config = ProviderConfig::Packet(PacketConfig {
            api_key: "k".to_string(),
            project_id: "6f2b1c3a-1d2e-4f5a-9b8c-0123456789ab".to_string(),
            plan: "baremetal_0".to_string(),
            facility: "ewr1".to_string(),
            operating_system: "coreos_stable".to_string(),
            billing: Default::default(),
        });
        let provider = create_provider(&config, None, &connector, 4).await.unwrap();
        assert_eq!(provider.name(), "packet");
    }
}
