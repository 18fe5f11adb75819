//! EC2 provisioner
//!
//! Setup scaffolds one private network per domain: a VPC, an external and an
//! internal subnet, and a security group. The scaffold is found again by its
//! `kato:domain` tag, so setup is idempotent without local state. Deploy
//! launches role-tagged instances into the scaffold; edges go to the
//! external subnet, everything else to the internal one.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use super::launch::{LaunchPool, LaunchSlot, DEFAULT_LAUNCH_CONCURRENCY};
use super::{DeployReport, InstanceHandle, ProviderAdapter, SetupReport};
use crate::config::{Ec2Config, NodeRole, PublicIpPolicy};
use crate::error::{ApiError, ProviderError};
use crate::template::BootDocument;
use crate::{Error, Result};

/// Tag carrying the cluster domain
pub const TAG_DOMAIN: &str = "kato:domain";
/// Tag carrying the node role
pub const TAG_ROLE: &str = "kato:role";
/// Tag carrying the host index within the role
pub const TAG_HOST_INDEX: &str = "kato:host-index";

const PROVIDER: &str = "ec2";

/// Etcd client and peer ports
const ETCD_PORTS: (u16, u16) = (2379, 2380);
/// Flannel UDP backend port
const FLANNEL_UDP_PORT: u16 = 8285;
/// Flannel VXLAN port
const FLANNEL_VXLAN_PORT: u16 = 8472;

/// Resource tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}

impl Tag {
    /// Create a tag
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Source of traffic permitted by a security rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleSource {
    /// Address range
    Cidr(Ipv4Net),
    /// Members of a security group
    Group(String),
}

/// Ingress permission on the cluster security group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityRule {
    /// IP protocol
    pub protocol: String,
    /// First port
    pub from_port: u16,
    /// Last port
    pub to_port: u16,
    /// Permitted source
    pub source: RuleSource,
}

/// Network scaffold of one domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkTopology {
    /// VPC id
    pub vpc_id: String,
    /// Public-facing subnet id
    pub external_subnet_id: String,
    /// Public-facing subnet range
    pub external_subnet_cidr: Ipv4Net,
    /// Private subnet id
    pub internal_subnet_id: String,
    /// Private subnet range
    pub internal_subnet_cidr: Ipv4Net,
    /// Cluster security group id
    pub security_group_id: String,
}

impl NetworkTopology {
    /// Subnet an instance of `role` launches into
    pub fn subnet_for(&self, role: Option<NodeRole>) -> &str {
        match role {
            Some(NodeRole::Edge) => &self.external_subnet_id,
            _ => &self.internal_subnet_id,
        }
    }
}

/// One instance launch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRequest {
    /// Hostname (also the `Name` tag)
    pub hostname: String,
    /// AMI id
    pub image_id: String,
    /// Instance type
    pub instance_type: String,
    /// SSH key pair
    pub key_pair: String,
    /// Subnet to launch into
    pub subnet_id: String,
    /// Security group to attach
    pub security_group_id: String,
    /// Base64 encoded boot document
    pub user_data: String,
    /// Public addressing
    pub public_ip: PublicIpPolicy,
    /// IAM instance profile
    pub iam_role: Option<String>,
    /// Instance tags
    pub tags: Vec<Tag>,
}

/// EC2 operations the provisioner needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Network scaffolds tagged with `domain`
    async fn find_networks(&self, domain: &str) -> std::result::Result<Vec<NetworkTopology>, ApiError>;

    /// Create a VPC, returning its id
    async fn create_vpc(&self, cidr: Ipv4Net, tags: &[Tag]) -> std::result::Result<String, ApiError>;

    /// Create a subnet in a VPC, returning its id
    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: Ipv4Net,
        tags: &[Tag],
    ) -> std::result::Result<String, ApiError>;

    /// Create a security group in a VPC, returning its id
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        tags: &[Tag],
    ) -> std::result::Result<String, ApiError>;

    /// Add ingress permissions to a security group
    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> std::result::Result<(), ApiError>;

    /// Launch one instance, returning its id and public address if any
    async fn run_instance(
        &self,
        request: &InstanceRequest,
    ) -> std::result::Result<(String, Option<String>), ApiError>;

    /// Add tags to an existing resource
    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> std::result::Result<(), ApiError>;

    /// Allocate an elastic IP and associate it with an instance
    async fn allocate_elastic_ip(&self, instance_id: &str) -> std::result::Result<String, ApiError>;
}

/// Provisioner for EC2 clusters
pub struct Ec2Provisioner {
    api: Arc<dyn Ec2Api>,
    config: Ec2Config,
    domain: Option<String>,
    pool: LaunchPool,
}

impl Ec2Provisioner {
    /// Create a provisioner for `domain`
    ///
    /// Without a domain only `run` with explicit subnet and security group
    /// ids is possible.
    pub fn new(api: Arc<dyn Ec2Api>, config: Ec2Config, domain: Option<String>) -> Self {
        Self {
            api,
            config,
            domain,
            pool: LaunchPool::new(DEFAULT_LAUNCH_CONCURRENCY),
        }
    }

    /// Bound in-flight launches per role group
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.pool = LaunchPool::new(concurrency);
        self
    }

    fn domain(&self, operation: &str) -> Result<&str> {
        self.domain.as_deref().ok_or_else(|| {
            Error::validation(format!("ec2 {operation} requires a cluster domain"))
        })
    }

    fn err(operation: &'static str) -> impl FnOnce(ApiError) -> Error {
        move |source| ProviderError::new(PROVIDER, operation, source).into()
    }

    /// Find the scaffold for this domain
    ///
    /// If several VPCs carry the domain tag, the lowest VPC id wins.
    pub async fn lookup(&self) -> Result<Option<NetworkTopology>> {
        let domain = self.domain("lookup")?;
        let mut found = self
            .api
            .find_networks(domain)
            .await
            .map_err(Self::err("find-networks"))?;
        if let Some(vpc_id) = &self.config.vpc_id {
            found.retain(|t| &t.vpc_id == vpc_id);
        }
        found.sort_by(|a, b| a.vpc_id.cmp(&b.vpc_id));

        if found.len() > 1 {
            let ids: Vec<&str> = found.iter().map(|t| t.vpc_id.as_str()).collect();
            warn!(
                domain = %domain,
                vpcs = ?ids,
                chosen = %found[0].vpc_id,
                "multiple network scaffolds tagged for domain, using the first"
            );
        }
        Ok(found.into_iter().next())
    }

    /// Find the scaffold, creating it when absent
    pub async fn ensure_network(&self) -> Result<(NetworkTopology, bool)> {
        if let Some(topology) = self.lookup().await? {
            info!(vpc_id = %topology.vpc_id, "reusing existing network scaffold");
            return Ok((topology, false));
        }
        Ok((self.create_network().await?, true))
    }

    async fn create_network(&self) -> Result<NetworkTopology> {
        let domain = self.domain("setup")?;
        let tags = |name: &str| {
            vec![
                Tag::new("Name", format!("{domain}-{name}")),
                Tag::new(TAG_DOMAIN, domain),
            ]
        };

        let vpc_id = match &self.config.vpc_id {
            Some(id) => {
                // Later lookups only see VPCs carrying the domain tag
                self.api
                    .tag_resource(id, &[Tag::new(TAG_DOMAIN, domain)])
                    .await
                    .map_err(Self::err("tag-vpc"))?;
                info!(vpc_id = %id, "tagged existing vpc for domain");
                id.clone()
            }
            None => {
                let id = self
                    .api
                    .create_vpc(self.config.vpc_cidr, &tags("vpc"))
                    .await
                    .map_err(Self::err("create-vpc"))?;
                info!(vpc_id = %id, cidr = %self.config.vpc_cidr, "created vpc");
                id
            }
        };

        let external_subnet_id = self
            .api
            .create_subnet(&vpc_id, self.config.external_subnet_cidr, &tags("external"))
            .await
            .map_err(Self::err("create-subnet"))?;
        let internal_subnet_id = self
            .api
            .create_subnet(&vpc_id, self.config.internal_subnet_cidr, &tags("internal"))
            .await
            .map_err(Self::err("create-subnet"))?;

        let security_group_id = self
            .api
            .create_security_group(&vpc_id, &format!("{domain}-cluster"), &tags("cluster"))
            .await
            .map_err(Self::err("create-security-group"))?;
        self.api
            .authorize_ingress(&security_group_id, &self.security_rules(&security_group_id))
            .await
            .map_err(Self::err("authorize-ingress"))?;

        info!(
            vpc_id = %vpc_id,
            external_subnet_id = %external_subnet_id,
            internal_subnet_id = %internal_subnet_id,
            security_group_id = %security_group_id,
            "created network scaffold"
        );
        Ok(NetworkTopology {
            vpc_id,
            external_subnet_id,
            external_subnet_cidr: self.config.external_subnet_cidr,
            internal_subnet_id,
            internal_subnet_cidr: self.config.internal_subnet_cidr,
            security_group_id,
        })
    }

    /// Intra-cluster etcd and overlay traffic plus operator ingress
    fn security_rules(&self, group_id: &str) -> Vec<SecurityRule> {
        let group = |protocol: &str, from_port, to_port| SecurityRule {
            protocol: protocol.to_string(),
            from_port,
            to_port,
            source: RuleSource::Group(group_id.to_string()),
        };
        let mut rules = vec![
            group("tcp", ETCD_PORTS.0, ETCD_PORTS.1),
            group("udp", FLANNEL_UDP_PORT, FLANNEL_UDP_PORT),
            group("udp", FLANNEL_VXLAN_PORT, FLANNEL_VXLAN_PORT),
        ];
        rules.extend(self.config.ingress.iter().map(|rule| SecurityRule {
            protocol: rule.protocol.clone(),
            from_port: rule.from_port,
            to_port: rule.to_port,
            source: RuleSource::Cidr(rule.cidr),
        }));
        rules
    }

    fn request(
        &self,
        document: &BootDocument,
        hostname: String,
        host_index: Option<u32>,
        subnet_id: &str,
        security_group_id: &str,
        public_ip: PublicIpPolicy,
    ) -> InstanceRequest {
        let mut tags = vec![Tag::new("Name", hostname.clone())];
        if let Some(domain) = &self.domain {
            tags.push(Tag::new(TAG_DOMAIN, domain.clone()));
        }
        if let Some(role) = document.role() {
            tags.push(Tag::new(TAG_ROLE, role.as_str()));
        }
        if let Some(index) = host_index {
            tags.push(Tag::new(TAG_HOST_INDEX, index.to_string()));
        }
        InstanceRequest {
            hostname,
            image_id: self.config.image_id.clone(),
            instance_type: self.config.instance_type.clone(),
            key_pair: self.config.key_pair.clone(),
            subnet_id: subnet_id.to_string(),
            security_group_id: security_group_id.to_string(),
            user_data: document.to_base64(),
            public_ip,
            iam_role: self.config.iam_role.clone(),
            tags,
        }
    }

    async fn launch(
        &self,
        request: InstanceRequest,
        role: Option<NodeRole>,
        host_index: Option<u32>,
    ) -> std::result::Result<InstanceHandle, ProviderError> {
        let slot = |err: ProviderError| match (role, host_index) {
            (Some(role), Some(index)) => err.with_slot(role, index),
            _ => err,
        };
        let (id, mut public_ip) = self
            .api
            .run_instance(&request)
            .await
            .map_err(|e| slot(ProviderError::new(PROVIDER, "run-instance", e)))?;

        if request.public_ip == PublicIpPolicy::Elastic {
            let ip = self
                .api
                .allocate_elastic_ip(&id)
                .await
                .map_err(|e| {
                    slot(ProviderError::new(PROVIDER, "allocate-elastic-ip", e).with_instance(&id))
                })?;
            public_ip = Some(ip);
        }

        Ok(InstanceHandle {
            id,
            hostname: request.hostname,
            role,
            host_index,
            public_ip,
        })
    }

    /// Subnet and security group for a single run
    async fn run_target(&self, role: Option<NodeRole>) -> Result<(String, String)> {
        if let (Some(subnet), Some(group)) =
            (self.config.subnet_ids.first(), &self.config.security_group_id)
        {
            return Ok((subnet.clone(), group.clone()));
        }
        let topology = self.lookup().await?.ok_or_else(|| {
            Error::from(ProviderError::new(
                PROVIDER,
                "find-networks",
                ApiError::not_found(format!(
                    "no network scaffold tagged for {}; run setup first",
                    self.domain.as_deref().unwrap_or_default()
                )),
            ))
        })?;
        Ok((
            topology.subnet_for(role).to_string(),
            topology.security_group_id.clone(),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for Ec2Provisioner {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn setup(&self) -> Result<SetupReport> {
        let (topology, created) = self.ensure_network().await?;
        Ok(SetupReport {
            created,
            resources: vec![
                topology.vpc_id,
                topology.external_subnet_id,
                topology.internal_subnet_id,
                topology.security_group_id,
            ],
        })
    }

    async fn deploy(
        &self,
        documents: Vec<BootDocument>,
        cancel: CancellationToken,
    ) -> Result<DeployReport> {
        self.config.validate_launch()?;

        let mut planned = Vec::with_capacity(documents.len());
        for document in &documents {
            match (document.role(), document.host_index(), document.host()) {
                (Some(role), Some(host_index), Some(host)) => {
                    planned.push((role, host_index, host.to_string()))
                }
                _ => {
                    return Err(Error::validation(
                        "deploy requires documents rendered for a role and host",
                    ))
                }
            }
        }

        let (topology, _) = self.ensure_network().await?;

        let slots: Vec<_> = documents
            .iter()
            .zip(planned)
            .map(|(document, (role, host_index, hostname))| {
                let public_ip = match role {
                    NodeRole::Edge => self.config.public_ip,
                    _ => PublicIpPolicy::None,
                };
                LaunchSlot {
                    role,
                    host_index,
                    request: self.request(
                        document,
                        hostname,
                        Some(host_index),
                        topology.subnet_for(Some(role)),
                        &topology.security_group_id,
                        public_ip,
                    ),
                }
            })
            .collect();

        info!(
            instances = slots.len(),
            vpc_id = %topology.vpc_id,
            "launching cluster instances"
        );
        self.pool
            .run(slots, &cancel, |role, host_index, request| {
                self.launch(request, Some(role), Some(host_index))
            })
            .await
    }

    async fn run(&self, document: &BootDocument) -> Result<InstanceHandle> {
        self.config.validate_launch()?;
        let hostname = document
            .host()
            .ok_or_else(|| Error::validation("ec2 run requires a hostname"))?
            .to_string();
        let (subnet_id, security_group_id) = self.run_target(document.role()).await?;
        let request = self.request(
            document,
            hostname,
            document.host_index(),
            &subnet_id,
            &security_group_id,
            self.config.public_ip,
        );
        let handle = self
            .launch(request, document.role(), document.host_index())
            .await?;
        info!(id = %handle.id, hostname = %handle.hostname, "launched instance");
        Ok(handle)
    }
}
