//! Cluster formation request
//!
//! A [`ClusterConfig`] is built once per invocation from validated input and
//! is never mutated afterwards. Every node's boot document is derived from
//! the same value, which is what keeps independently launched machines in
//! agreement.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::flannel::{AllocationPlan, FlannelSubnetAllocator};
use crate::{Error, Result};

/// Default etcd discovery service
pub const DEFAULT_DISCOVERY_ENDPOINT: &str = "https://discovery.etcd.io";

/// Default overlay network range
pub const DEFAULT_FLANNEL_NETWORK: &str = "10.128.0.0/21";

/// Master counts that keep etcd quorum safe
pub const VALID_MASTER_COUNTS: [u32; 3] = [1, 3, 5];

/// Function of a node in the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Coordination plane: runs the etcd server
    Master,
    /// Workload capacity
    Node,
    /// Ingress-facing workload capacity
    Edge,
}

impl NodeRole {
    /// All roles in launch order
    pub const ALL: [NodeRole; 3] = [NodeRole::Master, NodeRole::Node, NodeRole::Edge];

    /// Lowercase role name as used in hostnames and tags
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Node => "node",
            Self::Edge => "edge",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "node" => Ok(Self::Node),
            "edge" => Ok(Self::Edge),
            _ => Err(Error::validation(format!(
                "invalid role: {s}, expected one of: master, node, edge"
            ))),
        }
    }
}

/// Number of instances planned per role
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeCounts {
    /// Masters (1, 3 or 5)
    pub master: u32,
    /// Workload nodes
    #[serde(default)]
    pub node: u32,
    /// Edge nodes
    #[serde(default)]
    pub edge: u32,
}

impl Default for NodeCounts {
    fn default() -> Self {
        Self {
            master: 1,
            node: 0,
            edge: 0,
        }
    }
}

impl NodeCounts {
    /// Total number of planned hosts, saturating at `u32::MAX`
    pub fn total(&self) -> u32 {
        self.checked_total().unwrap_or(u32::MAX)
    }

    /// Total number of planned hosts, `None` on overflow
    pub fn checked_total(&self) -> Option<u32> {
        self.master.checked_add(self.node)?.checked_add(self.edge)
    }

    /// Planned count for one role
    pub fn get(&self, role: NodeRole) -> u32 {
        match role {
            NodeRole::Master => self.master,
            NodeRole::Node => self.node,
            NodeRole::Edge => self.edge,
        }
    }

    /// Validates master quorum size
    pub fn validate(&self) -> Result<()> {
        if !VALID_MASTER_COUNTS.contains(&self.master) {
            return Err(Error::validation(format!(
                "master count must be one of 1, 3, 5 for etcd quorum (got {})",
                self.master
            )));
        }
        if self.checked_total().is_none() {
            return Err(Error::validation("planned host count overflows"));
        }
        Ok(())
    }
}

/// Overlay network backend type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FlannelBackend {
    /// Userspace UDP encapsulation
    Udp,
    /// In-kernel VXLAN
    #[default]
    Vxlan,
    /// Direct routes between hosts on the same L2
    HostGw,
    /// Google Compute Engine routes
    Gce,
    /// AWS VPC route tables
    AwsVpc,
    /// Allocation only, no data path
    Alloc,
}

impl FlannelBackend {
    /// Backend type string understood by flanneld
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Vxlan => "vxlan",
            Self::HostGw => "host-gw",
            Self::Gce => "gce",
            Self::AwsVpc => "aws-vpc",
            Self::Alloc => "alloc",
        }
    }
}

impl fmt::Display for FlannelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlannelBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "vxlan" => Ok(Self::Vxlan),
            "host-gw" => Ok(Self::HostGw),
            "gce" => Ok(Self::Gce),
            "aws-vpc" => Ok(Self::AwsVpc),
            "alloc" => Ok(Self::Alloc),
            _ => Err(Error::validation(format!(
                "invalid flannel backend: {s}, expected one of: udp, vxlan, host-gw, gce, aws-vpc, alloc"
            ))),
        }
    }
}

/// Overlay network partitioning parameters
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FlannelConfig {
    /// Entire overlay network
    #[serde(default = "default_flannel_network")]
    pub network: Ipv4Net,
    /// Prefix length of the subnet leased to each host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_len: Option<u8>,
    /// First allocatable subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_min: Option<Ipv4Addr>,
    /// Last allocatable subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_max: Option<Ipv4Addr>,
    /// Data path backend
    #[serde(default)]
    pub backend: FlannelBackend,
}

fn default_flannel_network() -> Ipv4Net {
    DEFAULT_FLANNEL_NETWORK
        .parse()
        .unwrap_or_else(|_| Ipv4Net::default())
}

impl Default for FlannelConfig {
    fn default() -> Self {
        Self {
            network: default_flannel_network(),
            subnet_len: None,
            subnet_min: None,
            subnet_max: None,
            backend: FlannelBackend::default(),
        }
    }
}

/// Source of the etcd discovery token
///
/// Resolution happens once per cluster in
/// [`EtcdBootstrapCoordinator`](crate::bootstrap::EtcdBootstrapCoordinator).
#[derive(Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum EtcdToken {
    /// Request a fresh token from the discovery service
    #[default]
    Auto,
    /// Operator-supplied token, used verbatim
    Supplied(String),
}

impl EtcdToken {
    /// Map raw input to a token source; empty and "auto" request issuance
    pub fn from_input(input: Option<&str>) -> Self {
        match input.map(str::trim) {
            None | Some("") => Self::Auto,
            Some(s) if s.eq_ignore_ascii_case("auto") => Self::Auto,
            Some(s) => Self::Supplied(s.to_string()),
        }
    }
}

impl From<Option<String>> for EtcdToken {
    fn from(value: Option<String>) -> Self {
        Self::from_input(value.as_deref())
    }
}

impl From<EtcdToken> for Option<String> {
    fn from(value: EtcdToken) -> Self {
        match value {
            EtcdToken::Auto => None,
            EtcdToken::Supplied(s) => Some(s),
        }
    }
}

impl fmt::Debug for EtcdToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "Auto"),
            Self::Supplied(_) => write!(f, "Supplied(<redacted>)"),
        }
    }
}

/// Block storage volume driver
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// Amazon Elastic Block Store
    Ebs,
    /// Amazon Elastic File System
    Efs,
    /// OpenStack Cinder
    Cinder,
}

impl StorageDriver {
    /// Driver name understood by the volume plugin
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ebs => "ebs",
            Self::Efs => "efs",
            Self::Cinder => "cinder",
        }
    }
}

/// Block storage configuration embedded in boot documents
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Selected driver
    pub driver: StorageDriver,
    /// Storage API endpoint (required for cinder)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl StorageConfig {
    /// Validates driver parameters
    pub fn validate(&self) -> Result<()> {
        match (&self.driver, self.endpoint.as_deref()) {
            (StorageDriver::Cinder, None) | (StorageDriver::Cinder, Some("")) => Err(
                Error::validation("storage driver cinder requires an endpoint"),
            ),
            (_, Some(endpoint)) if !endpoint.starts_with("http") => Err(Error::validation(
                format!("storage endpoint must be an http(s) URL: {endpoint}"),
            )),
            _ => Ok(()),
        }
    }
}

/// One cluster-formation request
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// DNS domain every host registers under
    pub domain: String,
    /// Planned instances per role
    #[serde(default)]
    pub nodes: NodeCounts,
    /// Etcd discovery token source
    #[serde(default)]
    pub etcd_token: EtcdToken,
    /// Etcd discovery service base URL
    #[serde(default = "default_discovery_endpoint")]
    pub discovery_endpoint: String,
    /// Overlay network parameters
    #[serde(default)]
    pub flannel: FlannelConfig,
    /// DNS provider API credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_api_key: Option<String>,
    /// CA certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    /// Block storage driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    /// Gzip rendered boot documents
    #[serde(default)]
    pub compress: bool,
}

fn default_discovery_endpoint() -> String {
    DEFAULT_DISCOVERY_ENDPOINT.to_string()
}

impl ClusterConfig {
    /// Create a single-master cluster with defaults for everything else
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            nodes: NodeCounts::default(),
            etcd_token: EtcdToken::Auto,
            discovery_endpoint: default_discovery_endpoint(),
            flannel: FlannelConfig::default(),
            dns_api_key: None,
            ca_cert: None,
            storage: None,
            compress: false,
        }
    }

    /// Hostname of a cluster member: `role-index.domain`
    pub fn hostname(&self, role: NodeRole, host_index: u32) -> String {
        format!("{}-{}.{}", role, host_index, self.domain)
    }

    /// Validate every invariant and freeze the overlay allocation plan
    ///
    /// Performs no I/O, so failures here guarantee that no provider call
    /// has been made.
    pub fn validate(&self) -> Result<AllocationPlan> {
        validate_domain(&self.domain)?;
        self.nodes.validate()?;

        if !self.discovery_endpoint.starts_with("http://")
            && !self.discovery_endpoint.starts_with("https://")
        {
            return Err(Error::validation(format!(
                "discovery endpoint must be an http(s) URL: {}",
                self.discovery_endpoint
            )));
        }

        if let Some(storage) = &self.storage {
            storage.validate()?;
        }

        FlannelSubnetAllocator::new(self.nodes.total()).allocate(&self.flannel)
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("domain", &self.domain)
            .field("nodes", &self.nodes)
            .field("etcd_token", &self.etcd_token)
            .field("discovery_endpoint", &self.discovery_endpoint)
            .field("flannel", &self.flannel)
            .field("dns_api_key", &self.dns_api_key.as_ref().map(|_| "<redacted>"))
            .field("ca_cert", &self.ca_cert.is_some())
            .field("storage", &self.storage)
            .field("compress", &self.compress)
            .finish()
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(Error::validation("domain must not be empty"));
    }
    if domain.len() > 253 {
        return Err(Error::validation("domain exceeds 253 characters"));
    }
    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(Error::validation(format!(
                "domain '{domain}' contains an invalid label '{label}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(master: u32, node: u32, edge: u32) -> ClusterConfig {
        let mut config = ClusterConfig::new("example.com");
        config.nodes = NodeCounts { master, node, edge };
        config
    }

    mod node_counts {
        use super::*;

        #[test]
        fn test_quorum_sizes_accepted() {
            for master in VALID_MASTER_COUNTS {
                assert!(cluster(master, 2, 1).validate().is_ok());
            }
        }

        #[test]
        fn test_even_or_zero_masters_rejected() {
            for master in [0, 2, 4, 6, 7] {
                let err = cluster(master, 0, 0).validate().unwrap_err();
                assert!(matches!(err, Error::Validation(_)), "{master}: {err}");
                assert!(err.to_string().contains("1, 3, 5"));
            }
        }

        #[test]
        fn test_total_and_get() {
            let counts = NodeCounts {
                master: 3,
                node: 2,
                edge: 1,
            };
            assert_eq!(counts.total(), 6);
            assert_eq!(counts.get(NodeRole::Node), 2);
            assert_eq!(counts.get(NodeRole::Edge), 1);
        }

        #[test]
        fn test_oversized_counts_are_rejected_not_wrapped() {
            let config = cluster(1, u32::MAX, 1);
            assert_eq!(config.nodes.checked_total(), None);
            assert_eq!(config.nodes.total(), u32::MAX);

            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
            assert!(err.to_string().contains("overflows"));
        }
    }

    mod roles {
        use super::*;

        #[test]
        fn test_role_parsing_is_case_insensitive() {
            assert_eq!("MASTER".parse::<NodeRole>().unwrap(), NodeRole::Master);
            assert_eq!("edge".parse::<NodeRole>().unwrap(), NodeRole::Edge);
            assert!("worker".parse::<NodeRole>().is_err());
        }

        #[test]
        fn test_hostname_derivation() {
            let config = cluster(3, 2, 0);
            assert_eq!(
                config.hostname(NodeRole::Master, 0),
                "master-0.example.com"
            );
            assert_eq!(config.hostname(NodeRole::Node, 1), "node-1.example.com");
        }
    }

    mod etcd_token {
        use super::*;

        #[test]
        fn test_sentinels_map_to_auto() {
            assert_eq!(EtcdToken::from_input(None), EtcdToken::Auto);
            assert_eq!(EtcdToken::from_input(Some("")), EtcdToken::Auto);
            assert_eq!(EtcdToken::from_input(Some("auto")), EtcdToken::Auto);
            assert_eq!(EtcdToken::from_input(Some("AUTO")), EtcdToken::Auto);
        }

        #[test]
        fn test_supplied_token_kept_verbatim() {
            assert_eq!(
                EtcdToken::from_input(Some("3f5a9c")),
                EtcdToken::Supplied("3f5a9c".to_string())
            );
        }

        #[test]
        fn test_debug_redacts_token() {
            let token = EtcdToken::Supplied("secret-token".to_string());
            assert!(!format!("{token:?}").contains("secret-token"));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn test_invalid_domains_rejected() {
            for domain in ["", "bad domain.com", "-lead.com", "a..b"] {
                let config = ClusterConfig::new(domain);
                assert!(
                    matches!(config.validate(), Err(Error::Validation(_))),
                    "{domain}"
                );
            }
        }

        #[test]
        fn test_subnet_min_outside_network_is_range_error() {
            let mut config = cluster(1, 0, 0);
            config.flannel.subnet_min = Some(Ipv4Addr::new(192, 168, 0, 0));
            assert!(matches!(config.validate(), Err(Error::Range(_))));
        }

        #[test]
        fn test_cinder_requires_endpoint() {
            let mut config = cluster(1, 0, 0);
            config.storage = Some(StorageConfig {
                driver: StorageDriver::Cinder,
                endpoint: None,
            });
            assert!(matches!(config.validate(), Err(Error::Validation(_))));

            config.storage = Some(StorageConfig {
                driver: StorageDriver::Cinder,
                endpoint: Some("https://keystone.example.com:5000/v3".to_string()),
            });
            assert!(config.validate().is_ok());
        }

        #[test]
        fn test_debug_redacts_dns_key() {
            let mut config = cluster(1, 0, 0);
            config.dns_api_key = Some("ns1-secret".to_string());
            assert!(!format!("{config:?}").contains("ns1-secret"));
        }
    }

    mod serde_shape {
        use super::*;

        #[test]
        fn test_minimal_yaml_uses_defaults() {
            let config: ClusterConfig = serde_yaml::from_str("domain: example.com").unwrap();
            assert_eq!(config.nodes, NodeCounts::default());
            assert_eq!(config.etcd_token, EtcdToken::Auto);
            assert_eq!(config.discovery_endpoint, DEFAULT_DISCOVERY_ENDPOINT);
            assert_eq!(config.flannel.network.to_string(), DEFAULT_FLANNEL_NETWORK);
            assert_eq!(config.flannel.backend, FlannelBackend::Vxlan);
            assert!(!config.compress);
        }

        #[test]
        fn test_backend_names_match_flanneld() {
            let config: FlannelConfig =
                serde_yaml::from_str("network: 10.1.0.0/16\nbackend: host-gw").unwrap();
            assert_eq!(config.backend, FlannelBackend::HostGw);
            assert_eq!("aws-vpc".parse::<FlannelBackend>().unwrap().as_str(), "aws-vpc");
        }
    }
}
