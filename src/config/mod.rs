//! Cluster and provider configuration
//!
//! - [`ClusterConfig`] - one cluster-formation request (domain, role counts,
//!   etcd token source, overlay network, credentials, storage)
//! - [`ProviderConfig`] - backend selection with EC2 or Packet parameters
//! - [`ConfigFile`] - versioned YAML schema both are loaded from

mod cluster;
mod file;
mod provider;

pub use cluster::{
    ClusterConfig, EtcdToken, FlannelBackend, FlannelConfig, NodeCounts, NodeRole,
    StorageConfig, StorageDriver, DEFAULT_DISCOVERY_ENDPOINT, DEFAULT_FLANNEL_NETWORK,
    VALID_MASTER_COUNTS,
};
pub use file::{load_config, ClusterFile, ConfigFile, LegacyUdata, LoadedConfig, RenderTarget};
pub use provider::{
    BillingTerm, Ec2Config, IngressRule, PacketConfig, ProviderConfig, PublicIpPolicy,
};
