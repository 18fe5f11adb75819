//! Versioned configuration file
//!
//! Two schemas are accepted and mapped onto the same core values:
//!
//! - `version: v1` - the legacy single-node `udata` field set (one host, one
//!   role, stringly typed flannel parameters)
//! - `version: v2` - the multi-role, multi-provider schema
//!
//! ```yaml
//! version: v2
//! cluster:
//!   domain: example.com
//!   nodes: { master: 3, node: 2 }
//!   dns_api_key: ...
//! ca_cert_file: certs/ca.pem
//! provider:
//!   type: ec2
//!   region: eu-west-1
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{ClusterConfig, EtcdToken, FlannelConfig, NodeCounts, NodeRole, ProviderConfig};
use crate::{Error, Result};

/// Configuration file in any supported schema version
#[derive(Debug, Deserialize)]
#[serde(tag = "version")]
pub enum ConfigFile {
    /// Legacy single-node schema
    #[serde(rename = "v1")]
    V1(LegacyUdata),
    /// Multi-role schema
    #[serde(rename = "v2")]
    V2(ClusterFile),
}

/// Legacy `udata` parameters
#[derive(Debug, Deserialize)]
pub struct LegacyUdata {
    /// Host index within the role
    pub hostid: String,
    /// DNS domain
    pub domain: String,
    /// Role name
    pub role: String,
    /// NS1 API key
    #[serde(default)]
    pub ns1_api_key: Option<String>,
    /// Path to the CA certificate
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// Etcd discovery token
    #[serde(default)]
    pub etcd_token: Option<String>,
    /// Overlay network CIDR
    #[serde(default)]
    pub flannel_network: Option<String>,
    /// Per-host subnet length
    #[serde(default)]
    pub flannel_subnet_len: Option<String>,
    /// First allocatable subnet
    #[serde(default)]
    pub flannel_subnet_min: Option<String>,
    /// Last allocatable subnet
    #[serde(default)]
    pub flannel_subnet_max: Option<String>,
    /// Overlay backend
    #[serde(default)]
    pub flannel_backend: Option<String>,
}

/// Multi-role cluster file
#[derive(Debug, Deserialize)]
pub struct ClusterFile {
    /// Cluster formation request
    pub cluster: ClusterConfig,
    /// CA certificate to read into `cluster.ca_cert`
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,
    /// Backend selection
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

/// Role and host index a legacy file was written for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    /// Node role
    pub role: NodeRole,
    /// Host index within the role
    pub host_index: u32,
}

/// Core values produced from a configuration file
#[derive(Debug)]
pub struct LoadedConfig {
    /// Cluster formation request
    pub cluster: ClusterConfig,
    /// Backend selection, if present
    pub provider: Option<ProviderConfig>,
    /// Node a legacy file describes
    pub target: Option<RenderTarget>,
}

impl ConfigFile {
    /// Parse a configuration file from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::validation(format!("invalid configuration file: {e}")))
    }

    /// Map onto core values, resolving relative paths against `base_dir`
    pub fn into_loaded(self, base_dir: &Path) -> Result<LoadedConfig> {
        match self {
            Self::V1(legacy) => legacy.into_loaded(base_dir),
            Self::V2(file) => {
                let mut cluster = file.cluster;
                if let Some(path) = file.ca_cert_file {
                    cluster.ca_cert = Some(read_ca_cert(base_dir, &path)?);
                }
                Ok(LoadedConfig {
                    cluster,
                    provider: file.provider,
                    target: None,
                })
            }
        }
    }
}

impl LegacyUdata {
    fn into_loaded(self, base_dir: &Path) -> Result<LoadedConfig> {
        let host_index: u32 = self
            .hostid
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("hostid must be a number: {}", self.hostid)))?;
        let role: NodeRole = self.role.parse()?;

        let mut flannel = FlannelConfig::default();
        if let Some(network) = non_empty(&self.flannel_network) {
            flannel.network = network.parse().map_err(|_| {
                Error::validation(format!("flannel network must be a CIDR: {network}"))
            })?;
        }
        if let Some(len) = non_empty(&self.flannel_subnet_len) {
            flannel.subnet_len = Some(len.trim_start_matches('/').parse().map_err(|_| {
                Error::validation(format!("flannel subnet length must be a number: {len}"))
            })?);
        }
        if let Some(min) = non_empty(&self.flannel_subnet_min) {
            flannel.subnet_min = Some(min.parse().map_err(|_| {
                Error::validation(format!("flannel subnet min must be an IPv4 address: {min}"))
            })?);
        }
        if let Some(max) = non_empty(&self.flannel_subnet_max) {
            flannel.subnet_max = Some(max.parse().map_err(|_| {
                Error::validation(format!("flannel subnet max must be an IPv4 address: {max}"))
            })?);
        }
        if let Some(backend) = non_empty(&self.flannel_backend) {
            flannel.backend = backend.parse()?;
        }

        let mut cluster = ClusterConfig::new(self.domain);
        cluster.nodes = legacy_counts(role, host_index)?;
        cluster.etcd_token = EtcdToken::from_input(self.etcd_token.as_deref());
        cluster.flannel = flannel;
        cluster.dns_api_key = self.ns1_api_key.filter(|k| !k.is_empty());
        if let Some(path) = self.ca_cert {
            cluster.ca_cert = Some(read_ca_cert(base_dir, &path)?);
        }

        debug!(role = %role, host_index, "mapped legacy udata configuration");
        Ok(LoadedConfig {
            cluster,
            provider: None,
            target: Some(RenderTarget { role, host_index }),
        })
    }
}

/// Smallest plan that contains the legacy host
fn legacy_counts(role: NodeRole, host_index: u32) -> Result<NodeCounts> {
    let mut counts = NodeCounts::default();
    match role {
        NodeRole::Master => {
            counts.master = match host_index {
                0 => 1,
                1 | 2 => 3,
                3 | 4 => 5,
                _ => {
                    return Err(Error::validation(format!(
                        "master hostid {host_index} exceeds the largest quorum of 5"
                    )))
                }
            };
        }
        NodeRole::Node => counts.node = host_index + 1,
        NodeRole::Edge => counts.edge = host_index + 1,
    }
    Ok(counts)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn read_ca_cert(base_dir: &Path, path: &Path) -> Result<String> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    let pem = std::fs::read_to_string(&resolved).map_err(|e| {
        Error::validation(format!(
            "failed to read CA certificate {}: {}",
            resolved.display(),
            e
        ))
    })?;
    if !pem.contains("-----BEGIN CERTIFICATE-----") {
        return Err(Error::validation(format!(
            "{} does not contain a PEM certificate",
            resolved.display()
        )));
    }
    Ok(pem)
}

/// Load and map a configuration file
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::validation(format!("failed to read {}: {}", path.display(), e))
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    ConfigFile::from_yaml(&content)?.into_loaded(base_dir)
}
