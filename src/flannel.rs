//! Overlay network (flannel) subnet allocation parameters
//!
//! Hosts lease their own subnets at runtime through flannel's etcd-backed
//! coordination. What every boot document must agree on is the set of
//! partitioning rules: network, per-host subnet length and the allocatable
//! window. [`FlannelSubnetAllocator`] validates those rules against the
//! planned cluster size and freezes them into an [`AllocationPlan`].
//!
//! Allocation is pure: identical inputs always produce an identical plan, so
//! every node can compute it independently.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;

use crate::config::{FlannelBackend, FlannelConfig};
use crate::{Error, Result};

/// Subnet length flannel leases when none is configured
pub const DEFAULT_SUBNET_LEN: u8 = 24;

/// Longest subnet that still leaves usable container addresses
pub const MAX_SUBNET_LEN: u8 = 30;

/// Frozen overlay partitioning rules
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Entire overlay network
    pub network: Ipv4Net,
    /// Prefix length leased to each host
    pub subnet_len: u8,
    /// First allocatable subnet
    pub subnet_min: Ipv4Addr,
    /// Last allocatable subnet
    pub subnet_max: Ipv4Addr,
    /// Number of subnets in the window
    pub capacity: u32,
    /// Data path backend
    pub backend: FlannelBackend,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkConfig<'a> {
    network: String,
    subnet_len: u8,
    subnet_min: String,
    subnet_max: String,
    backend: BackendConfig<'a>,
}

#[derive(Serialize)]
struct BackendConfig<'a> {
    #[serde(rename = "Type")]
    type_: &'a str,
}

impl AllocationPlan {
    /// Network configuration document flanneld reads from etcd
    pub fn to_network_json(&self) -> Result<String> {
        let config = NetworkConfig {
            network: self.network.to_string(),
            subnet_len: self.subnet_len,
            subnet_min: self.subnet_min.to_string(),
            subnet_max: self.subnet_max.to_string(),
            backend: BackendConfig {
                type_: self.backend.as_str(),
            },
        };
        serde_json::to_string(&config).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Validates overlay parameters for a cluster of a given size
#[derive(Clone, Copy, Debug)]
pub struct FlannelSubnetAllocator {
    hosts: u32,
}

impl FlannelSubnetAllocator {
    /// Allocator for a cluster planning `hosts` members
    pub fn new(hosts: u32) -> Self {
        Self { hosts }
    }

    /// Validate the overlay parameters and freeze them into a plan
    ///
    /// Missing bounds default the way flanneld does: the window starts at
    /// the second subnet of the network and ends at the last one.
    pub fn allocate(&self, config: &FlannelConfig) -> Result<AllocationPlan> {
        let network = config.network.trunc();
        let prefix = network.prefix_len();
        let subnet_len = config.subnet_len.unwrap_or(DEFAULT_SUBNET_LEN);

        if subnet_len <= prefix {
            return Err(Error::range(format!(
                "subnet length /{subnet_len} must be longer than network prefix /{prefix} of {network}"
            )));
        }
        if subnet_len > MAX_SUBNET_LEN {
            return Err(Error::range(format!(
                "subnet length /{subnet_len} leaves no usable addresses per host (max /{MAX_SUBNET_LEN})"
            )));
        }

        let block = 1u32 << (32 - u32::from(subnet_len));
        let first = u32::from(network.network());
        let last_subnet = u32::from(network.broadcast()) - (block - 1);

        let min = config.subnet_min.map(u32::from).unwrap_or(first + block);
        let max = config.subnet_max.map(u32::from).unwrap_or(last_subnet);

        for (name, addr) in [("min", min), ("max", max)] {
            let ip = Ipv4Addr::from(addr);
            if !network.contains(&ip) {
                return Err(Error::range(format!(
                    "subnet {name} {ip} is outside overlay network {network}"
                )));
            }
            if addr % block != 0 {
                return Err(Error::range(format!(
                    "subnet {name} {ip} is not aligned to /{subnet_len} boundaries"
                )));
            }
        }

        if min > max {
            return Err(Error::range(format!(
                "subnet window {} - {} is empty",
                Ipv4Addr::from(min),
                Ipv4Addr::from(max)
            )));
        }

        let capacity = (max - min) / block + 1;
        if capacity < self.hosts {
            return Err(Error::range(format!(
                "subnet window holds {capacity} /{subnet_len} subnets but the cluster plans {} hosts",
                self.hosts
            )));
        }

        Ok(AllocationPlan {
            network,
            subnet_len,
            subnet_min: Ipv4Addr::from(min),
            subnet_max: Ipv4Addr::from(max),
            capacity,
            backend: config.backend,
        })
    }
}
