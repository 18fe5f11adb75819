//! Kato - CoreOS cluster bootstrap and provisioning
//!
//! Kato turns one cluster-formation request into per-node boot documents and
//! launches them on an infrastructure provider. Every node is rendered from
//! the same resolved etcd discovery token and overlay allocation plan, so
//! machines launched independently still agree on cluster membership.
//!
//! # Modules
//!
//! - [`config`] - Cluster and provider configuration, versioned config file
//! - [`flannel`] - Overlay network subnet allocation
//! - [`bootstrap`] - Etcd discovery token resolution
//! - [`template`] - Boot document (cloud-config) rendering
//! - [`provider`] - Infrastructure provider abstractions (EC2, Packet)
//! - [`orchestrator`] - Per-command sequencing of validate, setup, deploy and run
//! - [`retry`] - Caller-level retry for transient failures
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod flannel;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod template;

pub use error::{Error, Stage};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
