//! Boot document rendering
//!
//! A boot document is a cloud-config file consumed by the node's init
//! system on first boot. It carries:
//! - the etcd section (server on masters, proxy elsewhere) pointing at the
//!   shared discovery URL
//! - the flannel section and, on masters, the overlay network config
//! - the role's systemd units and firewall rules
//! - file drops for the CA certificate, DNS credential and volume driver
//!
//! Unit bodies are minijinja templates rendered with strict undefined
//! handling; the surrounding document is typed and serialized with
//! serde_yaml.

mod document;
mod engine;
mod error;
mod renderer;
mod units;

pub use document::{BootDocument, CLOUD_CONFIG_HEADER};
pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use renderer::CloudConfigRenderer;
