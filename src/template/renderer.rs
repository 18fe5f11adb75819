//! Cloud-config renderer
//!
//! Composes the per-role boot document from a resolved cluster. The document
//! is built as typed values and serialized in one pass, so field order and
//! therefore output bytes are fixed for a given input.

use minijinja::{context, Value};
use serde::Serialize;
use tracing::debug;

use super::document::{BootDocument, CLOUD_CONFIG_HEADER};
use super::engine::TemplateEngine;
use super::error::TemplateError;
use super::units::{self, UnitTemplate, FIREWALL_RULES, FIREWALL_RULES_PATH};
use crate::bootstrap::ClusterBootstrap;
use crate::config::{NodeRole, StorageConfig};
use crate::Result;

const CA_CERT_PATH: &str = "/etc/ssl/certs/ca.pem";
const DNS_ENV_PATH: &str = "/etc/kato/ns1dns.env";
const VOLUME_CONFIG_PATH: &str = "/etc/rexray/config.yml";

#[derive(Serialize)]
struct CloudConfig<'a> {
    hostname: &'a str,
    write_files: Vec<WriteFile>,
    coreos: CoreOs,
}

#[derive(Serialize)]
struct WriteFile {
    path: &'static str,
    permissions: &'static str,
    content: String,
}

#[derive(Serialize)]
struct CoreOs {
    etcd2: Etcd2,
    flannel: Flannel,
    units: Vec<Unit>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Etcd2 {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    discovery: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    advertise_client_urls: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_advertise_peer_urls: Option<&'static str>,
    listen_client_urls: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    listen_peer_urls: Option<&'static str>,
}

impl Etcd2 {
    fn for_role(role: NodeRole, name: String, discovery: String) -> Self {
        match role {
            NodeRole::Master => Self {
                name: Some(name),
                discovery,
                proxy: None,
                advertise_client_urls: Some("http://$private_ipv4:2379"),
                initial_advertise_peer_urls: Some("http://$private_ipv4:2380"),
                listen_client_urls: "http://0.0.0.0:2379",
                listen_peer_urls: Some("http://$private_ipv4:2380"),
            },
            NodeRole::Node | NodeRole::Edge => Self {
                name: None,
                discovery,
                proxy: Some("on"),
                advertise_client_urls: None,
                initial_advertise_peer_urls: None,
                listen_client_urls: "http://127.0.0.1:2379",
                listen_peer_urls: None,
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Flannel {
    interface: &'static str,
    etcd_prefix: &'static str,
}

#[derive(Serialize)]
struct Unit {
    name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(rename = "drop-ins", skip_serializing_if = "Vec::is_empty")]
    drop_ins: Vec<DropIn>,
}

#[derive(Serialize)]
struct DropIn {
    name: &'static str,
    content: String,
}

#[derive(Serialize)]
struct VolumeDriverConfig<'a> {
    libstorage: LibStorage<'a>,
}

#[derive(Serialize)]
struct LibStorage<'a> {
    service: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<&'a str>,
}

/// Renders per-role cloud-config boot documents
///
/// Rendering performs no I/O; documents for different nodes can be produced
/// concurrently from the same [`ClusterBootstrap`].
#[derive(Default)]
pub struct CloudConfigRenderer {
    engine: TemplateEngine,
}

impl CloudConfigRenderer {
    /// Create a renderer
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the boot document for one node
    ///
    /// # Errors
    ///
    /// `TemplateError::MissingField` when the DNS API credential is absent,
    /// since every role registers itself in DNS.
    pub fn render(
        &self,
        cluster: &ClusterBootstrap,
        role: NodeRole,
        host_index: u32,
    ) -> Result<BootDocument> {
        let config = &cluster.config;
        let dns_api_key = config
            .dns_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| TemplateError::missing_field(role, "dns_api_key"))?;

        let hostname = config.hostname(role, host_index);
        let short_name = format!("{role}-{host_index}");
        let ctx = context! {
            hostname => &hostname,
            short_name => &short_name,
            domain => &config.domain,
            role => role.as_str(),
            network_json => cluster.plan.to_network_json()?,
            overlay_network => cluster.plan.network.to_string(),
            storage_driver => config.storage.as_ref().map(|s| s.driver.as_str()),
        };

        let mut unit_templates: Vec<&UnitTemplate> = units::units_for(role).to_vec();
        if config.storage.is_some() {
            unit_templates.push(units::volume_driver_unit());
        }
        let units = unit_templates
            .into_iter()
            .map(|unit| self.render_unit(unit, &ctx))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut write_files = Vec::new();
        if let Some(pem) = &config.ca_cert {
            write_files.push(WriteFile {
                path: CA_CERT_PATH,
                permissions: "0644",
                content: with_trailing_newline(pem),
            });
        }
        write_files.push(WriteFile {
            path: DNS_ENV_PATH,
            permissions: "0600",
            content: format!("NS1_API_KEY={dns_api_key}\n"),
        });
        if let Some(storage) = &config.storage {
            write_files.push(WriteFile {
                path: VOLUME_CONFIG_PATH,
                permissions: "0644",
                content: volume_driver_config(storage)?,
            });
        }
        write_files.push(WriteFile {
            path: FIREWALL_RULES_PATH,
            permissions: "0644",
            content: self.engine.render(FIREWALL_RULES, &ctx)?,
        });

        let document = CloudConfig {
            hostname: &hostname,
            write_files,
            coreos: CoreOs {
                etcd2: Etcd2::for_role(role, short_name.clone(), cluster.discovery_url()),
                flannel: Flannel {
                    interface: "$private_ipv4",
                    etcd_prefix: "/coreos.com/network",
                },
                units,
            },
        };

        let body = serde_yaml::to_string(&document)
            .map_err(|e| TemplateError::Serialization(e.to_string()))?;
        let text = format!("{CLOUD_CONFIG_HEADER}\n{body}");

        debug!(
            role = %role,
            host_index,
            compressed = config.compress,
            bytes = text.len(),
            "rendered boot document"
        );
        Ok(BootDocument::rendered(
            text,
            role,
            host_index,
            hostname,
            config.compress,
        )?)
    }

    /// Render every planned node, masters first and in host index order
    pub fn render_all(&self, cluster: &ClusterBootstrap) -> Result<Vec<BootDocument>> {
        let nodes = cluster.config.nodes;
        let mut documents = Vec::with_capacity(nodes.total() as usize);
        for role in NodeRole::ALL {
            for host_index in 0..nodes.get(role) {
                documents.push(self.render(cluster, role, host_index)?);
            }
        }
        Ok(documents)
    }

    fn render_unit(&self, unit: &UnitTemplate, ctx: &Value) -> std::result::Result<Unit, TemplateError> {
        let content = unit
            .content
            .map(|body| self.engine.render(body, ctx))
            .transpose()?;
        let drop_ins = unit
            .drop_ins
            .iter()
            .map(|&(name, body)| {
                self.engine
                    .render(body, ctx)
                    .map(|content| DropIn { name, content })
            })
            .collect::<std::result::Result<Vec<_>, TemplateError>>()?;
        Ok(Unit {
            name: unit.name,
            command: unit.command,
            enable: unit.enable,
            content,
            drop_ins,
        })
    }
}

fn volume_driver_config(storage: &StorageConfig) -> std::result::Result<String, TemplateError> {
    let config = VolumeDriverConfig {
        libstorage: LibStorage {
            service: storage.driver.as_str(),
            endpoint: storage.endpoint.as_deref(),
        },
    };
    serde_yaml::to_string(&config).map_err(|e| TemplateError::Serialization(e.to_string()))
}

fn with_trailing_newline(s: &str) -> String {
    if s.ends_with('\n') {
        s.to_string()
    } else {
        format!("{s}\n")
    }
}
