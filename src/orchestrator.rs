//! Per-invocation command driver
//!
//! [`ClusterOrchestrator`] owns the immutable configuration for one command,
//! validates it, resolves the cluster-wide etcd token once, renders boot
//! documents and hands them to the [`ProviderAdapter`] selected by the
//! configured backend. It never calls infrastructure APIs itself.
//!
//! ```text
//! Idle -> Validating -> SettingUp -> Deploying -> Done
//!                    \-> SettingUp -------------> Done
//!                    \-> Running ---------------> Done
//!                    \-> Done (generate-bootconfig)
//! any phase -> Failed(stage)
//! ```

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::{ClusterBootstrap, DiscoveryClient, EtcdBootstrapCoordinator};
use crate::config::{ClusterConfig, NodeRole, ProviderConfig};
use crate::error::Stage;
use crate::provider::{
    create_provider, ApiConnector, DeployReport, InstanceHandle, ProviderAdapter, SetupReport,
    DEFAULT_LAUNCH_CONCURRENCY,
};
use crate::template::{BootDocument, CloudConfigRenderer};
use crate::{Error, Result};

/// Where a single run gets its boot document
#[derive(Clone, Debug)]
pub enum DocumentSource {
    /// Render for a role and host index from the cluster configuration
    Render {
        /// Node role
        role: NodeRole,
        /// Host index within the role
        host_index: u32,
    },
    /// Use caller-supplied bytes verbatim
    Raw {
        /// Document bytes, gzip or plain text
        bytes: Vec<u8>,
        /// Hostname to launch the instance under
        hostname: Option<String>,
    },
}

/// One user command
#[derive(Clone, Debug)]
pub enum Command {
    /// Render a single node's boot document
    GenerateBootConfig {
        /// Node role
        role: NodeRole,
        /// Host index within the role
        host_index: u32,
    },
    /// Create or reuse provider prerequisites
    Setup,
    /// Set up, then launch every planned node
    Deploy,
    /// Launch one instance
    Run {
        /// Boot document source
        source: DocumentSource,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenerateBootConfig { .. } => write!(f, "generate-bootconfig"),
            Self::Setup => write!(f, "setup-provider"),
            Self::Deploy => write!(f, "deploy-cluster"),
            Self::Run { .. } => write!(f, "run-instance"),
        }
    }
}

/// Result of a successful command
#[derive(Debug)]
pub enum Outcome {
    /// Rendered boot document
    BootConfig(BootDocument),
    /// Prerequisites created or reused
    Setup(SetupReport),
    /// Setup plus every launched instance
    Deployed {
        /// Setup outcome
        setup: SetupReport,
        /// Launched instances
        deploy: DeployReport,
    },
    /// The single launched instance
    Launched(InstanceHandle),
}

/// Orchestration state for one invocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// Nothing started
    #[default]
    Idle,
    /// Checking configuration, resolving the token and rendering
    Validating,
    /// Provider prerequisites being created or reused
    SettingUp,
    /// Cluster instances being launched
    Deploying,
    /// Single instance being launched
    Running,
    /// Command completed
    Done,
    /// Command stopped at the given stage
    Failed(Stage),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Validating => write!(f, "Validating"),
            Self::SettingUp => write!(f, "SettingUp"),
            Self::Deploying => write!(f, "Deploying"),
            Self::Running => write!(f, "Running"),
            Self::Done => write!(f, "Done"),
            Self::Failed(stage) => write!(f, "Failed({stage})"),
        }
    }
}

/// Drives one command from validated configuration to provider calls
pub struct ClusterOrchestrator {
    cluster: Option<ClusterConfig>,
    provider: Option<ProviderConfig>,
    coordinator: EtcdBootstrapCoordinator,
    connector: Arc<dyn ApiConnector>,
    renderer: CloudConfigRenderer,
    concurrency: usize,
    phase: Phase,
}

impl ClusterOrchestrator {
    /// Create an orchestrator for one invocation
    pub fn new(
        cluster: Option<ClusterConfig>,
        provider: Option<ProviderConfig>,
        discovery: Arc<dyn DiscoveryClient>,
        connector: Arc<dyn ApiConnector>,
    ) -> Self {
        Self {
            cluster,
            provider,
            coordinator: EtcdBootstrapCoordinator::new(discovery),
            connector,
            renderer: CloudConfigRenderer::new(),
            concurrency: DEFAULT_LAUNCH_CONCURRENCY,
            phase: Phase::Idle,
        }
    }

    /// Bound in-flight launches per role group during deploy
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Execute a command
    ///
    /// Configuration is validated before anything leaves the process, and
    /// an auto etcd token is resolved exactly once per command.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn execute(&mut self, command: Command, cancel: CancellationToken) -> Result<Outcome> {
        let result = self.dispatch(command, cancel).await;
        match &result {
            Ok(_) => self.transition(Phase::Done),
            Err(e) => {
                warn!(stage = %e.stage(), error = %e, "command failed");
                self.transition(Phase::Failed(e.stage()));
            }
        }
        result
    }

    fn transition(&mut self, next: Phase) {
        debug!(from = %self.phase, to = %next, "phase transition");
        self.phase = next;
    }

    async fn dispatch(&mut self, command: Command, cancel: CancellationToken) -> Result<Outcome> {
        self.transition(Phase::Validating);
        match command {
            Command::GenerateBootConfig { role, host_index } => {
                let cluster = self.prepare(Some((role, host_index))).await?;
                let document = self.renderer.render(&cluster, role, host_index)?;
                info!(host = ?document.host(), compressed = document.is_compressed(), "rendered boot document");
                Ok(Outcome::BootConfig(document))
            }
            Command::Setup => {
                let provider = self.provider_config()?;
                if let Some(cluster) = &self.cluster {
                    cluster.validate()?;
                }
                let adapter = self.adapter(&provider).await?;
                self.transition(Phase::SettingUp);
                Ok(Outcome::Setup(adapter.setup().await?))
            }
            Command::Deploy => {
                let provider = self.provider_config()?;
                match &provider {
                    ProviderConfig::Ec2(cfg) => cfg.validate_launch()?,
                    ProviderConfig::Packet(_) => {
                        return Err(Error::Unsupported {
                            provider: provider.name(),
                            operation: "deploy",
                        })
                    }
                }
                let cluster = self.prepare(None).await?;
                let documents = self.renderer.render_all(&cluster)?;
                info!(documents = documents.len(), "rendered cluster boot documents");

                let adapter = self.adapter(&provider).await?;
                self.transition(Phase::SettingUp);
                let setup = adapter.setup().await?;
                self.transition(Phase::Deploying);
                let deploy = adapter.deploy(documents, cancel).await?;
                Ok(Outcome::Deployed { setup, deploy })
            }
            Command::Run { source } => {
                let provider = self.provider_config()?;
                let document = match source {
                    DocumentSource::Render { role, host_index } => {
                        let cluster = self.prepare(Some((role, host_index))).await?;
                        self.renderer.render(&cluster, role, host_index)?
                    }
                    DocumentSource::Raw { bytes, hostname } => {
                        if bytes.is_empty() {
                            return Err(Error::validation("supplied boot document is empty"));
                        }
                        let document = BootDocument::from_raw(bytes);
                        match hostname.filter(|h| !h.trim().is_empty()) {
                            Some(hostname) => document.with_host(hostname),
                            None => document,
                        }
                    }
                };

                let adapter = self.adapter(&provider).await?;
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled {
                        completed: 0,
                        abandoned: 1,
                    });
                }
                self.transition(Phase::Running);
                Ok(Outcome::Launched(adapter.run(&document).await?))
            }
        }
    }

    fn provider_config(&self) -> Result<ProviderConfig> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| Error::validation("no provider configured"))?;
        provider.validate()?;
        Ok(provider)
    }

    /// Validate the cluster and the requested slot, then resolve the token
    async fn prepare(&self, slot: Option<(NodeRole, u32)>) -> Result<ClusterBootstrap> {
        let config = self
            .cluster
            .clone()
            .ok_or_else(|| Error::validation("no cluster configured"))?;
        let plan = config.validate()?;
        if let Some((role, host_index)) = slot {
            check_slot(&config, role, host_index)?;
        }
        debug!(
            domain = %config.domain,
            masters = config.nodes.master,
            nodes = config.nodes.node,
            edges = config.nodes.edge,
            "cluster configuration valid"
        );
        self.coordinator.prepare(config, plan).await
    }

    async fn adapter(&self, provider: &ProviderConfig) -> Result<Box<dyn ProviderAdapter>> {
        let domain = self.cluster.as_ref().map(|c| c.domain.as_str());
        create_provider(provider, domain, self.connector.as_ref(), self.concurrency).await
    }
}

fn check_slot(config: &ClusterConfig, role: NodeRole, host_index: u32) -> Result<()> {
    let planned = config.nodes.get(role);
    if host_index >= planned {
        return Err(Error::validation(format!(
            "host index {host_index} is outside the {planned} planned {role} hosts"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::MockDiscoveryClient;
    use crate::config::{BillingTerm, Ec2Config, NodeCounts, PacketConfig};
    use crate::error::ApiError;
    use crate::provider::{
        Device, MockApiConnector, MockEc2Api, MockPacketApi, NetworkTopology, Project,
    };

    fn cluster(master: u32, node: u32, edge: u32) -> ClusterConfig {
        let mut config = ClusterConfig::new("example.com");
        config.nodes = NodeCounts { master, node, edge };
        config.dns_api_key = Some("ns1-key".to_string());
        config
    }

    fn ec2_config() -> ProviderConfig {
        let mut config = Ec2Config::new("eu-west-1");
        config.image_id = "ami-0abc".to_string();
        config.instance_type = "m4.large".to_string();
        config.key_pair = "ops".to_string();
        ProviderConfig::Ec2(config)
    }

    fn packet_config() -> ProviderConfig {
        ProviderConfig::Packet(PacketConfig {
            api_key: "pkt-secret".to_string(),
            project_id: "6f2b1c3a-1d2e-4f5a-9b8c-0123456789ab".to_string(),
            plan: "baremetal_3".to_string(),
            facility: "ewr1".to_string(),
            operating_system: "coreos_stable".to_string(),
            billing: BillingTerm::Hourly,
        })
    }

    fn discovery(times: usize) -> Arc<MockDiscoveryClient> {
        let mut client = MockDiscoveryClient::new();
        client
            .expect_new_token()
            .times(times)
            .returning(|_, _| Ok("fresh-token".to_string()));
        Arc::new(client)
    }

    fn untouched_connector() -> Arc<MockApiConnector> {
        let mut connector = MockApiConnector::new();
        connector.expect_ec2().times(0);
        connector.expect_packet().times(0);
        Arc::new(connector)
    }

    fn topology() -> NetworkTopology {
        NetworkTopology {
            vpc_id: "vpc-1".to_string(),
            external_subnet_id: "subnet-ext".to_string(),
            external_subnet_cidr: "10.0.0.0/24".parse().unwrap(),
            internal_subnet_id: "subnet-int".to_string(),
            internal_subnet_cidr: "10.0.1.0/24".parse().unwrap(),
            security_group_id: "sg-1".to_string(),
        }
    }

    // ==========================================================================
    // Story Tests: Bad input never reaches a provider
    // ==========================================================================

    mod validation {
        use super::*;

        /// Story: an even master count is rejected before any connector call
        #[tokio::test]
        async fn story_even_masters_fail_before_provider_calls() {
            let mut orchestrator = ClusterOrchestrator::new(
                Some(cluster(2, 1, 0)),
                Some(ec2_config()),
                discovery(0),
                untouched_connector(),
            );
            let err = orchestrator
                .execute(Command::Deploy, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
            assert_eq!(orchestrator.phase(), Phase::Failed(Stage::Validate));
        }

        /// Story: a host index past the planned count is refused
        #[tokio::test]
        async fn story_host_index_outside_plan_is_rejected() {
            let mut orchestrator = ClusterOrchestrator::new(
                Some(cluster(1, 2, 0)),
                None,
                discovery(0),
                untouched_connector(),
            );
            let err = orchestrator
                .execute(
                    Command::GenerateBootConfig {
                        role: NodeRole::Node,
                        host_index: 2,
                    },
                    CancellationToken::new(),
                )
                .await
                .unwrap_err();
            assert!(err.to_string().contains("host index 2"));
        }

        #[tokio::test]
        async fn test_packet_deploy_unsupported_without_token_issue() {
            let mut orchestrator = ClusterOrchestrator::new(
                Some(cluster(1, 0, 0)),
                Some(packet_config()),
                discovery(0),
                untouched_connector(),
            );
            let err = orchestrator
                .execute(Command::Deploy, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Unsupported { operation: "deploy", .. }));
        }

        #[tokio::test]
        async fn test_missing_provider_rejected() {
            let mut orchestrator =
                ClusterOrchestrator::new(Some(cluster(1, 0, 0)), None, discovery(0), untouched_connector());
            let err = orchestrator
                .execute(Command::Setup, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("no provider configured"));
        }

        #[tokio::test]
        async fn test_empty_raw_document_rejected() {
            let mut orchestrator =
                ClusterOrchestrator::new(None, Some(packet_config()), discovery(0), untouched_connector());
            let err = orchestrator
                .execute(
                    Command::Run {
                        source: DocumentSource::Raw {
                            bytes: Vec::new(),
                            hostname: Some("node-0.example.com".to_string()),
                        },
                    },
                    CancellationToken::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
    }

    // ==========================================================================
    // Story Tests: Commands sequence setup, deploy and run
    // ==========================================================================

    mod sequencing {
        use super::*;

        /// Story: deploying 3 masters and 2 nodes issues one token and 5 launches
        #[tokio::test]
        async fn story_deploy_resolves_token_once_and_launches_every_node() {
            let mut api = MockEc2Api::new();
            api.expect_find_networks().returning(|_| Ok(vec![topology()]));
            api.expect_run_instance()
                .times(5)
                .returning(|req| Ok((format!("i-{}", req.hostname), None)));
            let api = Arc::new(api);

            let mut connector = MockApiConnector::new();
            connector.expect_ec2().times(1).returning(move |_| Ok(api.clone()));

            let mut orchestrator = ClusterOrchestrator::new(
                Some(cluster(3, 2, 0)),
                Some(ec2_config()),
                discovery(1),
                Arc::new(connector),
            )
            .with_concurrency(2);
            let outcome = orchestrator
                .execute(Command::Deploy, CancellationToken::new())
                .await
                .unwrap();

            match outcome {
                Outcome::Deployed { setup, deploy } => {
                    assert!(!setup.created);
                    assert_eq!(deploy.launched.len(), 5);
                }
                other => panic!("expected deployed outcome, got {other:?}"),
            }
            assert_eq!(orchestrator.phase(), Phase::Done);
        }

        /// Story: a rendered single run reaches the device API with the document
        #[tokio::test]
        async fn story_run_renders_then_launches_one_device() {
            let mut api = MockPacketApi::new();
            api.expect_capacity_available().returning(|_, _| Ok(true));
            api.expect_create_device()
                .withf(|_, req| {
                    req.hostname == "node-1.example.com" && req.userdata.contains("fresh-token")
                })
                .times(1)
                .returning(|_, req| {
                    Ok(Device {
                        id: "dev-1".to_string(),
                        hostname: req.hostname.clone(),
                        public_ip: None,
                    })
                });
            let api = Arc::new(api);
            let mut connector = MockApiConnector::new();
            connector.expect_packet().returning(move |_| Ok(api.clone()));

            let mut orchestrator = ClusterOrchestrator::new(
                Some(cluster(1, 2, 0)),
                Some(packet_config()),
                discovery(1),
                Arc::new(connector),
            );
            let outcome = orchestrator
                .execute(
                    Command::Run {
                        source: DocumentSource::Render {
                            role: NodeRole::Node,
                            host_index: 1,
                        },
                    },
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(matches!(outcome, Outcome::Launched(ref h) if h.id == "dev-1"));
        }

        #[tokio::test]
        async fn test_generate_needs_no_provider() {
            let mut orchestrator =
                ClusterOrchestrator::new(Some(cluster(1, 0, 0)), None, discovery(1), untouched_connector());
            let outcome = orchestrator
                .execute(
                    Command::GenerateBootConfig {
                        role: NodeRole::Master,
                        host_index: 0,
                    },
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            match outcome {
                Outcome::BootConfig(doc) => {
                    assert_eq!(doc.host(), Some("master-0.example.com"));
                    assert!(doc.to_text().unwrap().contains("fresh-token"));
                }
                other => panic!("expected boot config, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_setup_failure_reports_provider_stage() {
            let mut api = MockPacketApi::new();
            api.expect_get_project()
                .returning(|_| Err(ApiError::auth("invalid token")));
            api.expect_enable_backend_transfer().times(0);
            let api = Arc::new(api);
            let mut connector = MockApiConnector::new();
            connector.expect_packet().returning(move |_| Ok(api.clone()));

            let mut orchestrator =
                ClusterOrchestrator::new(None, Some(packet_config()), discovery(0), Arc::new(connector));
            let err = orchestrator
                .execute(Command::Setup, CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.stage(), Stage::ProviderCall);
            assert_eq!(orchestrator.phase(), Phase::Failed(Stage::ProviderCall));
        }

        #[tokio::test]
        async fn test_setup_reports_enabled_project() {
            let mut api = MockPacketApi::new();
            api.expect_get_project().returning(|id| {
                Ok(Project {
                    id: id.to_string(),
                    name: "kato".to_string(),
                    backend_transfer_enabled: true,
                })
            });
            let api = Arc::new(api);
            let mut connector = MockApiConnector::new();
            connector.expect_packet().returning(move |_| Ok(api.clone()));

            let mut orchestrator =
                ClusterOrchestrator::new(None, Some(packet_config()), discovery(0), Arc::new(connector));
            let outcome = orchestrator
                .execute(Command::Setup, CancellationToken::new())
                .await
                .unwrap();
            assert!(matches!(outcome, Outcome::Setup(ref r) if !r.created));
        }

        #[tokio::test]
        async fn test_cancelled_run_launches_nothing() {
            let mut api = MockPacketApi::new();
            api.expect_capacity_available().times(0);
            api.expect_create_device().times(0);
            let api = Arc::new(api);
            let mut connector = MockApiConnector::new();
            connector.expect_packet().returning(move |_| Ok(api.clone()));

            let cancel = CancellationToken::new();
            cancel.cancel();
            let mut orchestrator =
                ClusterOrchestrator::new(None, Some(packet_config()), discovery(0), Arc::new(connector));
            let err = orchestrator
                .execute(
                    Command::Run {
                        source: DocumentSource::Raw {
                            bytes: b"#cloud-config\n".to_vec(),
                            hostname: Some("node-0.example.com".to_string()),
                        },
                    },
                    cancel,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Cancelled { completed: 0, abandoned: 1 }));
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Failed(Stage::Render).to_string(), "Failed(render)");
        assert_eq!(Phase::default(), Phase::Idle);
    }
}
