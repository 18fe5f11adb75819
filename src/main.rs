//! katoctl - define and deploy etcd-coordinated CoreOS clusters

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ipnet::Ipv4Net;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kato::bootstrap::{DiscoveryClient, HttpDiscoveryClient};
use kato::config::{
    load_config, ClusterConfig, Ec2Config, EtcdToken, NodeRole, PacketConfig, ProviderConfig,
    RenderTarget,
};
use kato::orchestrator::{ClusterOrchestrator, Command, DocumentSource, Outcome};
use kato::provider::{ApiConnector, DefaultConnector, DEFAULT_LAUNCH_CONCURRENCY};
use kato::retry::{retry_with_backoff, RetryConfig};
use kato::template::BootDocument;

/// katoctl - define and deploy etcd-coordinated CoreOS clusters
#[derive(Parser, Debug)]
#[command(name = "katoctl", version, about, long_about = None)]
struct Cli {
    /// Cluster configuration file (YAML, `version: v1` or `version: v2`)
    #[arg(long, global = true, env = "KATO_CONFIG")]
    config: Option<PathBuf>,

    /// Path to file containing user data (reads stdin when absent or `-`)
    #[arg(long, global = true, env = "KATO_USER_DATA")]
    user_data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate CoreOS cloud-config user data for one node
    #[command(alias = "udata")]
    GenerateBootconfig(GenerateArgs),

    /// Create or reuse provider prerequisites (network scaffold, project features)
    SetupProvider(SetupArgs),

    /// Set up the provider and launch every planned node
    DeployCluster(DeployArgs),

    /// Launch one instance from a rendered or supplied boot document
    RunInstance(RunArgs),
}

/// Cluster parameters layered over the configuration file
#[derive(Args, Debug)]
struct ClusterArgs {
    /// Domain name as in (hostname -d)
    #[arg(long, env = "CS_DOMAIN")]
    domain: Option<String>,

    /// Number of masters (1, 3 or 5)
    #[arg(long, env = "CS_MASTER_COUNT")]
    masters: Option<u32>,

    /// Number of workload nodes
    #[arg(long, env = "CS_NODE_COUNT")]
    nodes: Option<u32>,

    /// Number of edge nodes
    #[arg(long, env = "CS_EDGE_COUNT")]
    edges: Option<u32>,

    /// NS1 private API key
    #[arg(long, env = "CS_NS1_API_KEY", hide_env_values = true)]
    ns1_api_key: Option<String>,

    /// Path to CA certificate
    #[arg(long, env = "CS_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Etcd discovery token (`auto` requests a fresh one)
    #[arg(long, env = "CS_ETCD_TOKEN", hide_env_values = true)]
    etcd_token: Option<String>,

    /// Flannel entire overlay network
    #[arg(long, env = "CS_FLANNEL_NETWORK")]
    flannel_network: Option<Ipv4Net>,

    /// Subnet length to allocate to each host
    #[arg(long, env = "CS_FLANNEL_SUBNET_LEN")]
    flannel_subnet_len: Option<u8>,

    /// First allocatable subnet
    #[arg(long, env = "CS_FLANNEL_SUBNET_MIN")]
    flannel_subnet_min: Option<Ipv4Addr>,

    /// Last allocatable subnet
    #[arg(long, env = "CS_FLANNEL_SUBNET_MAX")]
    flannel_subnet_max: Option<Ipv4Addr>,

    /// Flannel backend type: [ udp | vxlan | host-gw | gce | aws-vpc | alloc ]
    #[arg(long, env = "CS_FLANNEL_BACKEND")]
    flannel_backend: Option<String>,

    /// Gzip rendered boot documents
    #[arg(long, env = "CS_GZIP_UDATA")]
    compress: bool,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Choose one of [ master | node | edge ]
    #[arg(long, env = "CS_ROLE")]
    role: Option<String>,

    /// Host index within the role (hostname = role-id)
    #[arg(long, env = "CS_HOSTID")]
    hostid: Option<u32>,

    /// Write the document here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SetupArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(subcommand)]
    provider: Option<ProviderArgs>,
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// In-flight launches per role group
    #[arg(long, env = "KATO_CONCURRENCY", default_value_t = DEFAULT_LAUNCH_CONCURRENCY)]
    concurrency: usize,

    #[command(subcommand)]
    provider: Option<ProviderArgs>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Render for this role instead of reading user data
    #[arg(long, env = "CS_ROLE")]
    role: Option<String>,

    /// Host index to render for
    #[arg(long, env = "CS_HOSTID")]
    hostid: Option<u32>,

    /// Hostname for supplied user data
    #[arg(long, env = "KATO_HOSTNAME")]
    hostname: Option<String>,

    /// Attempts for transient failures (capacity, throttling, network)
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,

    #[command(subcommand)]
    provider: Option<ProviderArgs>,
}

#[derive(Subcommand, Debug)]
enum ProviderArgs {
    /// Amazon EC2
    Ec2(Ec2Args),
    /// Packet bare-metal
    Packet(PacketArgs),
}

#[derive(Args, Debug)]
struct Ec2Args {
    /// EC2 region
    #[arg(long, env = "EC2_REGION")]
    region: Option<String>,

    /// EC2 image id
    #[arg(long, env = "EC2_IMAGE_ID")]
    image_id: Option<String>,

    /// EC2 instance type
    #[arg(long, env = "EC2_INSTANCE_TYPE")]
    instance_type: Option<String>,

    /// EC2 key pair
    #[arg(long, env = "EC2_KEY_PAIR")]
    key_pair: Option<String>,

    /// EC2 VPC id
    #[arg(long, env = "EC2_VPC_ID")]
    vpc_id: Option<String>,

    /// EC2 subnet ids (comma separated)
    #[arg(long, env = "EC2_SUBNET_ID", value_delimiter = ',')]
    subnet_ids: Vec<String>,

    /// EC2 security group id
    #[arg(long, env = "EC2_SECURITY_GROUP_ID")]
    security_group_id: Option<String>,

    /// Public addressing: [ none | public | elastic ]
    #[arg(long, env = "EC2_PUBLIC_IP")]
    public_ip: Option<String>,

    /// IAM instance profile
    #[arg(long, env = "EC2_IAM_ROLE")]
    iam_role: Option<String>,
}

#[derive(Args, Debug)]
struct PacketArgs {
    /// Packet API key
    #[arg(long, env = "PKT_APIKEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Format: aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee
    #[arg(long, env = "PKT_PROJID")]
    project_id: Option<String>,

    /// One of [ baremetal_0 | baremetal_1 | baremetal_2 | baremetal_3 ]
    #[arg(long, env = "PKT_PLAN")]
    plan: Option<String>,

    /// One of [ coreos_stable | coreos_beta | coreos_alpha ]
    #[arg(long, env = "PKT_OS")]
    os: Option<String>,

    /// Facility code (e.g. ewr1)
    #[arg(long, env = "PKT_FACILITY")]
    facility: Option<String>,

    /// One of [ hourly | monthly ]
    #[arg(long, env = "PKT_BILLING")]
    billing: Option<String>,
}

impl ClusterArgs {
    fn apply(self, base: Option<ClusterConfig>) -> anyhow::Result<Option<ClusterConfig>> {
        let mut cluster = match (base, &self.domain) {
            (Some(cluster), _) => cluster,
            (None, Some(domain)) => ClusterConfig::new(domain.clone()),
            (None, None) => return Ok(None),
        };

        if let Some(domain) = self.domain {
            cluster.domain = domain;
        }
        if let Some(masters) = self.masters {
            cluster.nodes.master = masters;
        }
        if let Some(nodes) = self.nodes {
            cluster.nodes.node = nodes;
        }
        if let Some(edges) = self.edges {
            cluster.nodes.edge = edges;
        }
        if let Some(key) = self.ns1_api_key {
            cluster.dns_api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        if let Some(path) = self.ca_cert {
            let pem = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read CA certificate {}", path.display()))?;
            cluster.ca_cert = Some(pem);
        }
        if let Some(token) = self.etcd_token {
            cluster.etcd_token = EtcdToken::from_input(Some(token.as_str()));
        }
        if let Some(network) = self.flannel_network {
            cluster.flannel.network = network;
        }
        if let Some(len) = self.flannel_subnet_len {
            cluster.flannel.subnet_len = Some(len);
        }
        if let Some(min) = self.flannel_subnet_min {
            cluster.flannel.subnet_min = Some(min);
        }
        if let Some(max) = self.flannel_subnet_max {
            cluster.flannel.subnet_max = Some(max);
        }
        if let Some(backend) = self.flannel_backend {
            cluster.flannel.backend = backend.parse()?;
        }
        if self.compress {
            cluster.compress = true;
        }
        Ok(Some(cluster))
    }
}

impl Ec2Args {
    fn apply(self, base: Option<Ec2Config>) -> anyhow::Result<Ec2Config> {
        let mut config =
            base.unwrap_or_else(|| Ec2Config::new(self.region.clone().unwrap_or_default()));
        if let Some(region) = self.region {
            config.region = region;
        }
        if let Some(image_id) = self.image_id {
            config.image_id = image_id;
        }
        if let Some(instance_type) = self.instance_type {
            config.instance_type = instance_type;
        }
        if let Some(key_pair) = self.key_pair {
            config.key_pair = key_pair;
        }
        if let Some(vpc_id) = self.vpc_id {
            config.vpc_id = Some(vpc_id);
        }
        if !self.subnet_ids.is_empty() {
            config.subnet_ids = self.subnet_ids;
        }
        if let Some(group) = self.security_group_id {
            config.security_group_id = Some(group);
        }
        if let Some(policy) = self.public_ip {
            config.public_ip = policy.parse()?;
        }
        if let Some(role) = self.iam_role {
            config.iam_role = Some(role);
        }
        Ok(config)
    }
}

impl PacketArgs {
    fn apply(self, base: Option<PacketConfig>) -> anyhow::Result<PacketConfig> {
        let mut config = base.unwrap_or_else(|| PacketConfig {
            api_key: String::new(),
            project_id: String::new(),
            plan: String::new(),
            facility: String::new(),
            operating_system: "coreos_stable".to_string(),
            billing: Default::default(),
        });
        if let Some(api_key) = self.api_key {
            config.api_key = api_key;
        }
        if let Some(project_id) = self.project_id {
            config.project_id = project_id;
        }
        if let Some(plan) = self.plan {
            config.plan = plan;
        }
        if let Some(os) = self.os {
            config.operating_system = os;
        }
        if let Some(facility) = self.facility {
            config.facility = facility;
        }
        if let Some(billing) = self.billing {
            config.billing = billing.parse()?;
        }
        Ok(config)
    }
}

/// Provider from flags layered over the file, which wins when no flags select one
fn resolve_provider(
    args: Option<ProviderArgs>,
    base: Option<ProviderConfig>,
) -> anyhow::Result<Option<ProviderConfig>> {
    Ok(match (args, base) {
        (None, base) => base,
        (Some(ProviderArgs::Ec2(args)), Some(ProviderConfig::Ec2(base))) => {
            Some(ProviderConfig::Ec2(args.apply(Some(base))?))
        }
        (Some(ProviderArgs::Ec2(args)), _) => Some(ProviderConfig::Ec2(args.apply(None)?)),
        (Some(ProviderArgs::Packet(args)), Some(ProviderConfig::Packet(base))) => {
            Some(ProviderConfig::Packet(args.apply(Some(base))?))
        }
        (Some(ProviderArgs::Packet(args)), _) => Some(ProviderConfig::Packet(args.apply(None)?)),
    })
}

/// Role and host index from flags, falling back to a legacy file's target
fn render_slot(
    role: Option<&str>,
    hostid: Option<u32>,
    target: Option<RenderTarget>,
) -> anyhow::Result<Option<(NodeRole, u32)>> {
    let role = match role {
        Some(role) => Some(role.parse::<NodeRole>()?),
        None => target.map(|t| t.role),
    };
    let host_index = hostid.or(target.map(|t| t.host_index));
    match (role, host_index) {
        (Some(role), Some(host_index)) => Ok(Some((role, host_index))),
        (None, None) => Ok(None),
        _ => anyhow::bail!("--role and --hostid must be given together"),
    }
}

fn read_user_data(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) if path != Path::new("-") => std::fs::read(path)
            .with_context(|| format!("failed to read user data {}", path.display())),
        _ => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read user data from stdin")?;
            Ok(buf)
        }
    }
}

fn write_document(document: BootDocument, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => std::fs::write(path, document.bytes())
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(document.bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let (base_cluster, base_provider, target) = match &cli.config {
        Some(path) => {
            let loaded = load_config(path)?;
            (Some(loaded.cluster), loaded.provider, loaded.target)
        }
        None => (None, None, None),
    };

    let discovery: Arc<dyn DiscoveryClient> = Arc::new(HttpDiscoveryClient::new()?);
    let connector: Arc<dyn ApiConnector> = Arc::new(DefaultConnector);

    match cli.command {
        Commands::GenerateBootconfig(args) => {
            let cluster = args.cluster.apply(base_cluster)?;
            let (role, host_index) = render_slot(args.role.as_deref(), args.hostid, target)?
                .context("--role and --hostid are required")?;
            let mut orchestrator = ClusterOrchestrator::new(cluster, None, discovery, connector);
            if let Outcome::BootConfig(document) = orchestrator
                .execute(Command::GenerateBootConfig { role, host_index }, cancel)
                .await?
            {
                write_document(document, args.output.as_deref())?;
            }
        }
        Commands::SetupProvider(args) => {
            let cluster = args.cluster.apply(base_cluster)?;
            let provider = resolve_provider(args.provider, base_provider)?;
            let mut orchestrator = ClusterOrchestrator::new(cluster, provider, discovery, connector);
            if let Outcome::Setup(report) = orchestrator.execute(Command::Setup, cancel).await? {
                info!(created = report.created, "provider setup complete");
                for resource in report.resources {
                    println!("{resource}");
                }
            }
        }
        Commands::DeployCluster(args) => {
            let cluster = args.cluster.apply(base_cluster)?;
            let provider = resolve_provider(args.provider, base_provider)?;
            let mut orchestrator = ClusterOrchestrator::new(cluster, provider, discovery, connector)
                .with_concurrency(args.concurrency);
            if let Outcome::Deployed { deploy, .. } =
                orchestrator.execute(Command::Deploy, cancel).await?
            {
                info!(launched = deploy.launched.len(), "cluster deployed");
                for handle in deploy.launched {
                    println!("{}", handle.id);
                }
            }
        }
        Commands::RunInstance(args) => {
            let cluster = args.cluster.apply(base_cluster)?;
            let provider = resolve_provider(args.provider, base_provider)?;
            let source = match render_slot(args.role.as_deref(), args.hostid, target)? {
                Some((role, host_index)) => DocumentSource::Render { role, host_index },
                None => DocumentSource::Raw {
                    bytes: read_user_data(cli.user_data.as_deref())?,
                    hostname: args.hostname,
                },
            };

            let retry = RetryConfig::with_max_attempts(args.max_attempts);
            let outcome = retry_with_backoff(&retry, "run-instance", || {
                let mut orchestrator = ClusterOrchestrator::new(
                    cluster.clone(),
                    provider.clone(),
                    discovery.clone(),
                    connector.clone(),
                );
                let command = Command::Run {
                    source: source.clone(),
                };
                let cancel = cancel.clone();
                async move { orchestrator.execute(command, cancel).await }
            })
            .await?;
            if let Outcome::Launched(handle) = outcome {
                info!(id = %handle.id, hostname = %handle.hostname, "instance launched");
                println!("{}", handle.id);
                if let Some(ip) = handle.public_ip {
                    println!("{ip}");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // stdout carries rendered documents and resource ids; logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, no further launches will be issued");
            interrupt.cancel();
        }
    });

    if let Err(err) = run(cli, cancel).await {
        match err.downcast_ref::<kato::Error>() {
            Some(e) => eprintln!("Fatal error [{}]: {}", e.stage(), e),
            None => eprintln!("Fatal error: {err:#}"),
        }
        std::process::exit(1);
    }
}
