//! Backend-specific provisioning parameters

use std::fmt;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Provider selection for one orchestration run
///
/// Exactly one variant is active; the orchestrator picks the matching
/// [`ProviderAdapter`](crate::provider::ProviderAdapter) from it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Amazon EC2 with a private VPC
    Ec2(Ec2Config),
    /// Packet bare-metal
    Packet(PacketConfig),
}

impl ProviderConfig {
    /// Backend name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ec2(_) => "ec2",
            Self::Packet(_) => "packet",
        }
    }

    /// Validate fields needed by every operation of the backend
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Ec2(cfg) => cfg.validate(),
            Self::Packet(cfg) => cfg.validate(),
        }
    }
}

/// Public addressing for launched EC2 instances
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PublicIpPolicy {
    /// Private addressing only
    #[default]
    None,
    /// Auto-assigned public address
    Public,
    /// Allocate and associate an elastic IP
    Elastic,
}

impl std::str::FromStr for PublicIpPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "false" => Ok(Self::None),
            "public" => Ok(Self::Public),
            "elastic" | "true" => Ok(Self::Elastic),
            _ => Err(Error::validation(format!(
                "invalid public ip policy: {s}, expected one of: none, public, elastic"
            ))),
        }
    }
}

/// Operator-configured ingress permission
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IngressRule {
    /// IP protocol (`tcp`, `udp`, `icmp`)
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// First port of the range
    pub from_port: u16,
    /// Last port of the range
    pub to_port: u16,
    /// Source range
    #[serde(default = "any_source")]
    pub cidr: Ipv4Net,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn any_source() -> Ipv4Net {
    Ipv4Net::default()
}

impl IngressRule {
    /// TCP rule for a single port from anywhere
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: default_protocol(),
            from_port: port,
            to_port: port,
            cidr: any_source(),
        }
    }
}

fn default_ingress() -> Vec<IngressRule> {
    vec![IngressRule::tcp(22), IngressRule::tcp(80), IngressRule::tcp(443)]
}

fn default_vpc_cidr() -> Ipv4Net {
    cidr("10.0.0.0/16")
}

fn default_external_subnet() -> Ipv4Net {
    cidr("10.0.0.0/24")
}

fn default_internal_subnet() -> Ipv4Net {
    cidr("10.0.1.0/24")
}

fn cidr(s: &str) -> Ipv4Net {
    s.parse().unwrap_or_default()
}

/// EC2 provisioning parameters
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Ec2Config {
    /// Region (e.g., `eu-west-1`)
    pub region: String,
    /// AMI id
    #[serde(default)]
    pub image_id: String,
    /// Instance type
    #[serde(default)]
    pub instance_type: String,
    /// SSH key pair name
    #[serde(default)]
    pub key_pair: String,
    /// Existing VPC to launch into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    /// Address block of a VPC created by setup
    #[serde(default = "default_vpc_cidr")]
    pub vpc_cidr: Ipv4Net,
    /// Public-facing subnet created by setup
    #[serde(default = "default_external_subnet")]
    pub external_subnet_cidr: Ipv4Net,
    /// Private subnet created by setup
    #[serde(default = "default_internal_subnet")]
    pub internal_subnet_cidr: Ipv4Net,
    /// Existing subnets to launch into
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,
    /// Existing security group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,
    /// Public addressing policy
    #[serde(default)]
    pub public_ip: PublicIpPolicy,
    /// IAM instance profile name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_role: Option<String>,
    /// Extra ingress permitted into the cluster security group
    #[serde(default = "default_ingress")]
    pub ingress: Vec<IngressRule>,
}

impl Ec2Config {
    /// Create a config for a region with default networking
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            image_id: String::new(),
            instance_type: String::new(),
            key_pair: String::new(),
            vpc_id: None,
            vpc_cidr: default_vpc_cidr(),
            external_subnet_cidr: default_external_subnet(),
            internal_subnet_cidr: default_internal_subnet(),
            subnet_ids: Vec::new(),
            security_group_id: None,
            public_ip: PublicIpPolicy::default(),
            iam_role: None,
            ingress: default_ingress(),
        }
    }

    /// Validate region and network layout
    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            return Err(Error::validation("ec2 region is required"));
        }
        for (name, subnet) in [
            ("external", self.external_subnet_cidr),
            ("internal", self.internal_subnet_cidr),
        ] {
            if !self.vpc_cidr.contains(&subnet) {
                return Err(Error::validation(format!(
                    "{name} subnet {subnet} is outside VPC range {}",
                    self.vpc_cidr
                )));
            }
        }
        if self.external_subnet_cidr.contains(&self.internal_subnet_cidr)
            || self.internal_subnet_cidr.contains(&self.external_subnet_cidr)
        {
            return Err(Error::validation(format!(
                "external subnet {} overlaps internal subnet {}",
                self.external_subnet_cidr, self.internal_subnet_cidr
            )));
        }
        for rule in &self.ingress {
            if rule.from_port > rule.to_port {
                return Err(Error::validation(format!(
                    "ingress rule port range {}-{} is inverted",
                    rule.from_port, rule.to_port
                )));
            }
        }
        Ok(())
    }

    /// Validate fields needed to launch instances
    pub fn validate_launch(&self) -> Result<()> {
        for (field, value) in [
            ("image_id", &self.image_id),
            ("instance_type", &self.instance_type),
            ("key_pair", &self.key_pair),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!(
                    "ec2 {field} is required to launch instances"
                )));
            }
        }
        Ok(())
    }
}

/// Packet device billing cycle
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BillingTerm {
    /// Billed per hour
    #[default]
    Hourly,
    /// Billed per month
    Monthly,
}

impl BillingTerm {
    /// API value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for BillingTerm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "monthly" => Ok(Self::Monthly),
            _ => Err(Error::validation(format!(
                "invalid billing term: {s}, expected one of: hourly, monthly"
            ))),
        }
    }
}

/// Packet provisioning parameters
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PacketConfig {
    /// API token
    pub api_key: String,
    /// Project UUID
    pub project_id: String,
    /// Hardware plan (e.g., `baremetal_0`)
    pub plan: String,
    /// Facility code (e.g., `ewr1`)
    pub facility: String,
    /// Operating system slug (e.g., `coreos_stable`)
    #[serde(default = "default_operating_system")]
    pub operating_system: String,
    /// Billing cycle
    #[serde(default)]
    pub billing: BillingTerm,
}

fn default_operating_system() -> String {
    "coreos_stable".to_string()
}

impl PacketConfig {
    /// Validate credentials and device parameters
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::validation("packet api key is required"));
        }
        if !is_uuid(&self.project_id) {
            return Err(Error::validation(format!(
                "packet project id must look like aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee: {}",
                self.project_id
            )));
        }
        for (field, value) in [
            ("plan", &self.plan),
            ("facility", &self.facility),
            ("operating_system", &self.operating_system),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("packet {field} is required")));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PacketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketConfig")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("plan", &self.plan)
            .field("facility", &self.facility)
            .field("operating_system", &self.operating_system)
            .field("billing", &self.billing)
            .finish()
    }
}

fn is_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_config() -> PacketConfig {
        PacketConfig {
            api_key: "pkt-secret".to_string(),
            project_id: "6f2b1c3a-1d2e-4f5a-9b8c-0123456789ab".to_string(),
            plan: "baremetal_0".to_string(),
            facility: "ewr1".to_string(),
            operating_system: default_operating_system(),
            billing: BillingTerm::Hourly,
        }
    }

    mod ec2 {
        use super::*;

        #[test]
        fn test_defaults_are_valid() {
            let cfg = Ec2Config::new("eu-west-1");
            assert!(cfg.validate().is_ok());
            assert_eq!(cfg.ingress.len(), 3);
            assert_eq!(cfg.public_ip, PublicIpPolicy::None);
        }

        #[test]
        fn test_region_required() {
            let cfg = Ec2Config::new(" ");
            assert!(matches!(cfg.validate(), Err(Error::Validation(_))));
        }

        #[test]
        fn test_subnet_outside_vpc_rejected() {
            let mut cfg = Ec2Config::new("eu-west-1");
            cfg.internal_subnet_cidr = cidr("172.16.0.0/24");
            let err = cfg.validate().unwrap_err();
            assert!(err.to_string().contains("outside VPC range"));
        }

        #[test]
        fn test_overlapping_subnets_rejected() {
            let mut cfg = Ec2Config::new("eu-west-1");
            cfg.internal_subnet_cidr = cidr("10.0.0.0/25");
            assert!(cfg.validate().unwrap_err().to_string().contains("overlaps"));
        }

        #[test]
        fn test_public_ip_policy_accepts_legacy_booleans() {
            assert_eq!("true".parse::<PublicIpPolicy>().unwrap(), PublicIpPolicy::Elastic);
            assert_eq!("false".parse::<PublicIpPolicy>().unwrap(), PublicIpPolicy::None);
            assert_eq!("Public".parse::<PublicIpPolicy>().unwrap(), PublicIpPolicy::Public);
            assert!("sometimes".parse::<PublicIpPolicy>().is_err());
        }

        #[test]
        fn test_launch_fields_required() {
            let mut cfg = Ec2Config::new("eu-west-1");
            assert!(cfg.validate_launch().is_err());
            cfg.image_id = "ami-123".to_string();
            cfg.instance_type = "m4.large".to_string();
            cfg.key_pair = "ops".to_string();
            assert!(cfg.validate_launch().is_ok());
        }
    }

    mod packet {
        use super::*;

        #[test]
        fn test_valid_config() {
            assert!(packet_config().validate().is_ok());
        }

        #[test]
        fn test_project_id_format() {
            let mut cfg = packet_config();
            cfg.project_id = "not-a-uuid".to_string();
            assert!(cfg.validate().unwrap_err().to_string().contains("project id"));
        }

        #[test]
        fn test_billing_term_parse() {
            assert_eq!("monthly".parse::<BillingTerm>().unwrap(), BillingTerm::Monthly);
            assert!("weekly".parse::<BillingTerm>().is_err());
        }

        #[test]
        fn test_debug_redacts_api_key() {
            assert!(!format!("{:?}", packet_config()).contains("pkt-secret"));
        }
    }

    #[test]
    fn test_tagged_yaml_selects_variant() {
        let yaml = r#"
type: packet
api_key: k
project_id: 6f2b1c3a-1d2e-4f5a-9b8c-0123456789ab
plan: baremetal_1
facility: ams1
billing: monthly
"#;
        let cfg: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.name(), "packet");
        match cfg {
            ProviderConfig::Packet(p) => {
                assert_eq!(p.billing, BillingTerm::Monthly);
                assert_eq!(p.operating_system, "coreos_stable");
            }
            other => panic!("expected packet, got {other:?}"),
        }
    }
}
