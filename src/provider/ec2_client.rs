//! EC2 API client backed by the AWS SDK
//!
//! Only compiled with the `aws` feature. Credentials come from the standard
//! AWS provider chain (environment, profile, instance metadata).

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::client::Waiters;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    DomainType, Filter, IamInstanceProfileSpecification, InstanceNetworkInterfaceSpecification,
    InstanceType, IpPermission, IpRange, ResourceType, Tag as AwsTag, TagSpecification,
    UserIdGroupPair,
};
use aws_sdk_ec2::Client;
use ipnet::Ipv4Net;
use tracing::{debug, warn};

use super::ec2::{
    Ec2Api, InstanceRequest, NetworkTopology, RuleSource, SecurityRule, Tag, TAG_DOMAIN,
};
use crate::config::PublicIpPolicy;
use crate::error::ApiError;

/// How long to wait for an instance to run before associating an elastic IP
const RUNNING_TIMEOUT: Duration = Duration::from_secs(300);

/// [`Ec2Api`] over the AWS SDK
#[derive(Clone, Debug)]
pub struct AwsEc2Client {
    client: Client,
}

impl AwsEc2Client {
    /// Load credentials from the default chain and connect to `region`
    pub async fn connect(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
        }
    }

    async fn scaffold(&self, domain: &str, vpc_id: &str) -> Result<Option<NetworkTopology>, ApiError> {
        let subnets = self
            .client
            .describe_subnets()
            .filters(filter("vpc-id", vpc_id))
            .filters(filter(&format!("tag:{TAG_DOMAIN}"), domain))
            .send()
            .await
            .map_err(api_error)?;

        let mut external = None;
        let mut internal = None;
        for subnet in subnets.subnets() {
            let name = subnet
                .tags()
                .iter()
                .find(|t| t.key() == Some("Name"))
                .and_then(|t| t.value())
                .unwrap_or_default();
            let id = subnet.subnet_id().unwrap_or_default().to_string();
            let cidr: Option<Ipv4Net> = subnet.cidr_block().and_then(|c| c.parse().ok());
            match (name.rsplit('-').next(), cidr) {
                (Some("external"), Some(cidr)) => external = Some((id, cidr)),
                (Some("internal"), Some(cidr)) => internal = Some((id, cidr)),
                _ => {}
            }
        }

        let groups = self
            .client
            .describe_security_groups()
            .filters(filter("vpc-id", vpc_id))
            .filters(filter(&format!("tag:{TAG_DOMAIN}"), domain))
            .send()
            .await
            .map_err(api_error)?;
        let group = groups
            .security_groups()
            .first()
            .and_then(|g| g.group_id())
            .map(str::to_string);

        match (external, internal, group) {
            (Some((external_subnet_id, external_subnet_cidr)), Some((internal_subnet_id, internal_subnet_cidr)), Some(security_group_id)) => {
                Ok(Some(NetworkTopology {
                    vpc_id: vpc_id.to_string(),
                    external_subnet_id,
                    external_subnet_cidr,
                    internal_subnet_id,
                    internal_subnet_cidr,
                    security_group_id,
                }))
            }
            _ => {
                warn!(vpc_id = %vpc_id, "vpc tagged for domain has an incomplete scaffold, ignoring");
                Ok(None)
            }
        }
    }
}

fn filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn tag_spec(resource: ResourceType, tags: &[Tag]) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(
            tags.iter()
                .map(|t| AwsTag::builder().key(&t.key).value(&t.value).build())
                .collect(),
        ))
        .build()
}

fn permission(rule: &SecurityRule) -> IpPermission {
    let builder = IpPermission::builder()
        .ip_protocol(&rule.protocol)
        .from_port(i32::from(rule.from_port))
        .to_port(i32::from(rule.to_port));
    match &rule.source {
        RuleSource::Cidr(cidr) => builder
            .ip_ranges(IpRange::builder().cidr_ip(cidr.to_string()).build())
            .build(),
        RuleSource::Group(group) => builder
            .user_id_group_pairs(UserIdGroupPair::builder().group_id(group).build())
            .build(),
    }
}

fn api_error<E, R>(err: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ApiError::network(message),
        _ => classify_code(err.code().unwrap_or_default(), message),
    }
}

/// Map an EC2 error code to an API error kind
fn classify_code(code: &str, message: String) -> ApiError {
    match code {
        "AuthFailure" | "UnauthorizedOperation" | "InvalidClientTokenId" => ApiError::auth(message),
        "RequestLimitExceeded" | "Throttling" => ApiError::rate_limited(message),
        "InsufficientInstanceCapacity"
        | "InsufficientAddressCapacity"
        | "InstanceLimitExceeded"
        | "AddressLimitExceeded"
        | "VpcLimitExceeded" => ApiError::capacity(message),
        code if code.starts_with("Invalid") && code.ends_with("NotFound") => {
            ApiError::not_found(message)
        }
        _ => ApiError::api(message),
    }
}

fn missing(what: &str) -> ApiError {
    ApiError::api(format!("response did not include {what}"))
}

#[async_trait]
impl Ec2Api for AwsEc2Client {
    async fn find_networks(&self, domain: &str) -> Result<Vec<NetworkTopology>, ApiError> {
        let vpcs = self
            .client
            .describe_vpcs()
            .filters(filter(&format!("tag:{TAG_DOMAIN}"), domain))
            .send()
            .await
            .map_err(api_error)?;

        let mut found = Vec::new();
        for vpc_id in vpcs.vpcs().iter().filter_map(|v| v.vpc_id()) {
            if let Some(topology) = self.scaffold(domain, vpc_id).await? {
                found.push(topology);
            }
        }
        debug!(domain = %domain, count = found.len(), "looked up network scaffolds");
        Ok(found)
    }

    async fn create_vpc(&self, cidr: Ipv4Net, tags: &[Tag]) -> Result<String, ApiError> {
        let out = self
            .client
            .create_vpc()
            .cidr_block(cidr.to_string())
            .tag_specifications(tag_spec(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(api_error)?;
        out.vpc()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| missing("a vpc id"))
    }

    async fn create_subnet(&self, vpc_id: &str, cidr: Ipv4Net, tags: &[Tag]) -> Result<String, ApiError> {
        let out = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr.to_string())
            .tag_specifications(tag_spec(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(api_error)?;
        out.subnet()
            .and_then(|s| s.subnet_id())
            .map(str::to_string)
            .ok_or_else(|| missing("a subnet id"))
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        tags: &[Tag],
    ) -> Result<String, ApiError> {
        let out = self
            .client
            .create_security_group()
            .vpc_id(vpc_id)
            .group_name(name)
            .description(format!("{name} cluster traffic"))
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(api_error)?;
        out.group_id()
            .map(str::to_string)
            .ok_or_else(|| missing("a security group id"))
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[SecurityRule]) -> Result<(), ApiError> {
        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(rules.iter().map(permission).collect()))
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn run_instance(&self, request: &InstanceRequest) -> Result<(String, Option<String>), ApiError> {
        let nic = InstanceNetworkInterfaceSpecification::builder()
            .device_index(0)
            .subnet_id(&request.subnet_id)
            .groups(&request.security_group_id)
            .associate_public_ip_address(request.public_ip == PublicIpPolicy::Public)
            .build();

        let mut call = self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .key_name(&request.key_pair)
            .min_count(1)
            .max_count(1)
            .user_data(&request.user_data)
            .network_interfaces(nic)
            .tag_specifications(tag_spec(ResourceType::Instance, &request.tags));
        if let Some(role) = &request.iam_role {
            call = call.iam_instance_profile(IamInstanceProfileSpecification::builder().name(role).build());
        }

        let out = call.send().await.map_err(api_error)?;
        let instance = out.instances().first().ok_or_else(|| missing("an instance"))?;
        let id = instance
            .instance_id()
            .map(str::to_string)
            .ok_or_else(|| missing("an instance id"))?;
        Ok((id, instance.public_ip_address().map(str::to_string)))
    }

    async fn tag_resource(&self, resource_id: &str, tags: &[Tag]) -> Result<(), ApiError> {
        self.client
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(
                tags.iter()
                    .map(|t| AwsTag::builder().key(&t.key).value(&t.value).build())
                    .collect(),
            ))
            .send()
            .await
            .map_err(api_error)?;
        Ok(())
    }

    async fn allocate_elastic_ip(&self, instance_id: &str) -> Result<String, ApiError> {
        self.client
            .wait_until_instance_running()
            .instance_ids(instance_id)
            .wait(RUNNING_TIMEOUT)
            .await
            .map_err(|e| ApiError::network(format!("{instance_id} did not reach running: {e}")))?;

        let address = self
            .client
            .allocate_address()
            .domain(DomainType::Vpc)
            .send()
            .await
            .map_err(api_error)?;
        let allocation_id = address
            .allocation_id()
            .ok_or_else(|| missing("an allocation id"))?;
        self.client
            .associate_address()
            .allocation_id(allocation_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(api_error)?;

        address
            .public_ip()
            .map(str::to_string)
            .ok_or_else(|| missing("a public ip"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;

    #[test]
    fn test_error_codes_map_to_kinds() {
        let kind = |code| classify_code(code, String::new()).kind;
        assert_eq!(kind("AuthFailure"), ApiErrorKind::Auth);
        assert_eq!(kind("RequestLimitExceeded"), ApiErrorKind::RateLimited);
        assert_eq!(kind("InsufficientInstanceCapacity"), ApiErrorKind::Capacity);
        assert_eq!(kind("InvalidSubnetID.NotFound"), ApiErrorKind::NotFound);
        assert_eq!(kind("InvalidParameterValue"), ApiErrorKind::Api);
    }

    #[test]
    fn test_group_rule_uses_group_pair() {
        let perm = permission(&SecurityRule {
            protocol: "tcp".to_string(),
            from_port: 2379,
            to_port: 2380,
            source: RuleSource::Group("sg-1".to_string()),
        });
        assert_eq!(perm.from_port(), Some(2379));
        assert_eq!(perm.user_id_group_pairs()[0].group_id(), Some("sg-1"));
        assert!(perm.ip_ranges().is_empty());
    }
}
