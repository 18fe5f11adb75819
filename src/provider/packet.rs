//! Packet bare-metal provisioner
//!
//! Packet has no network scaffold: setup only turns on project features that
//! device creation relies on. Devices are requested one at a time via `run`;
//! whole-cluster deploy is not offered.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use super::{DeployReport, InstanceHandle, ProviderAdapter, SetupReport};
use crate::config::PacketConfig;
use crate::error::{ApiError, ApiErrorKind, ProviderError};
use crate::template::BootDocument;
use crate::{Error, Result};

const PROVIDER: &str = "packet";

/// Project as reported by the Packet API
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Project {
    /// Project UUID
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Whether backend transfer between facilities is enabled
    #[serde(default)]
    pub backend_transfer_enabled: bool,
}

/// Device creation request
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Device hostname
    pub hostname: String,
    /// Hardware plan
    pub plan: String,
    /// Facility code
    pub facility: String,
    /// Operating system slug
    pub operating_system: String,
    /// Billing cycle
    pub billing_cycle: String,
    /// Boot document text
    pub userdata: String,
    /// Device tags
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Created device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Device UUID
    pub id: String,
    /// Hostname the device was created with
    pub hostname: String,
    /// Public IPv4 address, once assigned
    pub public_ip: Option<String>,
}

/// Packet operations the provisioner needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketApi: Send + Sync {
    /// Read a project
    async fn get_project(&self, project_id: &str) -> std::result::Result<Project, ApiError>;

    /// Enable backend transfer for a project
    async fn enable_backend_transfer(&self, project_id: &str) -> std::result::Result<(), ApiError>;

    /// Whether one device of `plan` can be provisioned in `facility`
    async fn capacity_available(
        &self,
        facility: &str,
        plan: &str,
    ) -> std::result::Result<bool, ApiError>;

    /// Create a device in a project
    async fn create_device(
        &self,
        project_id: &str,
        request: &DeviceRequest,
    ) -> std::result::Result<Device, ApiError>;
}

/// Provisioner for Packet devices
pub struct PacketProvisioner {
    api: Arc<dyn PacketApi>,
    config: PacketConfig,
}

impl PacketProvisioner {
    /// Create a provisioner for the configured project
    pub fn new(api: Arc<dyn PacketApi>, config: PacketConfig) -> Self {
        Self { api, config }
    }

    fn err(operation: &'static str) -> impl FnOnce(ApiError) -> Error {
        move |source| ProviderError::new(PROVIDER, operation, source).into()
    }
}

#[async_trait]
impl ProviderAdapter for PacketProvisioner {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn setup(&self) -> Result<SetupReport> {
        let project_id = &self.config.project_id;
        let project = self
            .api
            .get_project(project_id)
            .await
            .map_err(Self::err("get-project"))?;

        if project.backend_transfer_enabled {
            info!(project_id = %project_id, "backend transfer already enabled");
            return Ok(SetupReport {
                created: false,
                resources: vec![project.id],
            });
        }

        self.api
            .enable_backend_transfer(project_id)
            .await
            .map_err(Self::err("enable-backend-transfer"))?;
        info!(project_id = %project_id, "enabled backend transfer");
        Ok(SetupReport {
            created: true,
            resources: vec![project.id],
        })
    }

    async fn deploy(
        &self,
        _documents: Vec<BootDocument>,
        _cancel: CancellationToken,
    ) -> Result<DeployReport> {
        Err(Error::Unsupported {
            provider: PROVIDER,
            operation: "deploy",
        })
    }

    async fn run(&self, document: &BootDocument) -> Result<InstanceHandle> {
        let hostname = document
            .host()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::validation("packet devices require a hostname"))?
            .to_string();
        // Packet user data is text; inflate before attaching
        let userdata = document.to_text()?;

        let PacketConfig { facility, plan, .. } = &self.config;
        let available = self
            .api
            .capacity_available(facility, plan)
            .await
            .map_err(Self::err("check-capacity"))?;
        if !available {
            return Err(Error::capacity(facility.as_str(), plan.as_str()));
        }

        let request = DeviceRequest {
            hostname,
            plan: plan.clone(),
            facility: facility.clone(),
            operating_system: self.config.operating_system.clone(),
            billing_cycle: self.config.billing.as_str().to_string(),
            userdata,
            tags: document
                .role()
                .map(|role| vec![format!("kato:role={role}")])
                .unwrap_or_default(),
        };

        let device = self
            .api
            .create_device(&self.config.project_id, &request)
            .await
            .map_err(|e| match e.kind {
                ApiErrorKind::Capacity => Error::capacity(facility.as_str(), plan.as_str()),
                _ => ProviderError::new(PROVIDER, "create-device", e).into(),
            })?;

        info!(device_id = %device.id, hostname = %device.hostname, "created device");
        Ok(InstanceHandle {
            id: device.id,
            hostname: device.hostname,
            role: document.role(),
            host_index: document.host_index(),
            public_ip: device.public_ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingTerm;

    fn config() -> PacketConfig {
        PacketConfig {
            api_key: "pkt-secret".to_string(),
            project_id: "6f2b1c3a-1d2e-4f5a-9b8c-0123456789ab".to_string(),
            plan: "baremetal_3".to_string(),
            facility: "ewr1".to_string(),
            operating_system: "coreos_stable".to_string(),
            billing: BillingTerm::Hourly,
        }
    }

    fn project(enabled: bool) -> Project {
        Project {
            id: config().project_id,
            name: "kato".to_string(),
            backend_transfer_enabled: enabled,
        }
    }

    fn document() -> BootDocument {
        BootDocument::from_raw(b"#cloud-config\nhostname: worker-1.example.com\n".to_vec())
            .with_host("worker-1.example.com")
    }

    // ==========================================================================
    // Story Tests: Capacity failures leave nothing behind
    // ==========================================================================

    /// Story: an unsatisfiable facility/plan pair creates no device
    #[tokio::test]
    async fn story_no_capacity_creates_no_device() {
        let mut api = MockPacketApi::new();
        api.expect_capacity_available()
            .withf(|facility, plan| facility == "ewr1" && plan == "baremetal_3")
            .times(1)
            .returning(|_, _| Ok(false));
        api.expect_create_device().times(0);

        let err = PacketProvisioner::new(Arc::new(api), config())
            .run(&document())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityUnavailable { ref facility, ref plan }
                if facility == "ewr1" && plan == "baremetal_3"
        ));
    }

    /// Story: a capacity rejection from create surfaces the same way
    #[tokio::test]
    async fn story_create_capacity_rejection_is_capacity_unavailable() {
        let mut api = MockPacketApi::new();
        api.expect_capacity_available().returning(|_, _| Ok(true));
        api.expect_create_device()
            .times(1)
            .returning(|_, _| Err(ApiError::capacity("no available hardware")));

        let err = PacketProvisioner::new(Arc::new(api), config())
            .run(&document())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_run_creates_device_with_document() {
        let mut api = MockPacketApi::new();
        api.expect_capacity_available().returning(|_, _| Ok(true));
        api.expect_create_device()
            .withf(|project, req| {
                project == "6f2b1c3a-1d2e-4f5a-9b8c-0123456789ab"
                    && req.hostname == "worker-1.example.com"
                    && req.operating_system == "coreos_stable"
                    && req.billing_cycle == "hourly"
                    && req.userdata.starts_with("#cloud-config")
            })
            .times(1)
            .returning(|_, req| {
                Ok(Device {
                    id: "dev-1".to_string(),
                    hostname: req.hostname.clone(),
                    public_ip: Some("147.75.0.10".to_string()),
                })
            });

        let handle = PacketProvisioner::new(Arc::new(api), config())
            .run(&document())
            .await
            .unwrap();
        assert_eq!(handle.id, "dev-1");
        assert_eq!(handle.hostname, "worker-1.example.com");
        assert_eq!(handle.public_ip.as_deref(), Some("147.75.0.10"));
    }

    #[tokio::test]
    async fn test_run_requires_hostname() {
        let mut api = MockPacketApi::new();
        api.expect_capacity_available().times(0);
        api.expect_create_device().times(0);

        let doc = BootDocument::from_raw(b"#cloud-config\n".to_vec());
        let err = PacketProvisioner::new(Arc::new(api), config())
            .run(&doc)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_auth_failure_is_provider_error() {
        let mut api = MockPacketApi::new();
        api.expect_capacity_available()
            .returning(|_, _| Err(ApiError::auth("invalid token")));

        let err = PacketProvisioner::new(Arc::new(api), config())
            .run(&document())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_setup_enables_backend_transfer_once() {
        let mut api = MockPacketApi::new();
        api.expect_get_project()
            .times(1)
            .returning(|_| Ok(project(false)));
        api.expect_enable_backend_transfer()
            .times(1)
            .returning(|_| Ok(()));
        let report = PacketProvisioner::new(Arc::new(api), config())
            .setup()
            .await
            .unwrap();
        assert!(report.created);

        let mut api = MockPacketApi::new();
        api.expect_get_project().returning(|_| Ok(project(true)));
        api.expect_enable_backend_transfer().times(0);
        let report = PacketProvisioner::new(Arc::new(api), config())
            .setup()
            .await
            .unwrap();
        assert!(!report.created);
    }

    #[tokio::test]
    async fn test_deploy_is_unsupported() {
        let provisioner = PacketProvisioner::new(Arc::new(MockPacketApi::new()), config());
        let err = provisioner
            .deploy(Vec::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "packet provider does not support deploy");
    }
}
