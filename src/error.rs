//! Error types for cluster bootstrap and provisioning

use std::fmt;

use thiserror::Error;

use crate::config::NodeRole;
use crate::provider::DeployFailure;
use crate::template::TemplateError;

/// Stage of an invocation at which a failure occurred
///
/// Operators use the stage to decide where to resume: nothing before the
/// reported stage needs to be redone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Configuration validation (no I/O performed yet)
    Validate,
    /// Etcd discovery token resolution
    ResolveToken,
    /// Boot document rendering
    Render,
    /// Infrastructure API call
    ProviderCall,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validate => write!(f, "validate"),
            Self::ResolveToken => write!(f, "resolve-token"),
            Self::Render => write!(f, "render"),
            Self::ProviderCall => write!(f, "provider-call"),
        }
    }
}

/// Main error type for kato operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed cluster or provider configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Inconsistent overlay network allocation parameters
    #[error("range error: {0}")]
    Range(String),

    /// The etcd discovery endpoint could not issue a token
    #[error("etcd discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// Boot document could not be rendered
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Infrastructure API call failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The requested facility/plan combination cannot be satisfied
    #[error("capacity unavailable: plan {plan} in facility {facility}")]
    CapacityUnavailable {
        /// Facility code
        facility: String,
        /// Hardware plan
        plan: String,
    },

    /// A deploy stopped after launching only part of the cluster
    #[error("deploy incomplete: {0}")]
    Deploy(DeployFailure),

    /// The invocation was cancelled while launches were in progress
    #[error("cancelled after {completed} launches ({abandoned} abandoned)")]
    Cancelled {
        /// Launches that completed before cancellation
        completed: usize,
        /// Launches never issued
        abandoned: usize,
    },

    /// Operation is not offered by the selected backend
    #[error("{provider} provider does not support {operation}")]
    Unsupported {
        /// Backend name
        provider: &'static str,
        /// Operation name
        operation: &'static str,
    },

    /// Reading input failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a range error with the given message
    pub fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::DiscoveryUnavailable(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a capacity error for a facility/plan pair
    pub fn capacity(facility: impl Into<String>, plan: impl Into<String>) -> Self {
        Self::CapacityUnavailable {
            facility: facility.into(),
            plan: plan.into(),
        }
    }

    /// Stage at which this error was raised
    pub fn stage(&self) -> Stage {
        match self {
            Self::Validation(_) | Self::Range(_) | Self::Unsupported { .. } | Self::Io(_) => {
                Stage::Validate
            }
            Self::DiscoveryUnavailable(_) => Stage::ResolveToken,
            Self::Template(_) | Self::Serialization(_) => Stage::Render,
            Self::Provider(_)
            | Self::CapacityUnavailable { .. }
            | Self::Deploy(_)
            | Self::Cancelled { .. } => Stage::ProviderCall,
        }
    }

    /// Whether retrying the whole invocation may succeed
    ///
    /// Only the invoking collaborator retries; nothing inside the crate does.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DiscoveryUnavailable(_) | Self::CapacityUnavailable { .. } => true,
            Self::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Category of a failed infrastructure API call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Credentials rejected
    Auth,
    /// Provider throttled the request
    RateLimited,
    /// Not enough capacity to satisfy the request
    Capacity,
    /// Transport failure before a response was received
    Network,
    /// Referenced resource does not exist
    NotFound,
    /// Any other API rejection
    Api,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::RateLimited => write!(f, "rate-limited"),
            Self::Capacity => write!(f, "capacity"),
            Self::Network => write!(f, "network"),
            Self::NotFound => write!(f, "not-found"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// Error returned by an infrastructure API capability
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ApiError {
    /// Failure category
    pub kind: ApiErrorKind,
    /// Message from the provider
    pub message: String,
}

impl ApiError {
    /// Create an API error of the given kind
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Auth, message)
    }

    /// Create a rate limit error
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::RateLimited, message)
    }

    /// Create a capacity error
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Capacity, message)
    }

    /// Create a transport error
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network, message)
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    /// Create a generic API error
    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Api, message)
    }

    /// Whether the failure may clear up on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::RateLimited | ApiErrorKind::Network | ApiErrorKind::Capacity
        )
    }
}

/// Backend failure with enough context to retry only the failed slice
#[derive(Debug)]
pub struct ProviderError {
    /// Backend name (`ec2`, `packet`)
    pub provider: &'static str,
    /// Operation that failed (`create-vpc`, `run-instance`, ...)
    pub operation: &'static str,
    /// Role and host index of the instance being launched, if any
    pub slot: Option<(NodeRole, u32)>,
    /// Instance that was already created when a follow-up call failed
    pub instance_id: Option<String>,
    /// Underlying API failure
    pub source: ApiError,
}

impl ProviderError {
    /// Create a provider error for an operation not tied to a cluster slot
    pub fn new(provider: &'static str, operation: &'static str, source: ApiError) -> Self {
        Self {
            provider,
            operation,
            slot: None,
            instance_id: None,
            source,
        }
    }

    /// Attach the role and host index being launched
    pub fn with_slot(mut self, role: NodeRole, host_index: u32) -> Self {
        self.slot = Some((role, host_index));
        self
    }

    /// Record an instance that exists despite the failure
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Whether repeating the operation may succeed
    ///
    /// Never true once an instance exists: repeating would launch a duplicate.
    pub fn is_transient(&self) -> bool {
        self.instance_id.is_none() && self.source.is_transient()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error: {} {}", self.provider, self.operation)?;
        if let Some((role, index)) = self.slot {
            write!(f, " for {}-{}", role, index)?;
        }
        write!(f, " failed")?;
        if let Some(id) = &self.instance_id {
            write!(f, " after launching {id}")?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Errors carry the stage at which an invocation stopped
    // ==========================================================================

    /// Story: bad input is reported before any I/O happens
    #[test]
    fn story_input_errors_report_validate_stage() {
        let err = Error::validation("master count must be one of 1, 3, 5");
        assert_eq!(err.stage(), Stage::Validate);
        assert!(err.to_string().contains("validation error"));

        let err = Error::range("subnet min 10.0.0.0 outside 10.128.0.0/21");
        assert_eq!(err.stage(), Stage::Validate);
        assert!(err.to_string().starts_with("range error"));

        let err = Error::Unsupported {
            provider: "packet",
            operation: "deploy",
        };
        assert_eq!(err.stage(), Stage::Validate);
        assert_eq!(err.to_string(), "packet provider does not support deploy");
    }

    /// Story: discovery outages are transient and point at token resolution
    #[test]
    fn story_discovery_outage_is_transient() {
        let err = Error::discovery("connection refused");
        assert_eq!(err.stage(), Stage::ResolveToken);
        assert!(err.is_transient());
    }

    /// Story: provider errors name the role and index that failed
    #[test]
    fn story_provider_error_names_failed_slot() {
        let err: Error = ProviderError::new(
            "ec2",
            "run-instance",
            ApiError::rate_limited("RequestLimitExceeded"),
        )
        .with_slot(NodeRole::Node, 3)
        .into();

        assert_eq!(err.stage(), Stage::ProviderCall);
        assert!(err.is_transient());
        let msg = err.to_string();
        assert!(msg.contains("ec2 run-instance for node-3 failed"));
        assert!(msg.contains("rate-limited: RequestLimitExceeded"));
    }

    /// Story: auth failures are not worth retrying
    #[test]
    fn story_auth_failures_are_permanent() {
        let err: Error =
            ProviderError::new("packet", "get-project", ApiError::auth("invalid token")).into();
        assert!(!err.is_transient());
        assert!(!Error::validation("bad").is_transient());
    }

    /// Story: a failure after an instance exists names it and is never retried
    #[test]
    fn story_failure_after_launch_names_instance() {
        let err: Error = ProviderError::new(
            "ec2",
            "allocate-elastic-ip",
            ApiError::capacity("AddressLimitExceeded"),
        )
        .with_slot(NodeRole::Edge, 0)
        .with_instance("i-0abc")
        .into();

        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "provider error: ec2 allocate-elastic-ip for edge-0 failed after launching i-0abc: \
             capacity: AddressLimitExceeded"
        );
    }

    #[test]
    fn test_capacity_error_message() {
        let err = Error::capacity("ewr1", "baremetal_3");
        assert_eq!(
            err.to_string(),
            "capacity unavailable: plan baremetal_3 in facility ewr1"
        );
        assert_eq!(err.stage(), Stage::ProviderCall);
        assert!(err.is_transient());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Validate.to_string(), "validate");
        assert_eq!(Stage::ResolveToken.to_string(), "resolve-token");
        assert_eq!(Stage::Render.to_string(), "render");
        assert_eq!(Stage::ProviderCall.to_string(), "provider-call");
    }
}
