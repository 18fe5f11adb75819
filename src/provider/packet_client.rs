//! Packet REST API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::packet::{Device, DeviceRequest, PacketApi, Project};
use crate::error::ApiError;
use crate::{Error, Result};

/// Packet API base URL
pub const PACKET_API_URL: &str = "https://api.packet.net";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`PacketApi`] over HTTPS
#[derive(Clone)]
pub struct PacketHttpClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for PacketHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHttpClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct CapacityQuery<'a> {
    servers: [CapacityServer<'a>; 1],
}

#[derive(Serialize)]
struct CapacityServer<'a> {
    facility: &'a str,
    plan: &'a str,
    quantity: u32,
}

#[derive(Deserialize)]
struct CapacityResponse {
    #[serde(default)]
    servers: Vec<CapacityAnswer>,
}

#[derive(Deserialize)]
struct CapacityAnswer {
    #[serde(default)]
    available: bool,
}

#[derive(Deserialize)]
struct DeviceResponse {
    id: String,
    hostname: String,
    #[serde(default)]
    ip_addresses: Vec<IpAssignment>,
}

#[derive(Deserialize)]
struct IpAssignment {
    address: String,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    address_family: u8,
}

impl From<DeviceResponse> for Device {
    fn from(device: DeviceResponse) -> Self {
        let public_ip = device
            .ip_addresses
            .into_iter()
            .find(|ip| ip.public && ip.address_family == 4)
            .map(|ip| ip.address);
        Self {
            id: device.id,
            hostname: device.hostname,
            public_ip,
        }
    }
}

impl PacketHttpClient {
    /// Create a client authenticated with `api_key`
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, PACKET_API_URL)
    }

    /// Create a client against a non-default API endpoint
    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> std::result::Result<String, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "packet api request");

        let mut request = self
            .client
            .request(method, &url)
            .header("X-Auth-Token", &self.api_key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(classify(status, &text))
        }
    }

    async fn call_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> std::result::Result<T, ApiError> {
        let text = self.call(method, path, body).await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::api(format!("unexpected response from {path}: {e}")))
    }
}

/// Map an error response to an API error kind
fn classify(status: StatusCode, body: &str) -> ApiError {
    let message = error_message(body).unwrap_or_else(|| format!("{status}"));
    let lower = message.to_lowercase();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::auth(message),
        StatusCode::NOT_FOUND => ApiError::not_found(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::rate_limited(message),
        _ if lower.contains("capacity") || lower.contains("no available hardware") => {
            ApiError::capacity(message)
        }
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ApiError::network(message)
        }
        _ => ApiError::api(message),
    }
}

/// Packet errors look like `{"errors": ["..."]}`
fn error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Errors {
        errors: Vec<String>,
    }
    serde_json::from_str::<Errors>(body)
        .ok()
        .filter(|e| !e.errors.is_empty())
        .map(|e| e.errors.join("; "))
}

#[async_trait]
impl PacketApi for PacketHttpClient {
    async fn get_project(&self, project_id: &str) -> std::result::Result<Project, ApiError> {
        self.call_json::<Project, ()>(Method::GET, &format!("/projects/{project_id}"), None)
            .await
    }

    async fn enable_backend_transfer(&self, project_id: &str) -> std::result::Result<(), ApiError> {
        self.call(
            Method::PUT,
            &format!("/projects/{project_id}"),
            Some(&serde_json::json!({ "backend_transfer_enabled": true })),
        )
        .await
        .map(|_| ())
    }

    async fn capacity_available(
        &self,
        facility: &str,
        plan: &str,
    ) -> std::result::Result<bool, ApiError> {
        let query = CapacityQuery {
            servers: [CapacityServer {
                facility,
                plan,
                quantity: 1,
            }],
        };
        let response: CapacityResponse = self
            .call_json(Method::POST, "/capacity", Some(&query))
            .await?;
        Ok(response.servers.first().map(|s| s.available).unwrap_or(false))
    }

    async fn create_device(
        &self,
        project_id: &str,
        request: &DeviceRequest,
    ) -> std::result::Result<Device, ApiError> {
        let device: DeviceResponse = self
            .call_json(
                Method::POST,
                &format!("/projects/{project_id}/devices"),
                Some(request),
            )
            .await?;
        Ok(device.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED, r#"{"errors":["invalid token"]}"#),
            ApiError::auth("invalid token")
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, "").kind,
            ApiErrorKind::RateLimited
        );
        assert_eq!(classify(StatusCode::NOT_FOUND, "").kind, ApiErrorKind::NotFound);
        assert_eq!(
            classify(StatusCode::SERVICE_UNAVAILABLE, "").kind,
            ApiErrorKind::Network
        );
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, r#"{"errors":["hostname is invalid"]}"#).kind,
            ApiErrorKind::Api
        );
    }

    #[test]
    fn test_capacity_rejections_detected_in_body() {
        let err = classify(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"errors":["Oh snap, no available hardware in ewr1"]}"#,
        );
        assert_eq!(err.kind, ApiErrorKind::Capacity);
        assert!(err.is_transient());
    }

    #[test]
    fn test_device_response_picks_public_ipv4() {
        let json = r#"{
            "id": "dev-1",
            "hostname": "master-0.example.com",
            "ip_addresses": [
                {"address": "10.99.0.3", "public": false, "address_family": 4},
                {"address": "2604:1380::1", "public": true, "address_family": 6},
                {"address": "147.75.0.10", "public": true, "address_family": 4}
            ]
        }"#;
        let device: Device = serde_json::from_str::<DeviceResponse>(json).unwrap().into();
        assert_eq!(device.public_ip.as_deref(), Some("147.75.0.10"));
    }

    #[test]
    fn test_device_request_shape() {
        let request = DeviceRequest {
            hostname: "node-0.example.com".to_string(),
            plan: "baremetal_0".to_string(),
            facility: "ewr1".to_string(),
            operating_system: "coreos_stable".to_string(),
            billing_cycle: "hourly".to_string(),
            userdata: "#cloud-config\n".to_string(),
            tags: vec![],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["billing_cycle"], "hourly");
        assert_eq!(json["userdata"], "#cloud-config\n");
        assert!(json.get("tags").is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let client = PacketHttpClient::new("pkt-secret").unwrap();
        assert!(!format!("{client:?}").contains("pkt-secret"));
    }

    #[tokio::test]
    async fn test_unreachable_api_is_network_error() {
        let client = PacketHttpClient::with_base_url("k", "http://127.0.0.1:9").unwrap();
        let err = client.get_project("p").await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Network);
    }
}
