//! Typed Rust client for the GCE Compute v1 REST API.
//!
//! Covers the subset needed for managing Windows builder VMs:
//! instances (insert, get, delete, list), zone operations, instance
//! metadata, serial port output, and firewall listing.

mod types;

pub use types::*;

const BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("compute api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

impl Error {
    /// True if this is an HTTP 404 whose body mentions `resource`.
    ///
    /// Used to recognize "image family no longer exists" on instance
    /// insert, which callers treat as a skip rather than a failure.
    pub fn is_resource_not_found(&self, resource: &str) -> bool {
        match self {
            Error::Api { status, body, .. } => {
                status.as_u16() == 404 && body.contains(resource)
            }
            Error::Request(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the GCE Compute v1 REST API.
///
/// Calls span projects (instance project vs. Shared-VPC host project), so
/// the project is a per-call argument rather than client state.
#[derive(Clone)]
pub struct ComputeClient {
    token: String,
    http: reqwest::Client,
}

impl ComputeClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{BASE_URL}{path}")
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        req: &InsertInstanceRequest,
    ) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!("/projects/{project}/zones/{zone}/instances")))
            .header("Authorization", self.auth())
            .json(req)
            .send()
            .await?;

        Self::check(resp, "insert instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<Instance> {
        let resp = self
            .http
            .get(self.url(&format!("/projects/{project}/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get instance")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/projects/{project}/zones/{zone}/instances/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check_allow_404(resp, "delete instance").await?;
        Ok(())
    }

    pub async fn list_instances(
        &self,
        project: &str,
        zone: &str,
        filter: Option<&str>,
    ) -> Result<InstanceList> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(f) = filter {
            query.push(("filter", f.to_string()));
        }

        let resp = self
            .http
            .get(self.url(&format!("/projects/{project}/zones/{zone}/instances")))
            .header("Authorization", self.auth())
            .query(&query)
            .send()
            .await?;

        Self::check(resp, "list instances")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Instance metadata / serial console ───────────────────────────

    pub async fn set_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Operation> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/projects/{project}/zones/{zone}/instances/{name}/setMetadata"
            )))
            .header("Authorization", self.auth())
            .json(metadata)
            .send()
            .await?;

        Self::check(resp, "set metadata")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_serial_port_output(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        port: u8,
    ) -> Result<SerialPortOutput> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/projects/{project}/zones/{zone}/instances/{name}/serialPort"
            )))
            .header("Authorization", self.auth())
            .query(&[("port", port.to_string())])
            .send()
            .await?;

        Self::check(resp, "get serial port output")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Zone operations ──────────────────────────────────────────────

    pub async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation> {
        let resp = self
            .http
            .get(self.url(&format!("/projects/{project}/zones/{zone}/operations/{name}")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "get zone operation")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Firewalls ────────────────────────────────────────────────────

    pub async fn list_firewalls(&self, project: &str) -> Result<FirewallList> {
        let resp = self
            .http
            .get(self.url(&format!("/projects/{project}/global/firewalls")))
            .header("Authorization", self.auth())
            .send()
            .await?;

        Self::check(resp, "list firewalls")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_not_found_requires_404_and_matching_body() {
        let err = Error::Api {
            endpoint: "insert instance",
            status: reqwest::StatusCode::NOT_FOUND,
            body: "The resource 'projects/windows-cloud/global/images/family/windows-1809-core-for-containers' was not found".into(),
        };
        assert!(err.is_resource_not_found(
            "windows-cloud/global/images/family/windows-1809-core-for-containers"
        ));
        assert!(!err.is_resource_not_found("windows-cloud/global/images/family/windows-2004-core"));

        let err = Error::Api {
            endpoint: "insert instance",
            status: reqwest::StatusCode::FORBIDDEN,
            body: "family/windows-1809-core-for-containers".into(),
        };
        assert!(!err.is_resource_not_found("family/windows-1809-core-for-containers"));
    }

    #[test]
    fn instance_read_types_accept_gce_field_casing() {
        let raw = r#"{
            "name": "windows-builder-abc",
            "status": "RUNNING",
            "metadata": {
                "fingerprint": "fp==",
                "items": [{"key": "windows-keys", "value": "{}"}]
            },
            "networkInterfaces": [{
                "networkIP": "10.0.0.2",
                "accessConfigs": [{"name": "External NAT", "natIP": "34.1.2.3"}]
            }]
        }"#;
        let inst: Instance = serde_json::from_str(raw).unwrap();
        assert_eq!(inst.network_interfaces[0].network_ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(
            inst.network_interfaces[0].access_configs[0].nat_ip.as_deref(),
            Some("34.1.2.3")
        );
        assert_eq!(inst.metadata.unwrap().fingerprint.as_deref(), Some("fp=="));
    }

    #[test]
    fn firewall_types_accept_ip_protocol_casing() {
        let raw = r#"{
            "items": [{
                "name": "allow-winrm-ingress",
                "network": "https://www.googleapis.com/compute/v1/projects/p/global/networks/default",
                "direction": "INGRESS",
                "sourceRanges": ["0.0.0.0/0"],
                "allowed": [{"IPProtocol": "tcp", "ports": ["5986"]}]
            }]
        }"#;
        let list: FirewallList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.items[0].allowed[0].ip_protocol, "tcp");
        assert!(!list.items[0].disabled);
    }
}
