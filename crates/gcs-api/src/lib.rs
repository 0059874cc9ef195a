//! Typed Rust client for the GCS JSON API.
//!
//! Covers the subset used as a workspace transfer relay: bucket
//! create-if-absent (with a lifecycle rule as a leak-safety net) and
//! object media upload. Reads happen on the remote side via `gsutil`,
//! so no download surface is needed here.

mod types;

pub use types::*;

const BASE_URL: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_URL: &str = "https://storage.googleapis.com/upload/storage/v1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("storage api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the GCS JSON/upload REST API.
#[derive(Clone)]
pub struct StorageClient {
    token: String,
    http: reqwest::Client,
}

impl StorageClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            http: reqwest::Client::new(),
        }
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

    /// Like `check` but also treats 409 as success (bucket already exists).
    async fn check_allow_409(resp: reqwest::Response, endpoint: &'static str) -> Result<bool> {
        let status = resp.status();
        if status.as_u16() == 409 {
            return Ok(false);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(true)
    }

    // ── Buckets ──────────────────────────────────────────────────────

    /// Create a bucket in `project`. Returns `false` if it already existed.
    pub async fn create_bucket(&self, project: &str, req: &CreateBucketRequest) -> Result<bool> {
        let resp = self
            .http
            .post(format!("{BASE_URL}/b"))
            .header("Authorization", self.auth())
            .query(&[("project", project)])
            .json(req)
            .send()
            .await?;

        Self::check_allow_409(resp, "create bucket").await
    }

    // ── Objects ──────────────────────────────────────────────────────

    /// Upload `data` as `object` in `bucket`. Returns the `gs://` URL.
    pub async fn upload_object(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
    ) -> Result<String> {
        let resp = self
            .http
            .post(format!("{UPLOAD_URL}/b/{bucket}/o"))
            .header("Authorization", self.auth())
            .header("Content-Type", "application/octet-stream")
            .query(&[("uploadType", "media"), ("name", object)])
            .body(data)
            .send()
            .await?;

        Self::check(resp, "upload object").await?;
        Ok(format!("gs://{bucket}/{object}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_rule_serializes_to_gcs_shape() {
        let req = CreateBucketRequest {
            name: "proj_builder_tmp".into(),
            lifecycle: Some(Lifecycle {
                rule: vec![LifecycleRule::delete_after_days(1)],
            }),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["lifecycle"]["rule"][0]["action"]["type"], "Delete");
        assert_eq!(json["lifecycle"]["rule"][0]["condition"]["age"], 1);
    }
}
