//! Project and credential discovery.
//!
//! Prefers the GCE metadata server (the builder normally runs on Cloud
//! Build or a GCE VM) and falls back to shelling out to `gcloud` for
//! local runs. Tokens are plain bearer strings handed to the API
//! clients at construction.

use std::time::Duration;

use crate::{Error, Result};

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Determine the builder project: metadata server, then gcloud config.
pub async fn resolve_project() -> Result<String> {
    if let Some(project) = metadata_get("/project/project-id").await {
        return Ok(project);
    }

    let out = gcloud(&["config", "get-value", "project"])
        .await
        .map_err(Error::ProjectResolution)?;
    if out.is_empty() || out == "(unset)" {
        return Err(Error::ProjectResolution(
            "gcloud has no default project configured".into(),
        ));
    }
    Ok(out)
}

/// Obtain an access token for the compute/storage API clients:
/// metadata service account token, then `gcloud auth print-access-token`.
pub async fn fetch_access_token() -> Result<String> {
    if let Some(body) = metadata_get("/instance/service-accounts/default/token").await {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
            if let Some(token) = value["access_token"].as_str() {
                return Ok(token.to_string());
            }
        }
    }

    let token = gcloud(&["auth", "print-access-token"])
        .await
        .map_err(Error::TokenAcquisition)?;
    if token.is_empty() {
        return Err(Error::TokenAcquisition(
            "gcloud produced an empty access token".into(),
        ));
    }
    Ok(token)
}

/// GET a metadata path. `None` when not on GCE (or the path is absent);
/// the connect timeout is short so local runs fall through quickly.
async fn metadata_get(path: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;

    let resp = client
        .get(format!("{METADATA_BASE}{path}"))
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .ok()?;

    if !resp.status().is_success() {
        return None;
    }
    resp.text().await.ok().map(|s| s.trim().to_string())
}

async fn gcloud(args: &[&str]) -> std::result::Result<String, String> {
    let output = tokio::process::Command::new("gcloud")
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to run gcloud: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "gcloud {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
