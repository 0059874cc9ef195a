//! Operations against a provisioned Windows build server.

use std::path::Path;
use std::time::Duration;

use gcs_api::StorageClient;
use tracing::{info, warn};
use winrm_api::{WinRmClient, powershell};

use crate::{Error, Result, bucket};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);
const CLEAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection handle for a remote Windows server. Lives exactly as long
/// as the owning instance; the one-time password is never persisted.
pub struct RemoteServer {
    pub hostname: String,
    username: String,
    password: String,
    /// Bucket used as the primary workspace-transfer relay. `None`
    /// disables the bucket path and goes straight to direct copy.
    pub workspace_bucket: Option<String>,
    pub workspace_folder: String,
}

impl RemoteServer {
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            password: password.into(),
            workspace_bucket: None,
            workspace_folder: format!("C:\\ws-{}", uuid::Uuid::new_v4()),
        }
    }

    fn client(&self) -> Result<WinRmClient> {
        Ok(WinRmClient::new(
            &self.hostname,
            &self.username,
            &self.password,
        )?)
    }

    /// Wait for the server to accept WinRM connections and answer a
    /// trivial Docker query. The startup script may reboot the machine
    /// mid-wait, so every failure here just means "not ready yet".
    pub async fn wait_ready(&self, setup_timeout: Duration) -> Result<()> {
        info!(
            host = %self.hostname,
            timeout = ?setup_timeout,
            "waiting for WinRM connection and Docker to be available"
        );
        let deadline = tokio::time::Instant::now() + setup_timeout;
        while tokio::time::Instant::now() < deadline {
            if self
                .run_command("docker -v", &self.workspace_folder, setup_timeout)
                .await
                .is_ok()
            {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(Error::SetupTimeout(self.hostname.clone()))
    }

    /// Materialize the local workspace under the remote workspace folder.
    ///
    /// Primary path: zip, upload to the workspace bucket, have the remote
    /// download and expand it. Any failure there falls back to streaming
    /// the archive over WinRM to the same destination. Safe to invoke
    /// once per destination; retries are the caller's concern.
    pub async fn copy(
        &self,
        storage: &StorageClient,
        workspace: &Path,
        copy_timeout: Duration,
    ) -> Result<()> {
        if copy_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "copy timeout must be greater than 0".into(),
            ));
        }

        let archive = bucket::zip_workspace(workspace)?;

        if let Some(bucket_name) = self.workspace_bucket.clone() {
            match self
                .copy_via_bucket(storage, &bucket_name, archive.clone(), copy_timeout)
                .await
            {
                Ok(()) => {
                    info!(
                        folder = %self.workspace_folder,
                        "copied workspace via storage bucket"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "failed to copy workspace via storage bucket, falling back to direct copy");
                }
            }
        }

        self.copy_direct(archive, copy_timeout).await
    }

    async fn copy_via_bucket(
        &self,
        storage: &StorageClient,
        bucket_name: &str,
        archive: Vec<u8>,
        copy_timeout: Duration,
    ) -> Result<()> {
        let object = format!("windows-builder-{}", uuid::Uuid::new_v4());
        let gs_url = bucket::upload_archive(storage, bucket_name, &object, archive).await?;

        let script = format!(
            r#"$ErrorActionPreference = "Stop"
$ProgressPreference = 'SilentlyContinue'
gsutil cp "{gs_url}" {folder}.zip
Expand-Archive -Path {folder}.zip -DestinationPath {folder} -Force
Remove-Item -Path {folder}.zip -Force
"#,
            folder = self.workspace_folder
        );
        self.run_command(&powershell(&script), &self.workspace_folder, copy_timeout)
            .await
    }

    /// Stream the archive over WinRM and expand it in place.
    async fn copy_direct(&self, archive: Vec<u8>, copy_timeout: Duration) -> Result<()> {
        let remote_zip = format!("{}.zip", self.workspace_folder);
        let client = self.client()?;

        tokio::time::timeout(copy_timeout, client.copy_file(&archive, &remote_zip))
            .await
            .map_err(|_| Error::RemoteTimeout(copy_timeout))??;

        let script = format!(
            r#"$ErrorActionPreference = "Stop"
$ProgressPreference = 'SilentlyContinue'
Expand-Archive -Path {folder}.zip -DestinationPath {folder} -Force
Remove-Item -Path {folder}.zip -Force
"#,
            folder = self.workspace_folder
        );
        self.run_command(&powershell(&script), "C:\\", copy_timeout)
            .await?;
        info!(folder = %self.workspace_folder, "copied workspace via direct copy");
        Ok(())
    }

    /// Run `command` in `path` on the remote server, streaming output to
    /// the local standard streams. A non-zero remote exit code and an
    /// elapsed timeout are both errors; a zero timeout is rejected
    /// before any connection is made.
    pub async fn run_command(
        &self,
        command: &str,
        path: &str,
        run_timeout: Duration,
    ) -> Result<()> {
        if run_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "run timeout must be greater than 0".into(),
            ));
        }

        let cmdstring = format!("cd {path} & {command}");
        let client = self.client()?;
        let exit_code = tokio::time::timeout(run_timeout, client.exec(&cmdstring))
            .await
            .map_err(|_| Error::RemoteTimeout(run_timeout))??;

        if exit_code != 0 {
            return Err(Error::RemoteCommand(exit_code));
        }
        Ok(())
    }

    /// Remove the remote workspace folder. Used instead of instance
    /// deletion when instances are kept for reuse.
    pub async fn clean_workspace(&self) -> Result<()> {
        info!(
            host = %self.hostname,
            folder = %self.workspace_folder,
            "cleaning up workspace folder"
        );
        let script = format!(
            r#"$ErrorActionPreference = "Stop"
$ProgressPreference = 'SilentlyContinue'
Remove-Item -Path {} -Recurse -Force
"#,
            self.workspace_folder
        );
        self.run_command(&powershell(&script), "C:\\", CLEAN_TIMEOUT)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> RemoteServer {
        RemoteServer::new("192.0.2.10", "builder", "pw")
    }

    #[test]
    fn workspace_folder_is_unique_per_handle() {
        let a = server();
        let b = server();
        assert!(a.workspace_folder.starts_with("C:\\ws-"));
        assert_ne!(a.workspace_folder, b.workspace_folder);
    }

    #[tokio::test]
    async fn zero_run_timeout_is_rejected_before_any_io() {
        let err = server()
            .run_command("docker -v", "C:\\", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn zero_copy_timeout_is_rejected_before_any_io() {
        let storage = gcs_api::StorageClient::new("unused-token");
        let dir = tempfile::tempdir().unwrap();
        let err = server()
            .copy(&storage, dir.path(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
