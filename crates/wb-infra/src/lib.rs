pub mod auth;
pub mod bucket;
pub mod firewall;
pub mod instance;
pub mod network;
pub mod password;
pub mod remote;

use std::time::Duration;

pub use instance::{BuildServer, BuildServerConfig, parse_labels};
pub use network::NetworkConfig;
pub use remote::RemoteServer;
pub use winrm_api::powershell;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute api error: {0}")]
    Compute(#[from] gce_api::Error),

    #[error("storage api error: {0}")]
    Storage(#[from] gcs_api::Error),

    #[error("winrm error: {0}")]
    WinRm(#[from] winrm_api::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("image family not found: {0}")]
    ImageFamilyNotFound(String),

    #[error("compute operation {name} completed with errors: {detail}")]
    OperationFailed { name: String, detail: String },

    #[error("compute operation {0} timed out")]
    OperationTimeout(String),

    #[error("timed out waiting for password response from instance {0}")]
    CredentialTimeout(String),

    #[error("password response from instance {instance} could not be decrypted: {reason}")]
    CredentialDecrypt { instance: String, reason: String },

    #[error("timed out waiting for server {0} to accept WinRM connections and run docker")]
    SetupTimeout(String),

    #[error("remote command failed with exit-code:{0}")]
    RemoteCommand(i32),

    #[error("remote call timed out after {0:?}")]
    RemoteTimeout(Duration),

    #[error("could not determine a usable IP address for instance {0}")]
    NoUsableIp(String),

    #[error(
        "project {project} does not have a firewall rule to allow WinRM ingress. Please run:\n  {remediation}"
    )]
    FirewallMissing { project: String, remediation: String },

    #[error("failed to resolve builder project: {0}")]
    ProjectResolution(String),

    #[error("failed to obtain an access token: {0}")]
    TokenAcquisition(String),

    #[error("bucket setup failed: {0}")]
    BucketSetup(String),

    #[error("failed to create the final multi-arch manifest")]
    ManifestNotCreated,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
