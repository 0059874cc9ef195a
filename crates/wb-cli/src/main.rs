mod config;
mod orchestrate;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gce_api::ComputeClient;
use gcs_api::StorageClient;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, RunConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting Windows multi-arch container builder");

    let cli = Cli::parse();

    // Version selection is validated before any cloud resource is touched.
    let versions = match config::picked_version_map(&cli) {
        Ok(versions) => versions,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let project = match &cli.project {
        Some(project) => project.clone(),
        None => match wb_infra::auth::resolve_project().await {
            Ok(project) => project,
            Err(e) => {
                error!(error = %e, "failed to get builder project ID");
                return ExitCode::FAILURE;
            }
        },
    };

    let token = match wb_infra::auth::fetch_access_token().await {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "failed to authenticate against Google Cloud");
            return ExitCode::FAILURE;
        }
    };
    let compute = ComputeClient::new(token.clone());
    let storage = StorageClient::new(token);

    let config = Arc::new(RunConfig::new(cli, project, versions));

    if let Err(e) = setup_project_for_builder(&config, &compute, &storage).await {
        error!(error = %e, "failed to set up builder project");
        return ExitCode::FAILURE;
    }

    match orchestrate::run(config, compute, storage).await {
        Ok(()) => {
            info!("Windows multi-arch container building process is completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Windows multi-arch container building process failed");
            ExitCode::FAILURE
        }
    }
}

/// Environment preflight: the workspace bucket must exist and, unless
/// the caller opted out, the WinRM firewall rules must be in place
/// before any instance is created.
async fn setup_project_for_builder(
    config: &RunConfig,
    compute: &ComputeClient,
    storage: &StorageClient,
) -> wb_infra::Result<()> {
    wb_infra::bucket::ensure_workspace_bucket(storage, &config.project, &config.workspace_bucket)
        .await?;

    if config.skip_firewall_check || config.use_internal_ip {
        info!("skipping checks that WinRM firewall rules exist");
        return Ok(());
    }
    wb_infra::firewall::check_project_firewalls(compute, &config.network, &config.project).await
}
