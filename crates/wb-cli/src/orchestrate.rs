//! Concurrent build fan-out and multi-arch manifest assembly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use gce_api::ComputeClient;
use gcs_api::StorageClient;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wb_infra::{BuildServer, Error, Result, powershell};

use crate::config::RunConfig;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The three-way result of one version's build task: built (server, no
/// error), skipped because the base image no longer exists (neither), or
/// failed (error, possibly with a still-running server to tear down).
struct BuildOutcome {
    version: String,
    server: Option<BuildServer>,
    error: Option<Error>,
}

impl BuildOutcome {
    fn built(version: &str, server: BuildServer) -> Self {
        Self { version: version.to_string(), server: Some(server), error: None }
    }

    fn skipped(version: &str) -> Self {
        Self { version: version.to_string(), server: None, error: None }
    }

    fn failed(version: &str, server: Option<BuildServer>, error: Error) -> Self {
        Self { version: version.to_string(), server, error: Some(error) }
    }
}

/// Run the whole orchestration: single-arch builds in parallel, then the
/// manifest on any surviving server, then teardown of every provisioned
/// instance regardless of the verdict.
pub async fn run(
    config: Arc<RunConfig>,
    compute: ComputeClient,
    storage: StorageClient,
) -> Result<()> {
    let mut outcomes = build_single_arch_containers(&config, &compute, &storage).await?;

    // Fail fast on any build error: a manifest missing a version that
    // should have built is worse than no manifest at all.
    let manifest_result = if outcomes.iter().all(|o| o.error.is_none()) {
        build_multi_arch_container(&config, &outcomes).await
    } else {
        Err(Error::ManifestNotCreated)
    };

    shutdown_build_servers(&config, &outcomes).await;

    if let Some(e) = outcomes.iter_mut().find_map(|o| o.error.take()) {
        return Err(e);
    }
    manifest_result
}

/// Bring up one build server per version and build the single-arch
/// containers in parallel. Tasks report through a channel sized to the
/// task count; draining anything other than exactly that many results is
/// an internal-consistency error, never silently tolerated.
async fn build_single_arch_containers(
    config: &Arc<RunConfig>,
    compute: &ComputeClient,
    storage: &StorageClient,
) -> Result<Vec<BuildOutcome>> {
    let count = config.versions.len();
    let (tx, mut rx) = mpsc::channel(count);

    let mut tasks = Vec::with_capacity(count);
    for (version, image_family) in config.versions.clone() {
        let tx = tx.clone();
        let config = Arc::clone(config);
        let compute = compute.clone();
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            let outcome =
                build_single_arch_container(&config, &compute, &storage, &version, &image_family)
                    .await;
            let _ = tx.send(outcome).await;
        }));
    }
    drop(tx);

    for task in tasks {
        task.await
            .map_err(|e| Error::Internal(format!("build task panicked: {e}")))?;
    }

    let outcomes = drain_exactly(&mut rx, count)?;
    for outcome in &outcomes {
        if let Some(e) = &outcome.error {
            error!(version = %outcome.version, error = %e, "single-arch container build failed");
        }
    }
    Ok(outcomes)
}

/// Drain the result channel, enforcing that the number of results equals
/// the number of launched tasks.
fn drain_exactly<T>(rx: &mut mpsc::Receiver<T>, expected: usize) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(expected);
    while let Ok(result) = rx.try_recv() {
        results.push(result);
    }
    if results.len() != expected {
        return Err(Error::Internal(format!(
            "expected {expected} build results but drained {}",
            results.len()
        )));
    }
    Ok(results)
}

/// Bring up one Windows build server and run the single-arch build on it.
///
/// A server is returned inside failed outcomes too, so teardown can
/// reach instances whose build broke halfway.
async fn build_single_arch_container(
    config: &RunConfig,
    compute: &ComputeClient,
    storage: &StorageClient,
    version: &str,
    image_family: &str,
) -> BuildOutcome {
    let server_config = config.build_server_config(version, image_family);

    let mut existing = None;
    if config.reuse_builder_instances {
        info!(version, "looking for an existing instance to reuse");
        match BuildServer::find_reusable(compute, &config.project, &server_config).await {
            Ok(found) => existing = found,
            Err(e) => warn!(version, error = %e, "reuse lookup failed, creating a new instance"),
        }
    }

    let mut server = match existing {
        Some(server) => server,
        None => match BuildServer::create(compute, &config.project, &server_config).await {
            Ok(server) => server,
            Err(Error::ImageFamilyNotFound(family)) => {
                info!(
                    version,
                    family = %family,
                    "image family not found, it may be expired; continuing without this version's manifest"
                );
                return BuildOutcome::skipped(version);
            }
            Err(e) => return BuildOutcome::failed(version, None, e),
        },
    };
    server.remote.workspace_bucket = Some(config.workspace_bucket.clone());

    info!(
        version,
        host = %server.remote.hostname,
        instance = %server.instance_name(),
        "waiting for instance to become available"
    );
    if let Err(e) = server.remote.wait_ready(config.setup_timeout).await {
        return BuildOutcome::failed(version, Some(server), e);
    }

    info!(version, host = %server.remote.hostname, "copying local workspace to remote machine");
    if let Err(e) = server
        .remote
        .copy(storage, &config.workspace_path, config.copy_timeout)
        .await
    {
        return BuildOutcome::failed(version, Some(server), e);
    }

    let script = single_arch_build_script(&config.container_image_name, version, &config.build_args);
    info!(version, "starting single-arch container build");
    if let Err(e) = server
        .remote
        .run_command(&powershell(&script), &server.remote.workspace_folder, COMMAND_TIMEOUT)
        .await
    {
        return BuildOutcome::failed(version, Some(server), e);
    }

    BuildOutcome::built(version, server)
}

/// Create and push the multi-arch manifest on the first server whose
/// build succeeded. `docker manifest create` tolerates references to
/// versions that were skipped, so the argument list names every
/// attempted version. Attempted once; a failure is not retried on
/// another server.
async fn build_multi_arch_container(config: &RunConfig, outcomes: &[BuildOutcome]) -> Result<()> {
    let Some(server) = outcomes.iter().find_map(|o| o.server.as_ref()) else {
        error!("no build server survived to assemble the manifest");
        return Err(Error::ManifestNotCreated);
    };

    let args = manifest_create_args(&config.container_image_name, config.versions.keys());
    let script = manifest_script(&config.container_image_name, &args);
    info!(host = %server.remote.hostname, "creating and pushing the multi-arch manifest");

    match server
        .remote
        .run_command(&powershell(&script), &server.remote.workspace_folder, COMMAND_TIMEOUT)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(host = %server.remote.hostname, error = %e, "manifest creation failed");
            Err(Error::ManifestNotCreated)
        }
    }
}

/// Tear down all provisioned servers. In reuse mode only the remote
/// workspace folders are wiped and the instances keep running for a
/// future run to discover. Failures are logged, never escalated.
async fn shutdown_build_servers(config: &RunConfig, outcomes: &[BuildOutcome]) {
    let servers: Vec<&BuildServer> = outcomes.iter().filter_map(|o| o.server.as_ref()).collect();

    if config.reuse_builder_instances {
        info!("keeping instances for reuse");
        join_all(servers.into_iter().map(|server| async move {
            if let Err(e) = server.remote.clean_workspace().await {
                warn!(
                    host = %server.remote.hostname,
                    error = %e,
                    "failed to clean up workspace folder"
                );
            }
        }))
        .await;
        return;
    }

    info!("deleting created instances");
    join_all(servers.into_iter().map(|server| server.delete())).await;
}

/// Script run on each build server: authenticate Docker for the target
/// registry, build the version-suffixed image, push it. Build args and
/// image names are interpolated verbatim; quoting is the caller's
/// contract.
fn single_arch_build_script(image_name: &str, version: &str, build_args: &[String]) -> String {
    let registry = image_name.split('/').next().unwrap_or_default();
    let registry = if registry == "gcr.io" { "" } else { registry };

    let mut buildargs = String::new();
    for arg in build_args {
        buildargs.push_str("--build-arg ");
        buildargs.push_str(arg);
        buildargs.push(' ');
    }

    format!(
        r#"
$env:DOCKER_CLI_EXPERIMENTAL = 'enabled'
gcloud auth --quiet configure-docker {registry}
docker build -t {image_name}_{version} --build-arg WINDOWS_VERSION={version} {buildargs}.
docker push {image_name}_{version}
"#
    )
}

fn manifest_script(image_name: &str, manifest_create_args: &str) -> String {
    format!(
        r#"
$env:DOCKER_CLI_EXPERIMENTAL = 'enabled'
docker manifest create {manifest_create_args}
docker manifest push {image_name}
"#
    )
}

/// `image:tag image:tag_<v1> image:tag_<v2> ...` for every attempted
/// version, skipped ones included.
fn manifest_create_args<'a>(
    image_name: &str,
    versions: impl Iterator<Item = &'a String>,
) -> String {
    let mut args = image_name.to_string();
    for version in versions {
        args.push(' ');
        args.push_str(image_name);
        args.push('_');
        args.push_str(version);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn manifest_args_name_every_attempted_version() {
        let versions = BTreeMap::from([
            ("2004".to_string(), "famA".to_string()),
            ("ltsc2019".to_string(), "famB".to_string()),
        ]);
        let args = manifest_create_args("demo:tag", versions.keys());
        assert_eq!(args, "demo:tag demo:tag_2004 demo:tag_ltsc2019");
    }

    #[test]
    fn build_script_suffixes_image_and_forwards_build_args() {
        let script = single_arch_build_script(
            "us-docker.pkg.dev/p/r/demo:tag",
            "ltsc2019",
            &["FOO=bar".to_string(), "BAZ=qux".to_string()],
        );
        assert!(script.contains("gcloud auth --quiet configure-docker us-docker.pkg.dev"));
        assert!(script.contains(
            "docker build -t us-docker.pkg.dev/p/r/demo:tag_ltsc2019 --build-arg WINDOWS_VERSION=ltsc2019 --build-arg FOO=bar --build-arg BAZ=qux ."
        ));
        assert!(script.contains("docker push us-docker.pkg.dev/p/r/demo:tag_ltsc2019"));
    }

    #[test]
    fn gcr_registry_needs_no_configure_docker_argument() {
        let script = single_arch_build_script("gcr.io/p/demo:tag", "2004", &[]);
        assert!(script.contains("gcloud auth --quiet configure-docker \n"));
    }

    #[test]
    fn drain_exactly_enforces_the_task_count_invariant() {
        let (tx, mut rx) = mpsc::channel(3);
        for i in 0..3 {
            tx.try_send(i).unwrap();
        }
        drop(tx);
        assert_eq!(drain_exactly(&mut rx, 3).unwrap(), vec![0, 1, 2]);

        let (tx, mut rx) = mpsc::channel::<u32>(3);
        tx.try_send(7).unwrap();
        drop(tx);
        assert!(matches!(drain_exactly(&mut rx, 3), Err(Error::Internal(_))));
    }
}
