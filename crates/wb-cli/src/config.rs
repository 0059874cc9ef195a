//! CLI surface and the immutable per-run configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use wb_infra::{NetworkConfig, parse_labels};

/// Version label → GCE image family reference.
///
/// Families, not specific images: the family tracks the latest base
/// image of each release line. Version labels must match the servercore
/// tags used by the Dockerfile being built.
pub fn default_version_map() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "2004".to_string(),
            "windows-cloud/global/images/family/windows-2004-core".to_string(),
        ),
        (
            "20H2".to_string(),
            "windows-cloud/global/images/family/windows-20h2-core".to_string(),
        ),
        (
            "ltsc2019".to_string(),
            "windows-cloud/global/images/family/windows-2019-core-for-containers".to_string(),
        ),
    ])
}

/// Image family that no longer exists; used to verify that obsolete
/// versions degrade gracefully instead of failing the build.
pub const OBSOLETE_TEST_VERSION: (&str, &str) = (
    "1809",
    "windows-cloud/global/images/family/windows-1809-core-for-containers",
);

/// Builds a multi-arch Windows container image by running one Docker
/// build per Windows Server version on ephemeral GCE instances.
#[derive(Debug, Parser)]
#[command(name = "winbuilder")]
pub struct Cli {
    /// Project to create the Windows instances in (defaults to the
    /// active gcloud/metadata project)
    #[arg(long)]
    pub project: Option<String>,

    /// The directory to copy data from
    #[arg(long, default_value = "/workspace")]
    pub workspace_path: PathBuf,

    /// The bucket to copy the directory to. Defaults to
    /// {project-id}_builder_tmp
    #[arg(long)]
    pub workspace_bucket: Option<String>,

    /// The VPC network to use when creating the Windows instances
    #[arg(long, default_value = "default")]
    pub network: String,

    /// The project where the VPC network is located (inferred if not
    /// specified)
    #[arg(long, default_value = "")]
    pub network_project: String,

    /// The subnetwork name to use when creating the Windows instances
    #[arg(long, default_value = "default")]
    pub subnetwork: String,

    /// The project where the subnetwork is located (uses
    /// --network-project if not specified)
    #[arg(long, default_value = "")]
    pub subnetwork_project: String,

    /// The region to create the Windows instances in (where the
    /// subnetwork is located)
    #[arg(long, default_value = "us-central1")]
    pub region: String,

    /// The zone to use when creating the Windows instances
    #[arg(long, default_value = "us-central1-f")]
    pub zone: String,

    /// Comma-separated KEY=VALUE labels to add to created instances
    #[arg(long, default_value = "")]
    pub labels: String,

    /// The machine type to use when creating the Windows instances
    #[arg(long, default_value = "")]
    pub machine_type: String,

    /// Instance boot disk type (pd-standard, pd-balanced, pd-ssd)
    #[arg(long, default_value = "pd-standard")]
    pub boot_disk_type: String,

    /// Instance boot disk size in GB. Must be at least 40 GB
    #[arg(long, default_value_t = 75)]
    pub boot_disk_size_gb: i64,

    /// The workspace copy timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub copy_timeout: u64,

    /// The service account to attach to the Windows instances
    #[arg(long, default_value = "default")]
    pub service_account: String,

    /// The target container image:tag name
    #[arg(long, required = true)]
    pub container_image_name: String,

    /// Comma-separated Windows Server versions to build for. Defaults to
    /// every supported version
    #[arg(long, default_value = "")]
    pub versions: String,

    /// Look for existing instances by labels and instance-name-prefix
    /// and reuse them, creating new instances only when none match.
    /// Avoid when queuing parallel builds
    #[arg(long)]
    pub reuse_builder_instances: bool,

    /// Prefix for created GCE instance names
    #[arg(long, default_value = "windows-builder-")]
    pub instance_name_prefix: String,

    /// Verify that obsolete Windows versions don't fail the builder.
    /// For testing purposes only
    #[arg(long)]
    pub testonly_test_obsolete_versions: bool,

    /// Seconds to wait for a Windows instance to be ready for WinRM
    /// connections and Docker
    #[arg(long, default_value_t = 1200)]
    pub setup_timeout: u64,

    /// Use internal IP addresses (for shared VPCs); implies no need for
    /// firewall rules
    #[arg(long)]
    pub use_internal_ip: bool,

    /// Create external IP addresses for VMs. If disabled, Cloud NAT must
    /// be enabled on the network
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub external_ip: bool,

    /// Skip checking that the project has a firewall rule permitting
    /// WinRM ingress
    #[arg(long)]
    pub skip_firewall_check: bool,

    /// Parameter to pass to the docker build command verbatim
    /// (repeatable)
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Registry for which Docker should allow pushing nondistributable
    /// (foreign) base layers
    #[arg(long)]
    pub allow_nondistributable_artifacts: Option<String>,
}

/// Resolve the version subset the run will build.
///
/// An unknown version name or an empty resulting subset is a fatal
/// startup error, reported before any cloud resource is touched.
pub fn picked_version_map(cli: &Cli) -> Result<BTreeMap<String, String>, String> {
    let all = default_version_map();
    let mut picked = if cli.versions.is_empty() {
        all
    } else {
        let mut picked = BTreeMap::new();
        for version in cli.versions.split(',') {
            let version = version.trim();
            if version.is_empty() {
                continue;
            }
            match all.get(version) {
                Some(family) => {
                    picked.insert(version.to_string(), family.clone());
                }
                None => {
                    return Err(format!(
                        "versions flag has unsupported Windows Server versions: {version}"
                    ));
                }
            }
        }
        picked
    };

    if picked.is_empty() {
        return Err("no supported Windows Server versions found".to_string());
    }

    if cli.testonly_test_obsolete_versions {
        let (version, family) = OBSOLETE_TEST_VERSION;
        picked.insert(version.to_string(), family.to_string());
    }

    Ok(picked)
}

/// Immutable configuration for one orchestration run. Constructed once
/// at startup and passed explicitly into every component; nothing reads
/// ambient global state.
#[derive(Debug)]
pub struct RunConfig {
    pub project: String,
    pub workspace_path: PathBuf,
    pub workspace_bucket: String,
    pub network: NetworkConfig,
    pub zone: String,
    pub labels: BTreeMap<String, String>,
    pub machine_type: String,
    pub boot_disk_type: String,
    pub boot_disk_size_gb: i64,
    pub copy_timeout: Duration,
    pub setup_timeout: Duration,
    pub service_account: String,
    pub container_image_name: String,
    pub versions: BTreeMap<String, String>,
    pub reuse_builder_instances: bool,
    pub instance_name_prefix: String,
    pub use_internal_ip: bool,
    pub external_ip: bool,
    pub skip_firewall_check: bool,
    pub build_args: Vec<String>,
    pub allow_nondistributable_artifacts: Option<String>,
}

impl RunConfig {
    pub fn new(cli: Cli, project: String, versions: BTreeMap<String, String>) -> Self {
        let workspace_bucket = cli
            .workspace_bucket
            .clone()
            .unwrap_or_else(|| format!("{project}_builder_tmp"));
        let network = NetworkConfig::resolve(
            &project,
            &cli.network,
            &cli.network_project,
            &cli.subnetwork,
            &cli.subnetwork_project,
            &cli.region,
        );

        Self {
            workspace_bucket,
            network,
            project,
            workspace_path: cli.workspace_path,
            zone: cli.zone,
            labels: parse_labels(&cli.labels),
            machine_type: cli.machine_type,
            boot_disk_type: cli.boot_disk_type,
            boot_disk_size_gb: cli.boot_disk_size_gb,
            copy_timeout: Duration::from_secs(cli.copy_timeout),
            setup_timeout: Duration::from_secs(cli.setup_timeout),
            service_account: cli.service_account,
            container_image_name: cli.container_image_name,
            versions,
            reuse_builder_instances: cli.reuse_builder_instances,
            instance_name_prefix: cli.instance_name_prefix,
            use_internal_ip: cli.use_internal_ip,
            external_ip: cli.external_ip,
            skip_firewall_check: cli.skip_firewall_check,
            build_args: cli.build_args,
            allow_nondistributable_artifacts: cli.allow_nondistributable_artifacts,
        }
    }

    pub fn build_server_config(&self, version: &str, image_family: &str) -> wb_infra::BuildServerConfig {
        wb_infra::BuildServerConfig {
            instance_name_prefix: self.instance_name_prefix.clone(),
            image_version: version.to_string(),
            image_family: image_family.to_string(),
            zone: self.zone.clone(),
            network: self.network.clone(),
            labels: self.labels.clone(),
            machine_type: self.machine_type.clone(),
            boot_disk_type: self.boot_disk_type.clone(),
            boot_disk_size_gb: self.boot_disk_size_gb,
            service_account: self.service_account.clone(),
            use_internal_ip: self.use_internal_ip,
            external_nat: self.external_ip,
            allow_nondistributable_artifacts: self.allow_nondistributable_artifacts.clone(),
        }
    }
}
