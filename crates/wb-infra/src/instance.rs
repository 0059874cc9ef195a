//! Builder instance lifecycle: create, discover-and-reuse, delete.

use std::collections::BTreeMap;
use std::time::Duration;

use gce_api::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, ComputeClient, Instance,
    InsertInstanceRequest, Metadata, MetadataItem, NetworkInterface, Operation, ServiceAccount,
};
use rand::seq::SliceRandom as _;
use tracing::{info, warn};

use crate::network::{COMPUTE_URL_PREFIX, NetworkConfig};
use crate::remote::RemoteServer;
use crate::{Error, Result, password};

const DEFAULT_MACHINE_TYPE: &str = "e2-standard-2";
const ADMIN_USERNAME: &str = "builder";

const OPERATION_DEADLINE: Duration = Duration::from_secs(300);
const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Desired shape of a Windows build server. Constructed once per version
/// build attempt and read-only thereafter.
#[derive(Debug, Clone)]
pub struct BuildServerConfig {
    pub instance_name_prefix: String,
    pub image_version: String,
    /// Image family reference, e.g.
    /// `windows-cloud/global/images/family/windows-2004-core`.
    pub image_family: String,
    pub zone: String,
    pub network: NetworkConfig,
    pub labels: BTreeMap<String, String>,
    /// Empty means the default machine type.
    pub machine_type: String,
    pub boot_disk_type: String,
    pub boot_disk_size_gb: i64,
    pub service_account: String,
    pub use_internal_ip: bool,
    pub external_nat: bool,
    /// Registry for which the Docker daemon should allow pushing
    /// nondistributable (foreign) layers, if any.
    pub allow_nondistributable_artifacts: Option<String>,
}

impl BuildServerConfig {
    fn machine_type_or_default(&self) -> &str {
        if self.machine_type.is_empty() {
            DEFAULT_MACHINE_TYPE
        } else {
            &self.machine_type
        }
    }

    /// `default` and full emails pass through; bare account names get the
    /// project's IAM service-account suffix.
    pub fn service_account_email(&self, project: &str) -> String {
        if self.service_account == "default" || self.service_account.contains('@') {
            return self.service_account.clone();
        }
        format!("{}@{project}.iam.gserviceaccount.com", self.service_account)
    }

    /// Filter expression for discovering reusable instances: running,
    /// name-prefixed, and carrying every configured label.
    pub fn list_filter(&self) -> String {
        let mut filters = vec![
            "(status eq RUNNING)".to_string(),
            format!("(name eq {}.*)", self.instance_name_prefix),
        ];
        for (key, value) in &self.labels {
            filters.push(format!("(labels.{key} eq {value})"));
        }
        filters.join(" ")
    }
}

/// Parse comma-separated `key=value` labels. Malformed entries are
/// logged and ignored, matching the CLI contract.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if raw.is_empty() {
        return labels;
    }
    for label in raw.split(',') {
        let Some((key, value)) = label.split_once('=') else {
            warn!(label, "label needs to be a key=value pair, ignored");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            warn!(label, "label key can't be empty, ignored");
            continue;
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    labels
}

/// Startup script installed under `windows-startup-script-ps1`.
///
/// Disables Windows Defender real-time scanning (it locks
/// `C:\ProgramData\Docker` during builds), installs the Containers
/// feature and Docker, and enables WinRM basic auth. The machine may
/// reboot while this runs; callers tolerate that via the readiness wait.
fn startup_script(allow_nondistributable_artifacts: Option<&str>) -> String {
    let nondistributable = match allow_nondistributable_artifacts {
        Some(registry) => format!(
            r#"
Write-Host 'Configuring Docker to push nondistributable artifacts to {registry}'
if (!(Test-Path 'C:\ProgramData\docker\config\daemon.json'))
{{
    New-Item -Force -Path 'C:\ProgramData\docker\config' -Name 'daemon.json' -Type 'file' -Value '{{}}'
}}
$config = Get-Content 'C:\ProgramData\docker\config\daemon.json' -raw | ConvertFrom-Json
$config | Add-Member -NotePropertyName 'allow-nondistributable-artifacts' -NotePropertyValue @('{registry}')
$config | ConvertTo-Json -depth 32 | Set-Content 'C:\ProgramData\docker\config\daemon.json'
"#
        ),
        None => String::new(),
    };

    format!(
        r#"
# Windows Defender may scan C:\ProgramData\Docker\ and lock it against docker build.
if ((Get-WindowsFeature -Name 'Windows-Defender').Installed) {{
    Write-Host "Disabling Windows Defender service"
    Set-MpPreference -DisableRealtimeMonitoring $true
    Uninstall-WindowsFeature -Name 'Windows-Defender'
    Restart-Computer -Force
}}

function Test-ContainersFeatureInstalled {{
    return (Get-WindowsFeature Containers).Installed
}}
# After this function returns, the computer must be restarted to complete
# the installation!
function Install-ContainersFeature {{
    Write-Host "Installing Windows 'Containers' feature"
    Install-WindowsFeature Containers
}}
function Test-DockerIsInstalled {{
    return ((Get-Package -ProviderName DockerMsftProvider -ErrorAction SilentlyContinue | Where-Object Name -eq 'docker') -ne $null)
}}
function Test-DockerIsRunning {{
    return ((Get-Service docker).Status -eq 'Running')
}}
function Install-Docker {{
    Write-Host 'Installing NuGet module'
    Install-PackageProvider -Name NuGet -MinimumVersion 2.8.5.201 -Force
    Write-Host 'Installing DockerMsftProvider module'
    Install-Module -Name DockerMsftProvider -Repository PSGallery -Force
    Write-Host "Installing latest Docker EE version"
    Install-Package -Name docker -ProviderName DockerMsftProvider -Force -Verbose
}}
if (-not (Test-ContainersFeatureInstalled)) {{
    Install-ContainersFeature
    Write-Host 'Restarting computer after enabling Windows Containers feature'
    Restart-Computer -Force
    # Restart-Computer does not stop the rest of the script from executing.
    exit 0
}}
if (-not (Test-DockerIsInstalled)) {{
    Install-Docker
}}
{nondistributable}
# The docker service may not come up automatically on the first reboot.
Restart-Service docker
Start-Sleep 5
if (-not (Test-DockerIsRunning)) {{
    throw "docker service failed to start or stay running"
}}

# Setup Winrm
winrm set winrm/config/service/auth '@{{Basic="true"}}'

Write-Host 'Windows instance setup is completed'
"#
    )
}

/// A provisioned Windows build server: the GCE instance plus the
/// credentials to drive it over WinRM.
pub struct BuildServer {
    compute: ComputeClient,
    project: String,
    zone: String,
    instance_name: String,
    pub remote: RemoteServer,
}

impl BuildServer {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Create a new build server and complete the credential exchange.
    ///
    /// An insert rejected because the image family no longer exists maps
    /// to [`Error::ImageFamilyNotFound`], which callers treat as "skip
    /// this version", not as a run failure.
    pub async fn create(
        compute: &ComputeClient,
        project: &str,
        cfg: &BuildServerConfig,
    ) -> Result<Self> {
        let name = format!("{}{}", cfg.instance_name_prefix, uuid::Uuid::new_v4());
        let req = insert_request(&name, project, cfg);

        let op = match compute.insert_instance(project, &cfg.zone, &req).await {
            Ok(op) => op,
            Err(e) if e.is_resource_not_found(&cfg.image_family) => {
                return Err(Error::ImageFamilyNotFound(cfg.image_family.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        wait_for_zone_operation(compute, project, &cfg.zone, &op).await?;

        let instance = compute.get_instance(project, &cfg.zone, &name).await?;
        info!(
            instance = %instance.name,
            version = %cfg.image_version,
            "successfully created instance"
        );

        Self::connect(compute, project, cfg, instance).await
    }

    /// Look for a running instance matching the config's name prefix and
    /// labels. Picks uniformly at random among matches so concurrent
    /// orchestration runs spread over the pool instead of contending for
    /// the same head-of-list instance.
    pub async fn find_reusable(
        compute: &ComputeClient,
        project: &str,
        cfg: &BuildServerConfig,
    ) -> Result<Option<Self>> {
        let list = compute
            .list_instances(project, &cfg.zone, Some(&cfg.list_filter()))
            .await?;

        // The name/label filter is server-side; attached-network matching
        // happens here so instances on other networks are never reused.
        let candidates: Vec<&Instance> = list
            .items
            .iter()
            .filter(|i| {
                i.network_interfaces.iter().any(|ni| {
                    cfg.network
                        .matches_interface(ni.network.as_deref(), ni.subnetwork.as_deref())
                })
            })
            .collect();

        let Some(chosen) = candidates
            .choose(&mut rand::thread_rng())
            .map(|i| i.name.clone())
        else {
            info!(version = %cfg.image_version, "found no relevant instances to reuse");
            return Ok(None);
        };
        info!(
            candidates = candidates.len(),
            version = %cfg.image_version,
            chosen = %chosen,
            "reusing existing instance"
        );

        let instance = compute.get_instance(project, &cfg.zone, &chosen).await?;
        Self::connect(compute, project, cfg, instance).await.map(Some)
    }

    /// Exchange credentials and resolve the connection address for a
    /// created or discovered instance.
    async fn connect(
        compute: &ComputeClient,
        project: &str,
        cfg: &BuildServerConfig,
        instance: Instance,
    ) -> Result<Self> {
        let password =
            password::exchange(compute, project, &cfg.zone, &instance, ADMIN_USERNAME).await?;

        // The exchange mutates metadata; re-read for fresh interface state.
        let refreshed = compute.get_instance(project, &cfg.zone, &instance.name).await?;
        let ip = instance_ip(&refreshed, cfg.use_internal_ip)?;

        Ok(Self {
            compute: compute.clone(),
            project: project.to_string(),
            zone: cfg.zone.clone(),
            instance_name: refreshed.name,
            remote: RemoteServer::new(ip, ADMIN_USERNAME, password),
        })
    }

    /// Tear the instance down. Best-effort: the run's outcome never
    /// depends on successful teardown.
    pub async fn delete(&self) {
        match self
            .compute
            .delete_instance(&self.project, &self.zone, &self.instance_name)
            .await
        {
            Ok(()) => info!(instance = %self.instance_name, "instance shut down"),
            Err(e) => {
                warn!(instance = %self.instance_name, error = %e, "could not delete instance");
            }
        }
    }
}

fn insert_request(name: &str, project: &str, cfg: &BuildServerConfig) -> InsertInstanceRequest {
    let access_configs = cfg.external_nat.then(|| {
        vec![AccessConfig {
            config_kind: "ONE_TO_ONE_NAT".into(),
            name: "External NAT".into(),
        }]
    });

    InsertInstanceRequest {
        name: name.to_string(),
        machine_type: format!(
            "{COMPUTE_URL_PREFIX}{project}/zones/{}/machineTypes/{}",
            cfg.zone,
            cfg.machine_type_or_default()
        ),
        disks: vec![AttachedDisk {
            auto_delete: true,
            boot: true,
            disk_kind: "PERSISTENT".into(),
            initialize_params: AttachedDiskInitializeParams {
                disk_name: format!("{name}-pd"),
                source_image: format!("{COMPUTE_URL_PREFIX}{}", cfg.image_family),
                disk_type: format!(
                    "{COMPUTE_URL_PREFIX}{project}/zones/{}/diskTypes/{}",
                    cfg.zone, cfg.boot_disk_type
                ),
                disk_size_gb: cfg.boot_disk_size_gb,
            },
        }],
        metadata: Metadata {
            fingerprint: None,
            items: vec![MetadataItem {
                key: "windows-startup-script-ps1".into(),
                value: Some(startup_script(
                    cfg.allow_nondistributable_artifacts.as_deref(),
                )),
            }],
        },
        network_interfaces: vec![NetworkInterface {
            network: cfg.network.instance_network_url(),
            subnetwork: Some(cfg.network.instance_subnetwork_url()),
            access_configs,
        }],
        service_accounts: vec![ServiceAccount {
            email: cfg.service_account_email(project),
            scopes: vec!["https://www.googleapis.com/auth/cloud-platform".into()],
        }],
        labels: (!cfg.labels.is_empty()).then(|| cfg.labels.clone()),
    }
}

/// IP to manage the server over: the internal address under the
/// internal-IP policy, the External NAT address otherwise.
fn instance_ip(instance: &Instance, use_internal_ip: bool) -> Result<String> {
    for ni in &instance.network_interfaces {
        if use_internal_ip {
            if let Some(ip) = &ni.network_ip {
                return Ok(ip.clone());
            }
            continue;
        }
        for ac in &ni.access_configs {
            if ac.name.as_deref() == Some("External NAT") {
                if let Some(ip) = &ac.nat_ip {
                    return Ok(ip.clone());
                }
            }
        }
    }
    Err(Error::NoUsableIp(instance.name.clone()))
}

/// Poll a zone operation until DONE, within the fixed 300 s deadline.
pub(crate) async fn wait_for_zone_operation(
    compute: &ComputeClient,
    project: &str,
    zone: &str,
    op: &Operation,
) -> Result<()> {
    info!(operation = %op.name, "waiting for compute operation to complete");
    let deadline = tokio::time::Instant::now() + OPERATION_DEADLINE;

    while tokio::time::Instant::now() < deadline {
        let current = compute.get_zone_operation(project, zone, &op.name).await?;
        if current.status == "DONE" {
            let errors = current.error.map(|e| e.errors).unwrap_or_default();
            if errors.is_empty() {
                return Ok(());
            }
            let detail = errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::OperationFailed {
                name: current.name,
                detail,
            });
        }
        tokio::time::sleep(OPERATION_POLL_INTERVAL).await;
    }
    Err(Error::OperationTimeout(op.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BuildServerConfig {
        BuildServerConfig {
            instance_name_prefix: "windows-builder-".into(),
            image_version: "2004".into(),
            image_family: "windows-cloud/global/images/family/windows-2004-core".into(),
            zone: "us-central1-f".into(),
            network: NetworkConfig::resolve("proj", "default", "", "default", "", "us-central1"),
            labels: BTreeMap::new(),
            machine_type: String::new(),
            boot_disk_type: "pd-standard".into(),
            boot_disk_size_gb: 75,
            service_account: "default".into(),
            use_internal_ip: false,
            external_nat: true,
            allow_nondistributable_artifacts: None,
        }
    }

    #[test]
    fn list_filter_combines_status_prefix_and_labels() {
        let mut cfg = config();
        cfg.labels = parse_labels("team=builders,env=ci");
        let filter = cfg.list_filter();
        assert!(filter.starts_with("(status eq RUNNING) (name eq windows-builder-.*)"));
        assert!(filter.contains("(labels.team eq builders)"));
        assert!(filter.contains("(labels.env eq ci)"));
    }

    #[test]
    fn labels_parsing_skips_malformed_entries() {
        let labels = parse_labels("a=1, b = 2 ,broken,=nokey,c=3");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["a"], "1");
        assert_eq!(labels["b"], "2");
        assert_eq!(labels["c"], "3");
    }

    #[test]
    fn service_account_email_expansion() {
        let mut cfg = config();
        assert_eq!(cfg.service_account_email("proj"), "default");

        cfg.service_account = "builder-sa".into();
        assert_eq!(
            cfg.service_account_email("proj"),
            "builder-sa@proj.iam.gserviceaccount.com"
        );

        cfg.service_account = "x@y.iam.gserviceaccount.com".into();
        assert_eq!(cfg.service_account_email("proj"), "x@y.iam.gserviceaccount.com");
    }

    #[test]
    fn insert_request_shape() {
        let cfg = config();
        let req = insert_request("windows-builder-abc", "proj", &cfg);

        assert!(req.machine_type.ends_with("/zones/us-central1-f/machineTypes/e2-standard-2"));
        assert_eq!(req.disks[0].initialize_params.disk_name, "windows-builder-abc-pd");
        assert!(
            req.disks[0]
                .initialize_params
                .source_image
                .ends_with("windows-cloud/global/images/family/windows-2004-core")
        );
        assert_eq!(req.metadata.items[0].key, "windows-startup-script-ps1");
        assert!(req.network_interfaces[0].network.is_some());
        assert!(req.network_interfaces[0].access_configs.is_some());
        assert!(req.labels.is_none());
    }

    #[test]
    fn insert_request_omits_network_for_shared_vpc_and_nat_when_internal() {
        let mut cfg = config();
        cfg.network =
            NetworkConfig::resolve("proj", "shared-net", "", "shared-sub", "host-proj", "us-central1");
        cfg.external_nat = false;
        let req = insert_request("n", "proj", &cfg);
        assert!(req.network_interfaces[0].network.is_none());
        assert!(req.network_interfaces[0].subnetwork.is_some());
        assert!(req.network_interfaces[0].access_configs.is_none());
    }

    #[test]
    fn instance_ip_prefers_policy() {
        let raw = r#"{
            "name": "i",
            "networkInterfaces": [{
                "networkIP": "10.0.0.5",
                "accessConfigs": [{"name": "External NAT", "natIP": "35.0.0.1"}]
            }]
        }"#;
        let inst: Instance = serde_json::from_str(raw).unwrap();
        assert_eq!(instance_ip(&inst, false).unwrap(), "35.0.0.1");
        assert_eq!(instance_ip(&inst, true).unwrap(), "10.0.0.5");
    }

    #[test]
    fn instance_without_nat_ip_is_an_error() {
        let raw = r#"{"name": "i", "networkInterfaces": [{"networkIP": "10.0.0.5"}]}"#;
        let inst: Instance = serde_json::from_str(raw).unwrap();
        assert!(matches!(instance_ip(&inst, false), Err(Error::NoUsableIp(_))));
    }

    #[test]
    fn startup_script_gates_nondistributable_section() {
        let bare = startup_script(None);
        assert!(!bare.contains("allow-nondistributable-artifacts"));
        let with = startup_script(Some("my.registry.example"));
        assert!(with.contains("allow-nondistributable-artifacts"));
        assert!(with.contains("my.registry.example"));
    }
}
