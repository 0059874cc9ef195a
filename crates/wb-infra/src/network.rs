//! Resolved network configuration for builder instances.
//!
//! All compute URL construction goes through this type so that the
//! Shared-VPC inference rule is applied the same way everywhere: when the
//! subnetwork lives in another project and no network project was given,
//! the network identifier is *omitted* and the compute API infers it from
//! the subnetwork. Instance creation and firewall checks disagreeing on
//! this is exactly the failure mode this type exists to prevent.

pub(crate) const COMPUTE_URL_PREFIX: &str = "https://www.googleapis.com/compute/v1/projects/";

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    network: String,
    /// `None` means Shared VPC: the network URL is inferred by the API.
    network_project: Option<String>,
    subnetwork: String,
    subnetwork_project: String,
    region: String,
}

impl NetworkConfig {
    /// Resolve flag values against the instance project.
    ///
    /// Empty strings mean "not given", matching the CLI contract.
    pub fn resolve(
        instance_project: &str,
        network: &str,
        network_project: &str,
        subnetwork: &str,
        subnetwork_project: &str,
        region: &str,
    ) -> Self {
        let subnetwork_project = if !subnetwork_project.is_empty() {
            subnetwork_project.to_string()
        } else if !network_project.is_empty() {
            network_project.to_string()
        } else {
            instance_project.to_string()
        };

        let network_project = if !network_project.is_empty() {
            Some(network_project.to_string())
        } else if subnetwork_project != instance_project {
            // Shared VPC: the subnetwork is owned elsewhere and the user
            // said nothing about the network, so it must be inferred.
            None
        } else {
            Some(instance_project.to_string())
        };

        Self {
            network: network.to_string(),
            network_project,
            subnetwork: subnetwork.to_string(),
            subnetwork_project,
            region: region.to_string(),
        }
    }

    pub fn is_shared_vpc(&self) -> bool {
        self.network_project.is_none()
    }

    pub fn network_name(&self) -> &str {
        &self.network
    }

    /// Network URL for the instance-insert request, or `None` when the
    /// network must be inferred from the subnetwork.
    pub fn instance_network_url(&self) -> Option<String> {
        self.network_project
            .as_deref()
            .map(|project| format!("{COMPUTE_URL_PREFIX}{project}/global/networks/{}", self.network))
    }

    pub fn instance_subnetwork_url(&self) -> String {
        format!(
            "{COMPUTE_URL_PREFIX}{}/regions/{}/subnetworks/{}",
            self.subnetwork_project, self.region, self.subnetwork
        )
    }

    /// Projects whose firewalls must admit WinRM ingress before any
    /// instance is created: the instance project, plus the owning network
    /// or subnetwork project when that is a different project.
    pub fn required_firewall_projects(&self, instance_project: &str) -> Vec<String> {
        let mut projects = vec![instance_project.to_string()];
        let other = match &self.network_project {
            Some(p) => p.as_str(),
            None => self.subnetwork_project.as_str(),
        };
        if other != instance_project {
            projects.push(other.to_string());
        }
        projects
    }

    /// Whether a firewall rule's network reference points at this
    /// network. With an explicit network project the full URL must match;
    /// under Shared-VPC inference only the network name can be matched.
    pub fn matches_firewall_network(&self, rule_network_url: &str) -> bool {
        match self.instance_network_url() {
            Some(url) => rule_network_url == url,
            None => rule_network_url.ends_with(&format!("/global/networks/{}", self.network)),
        }
    }

    /// Whether an instance's attached network/subnetwork references point
    /// at this configuration. Compared by resource path: the API returns
    /// either `googleapis.com` host form depending on the call.
    pub fn matches_interface(
        &self,
        network_url: Option<&str>,
        subnetwork_url: Option<&str>,
    ) -> bool {
        let subnet_path = format!(
            "/projects/{}/regions/{}/subnetworks/{}",
            self.subnetwork_project, self.region, self.subnetwork
        );
        if !subnetwork_url.is_some_and(|u| u.ends_with(&subnet_path)) {
            return false;
        }
        match &self.network_project {
            Some(project) => {
                let net_path = format!("/projects/{project}/global/networks/{}", self.network);
                network_url.is_some_and(|u| u.ends_with(&net_path))
            }
            // Inferred network: the subnetwork match is the whole story.
            None => true,
        }
    }

    /// Network reference for human-facing remediation messages.
    pub fn display_network(&self) -> String {
        self.instance_network_url()
            .unwrap_or_else(|| self.network.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_project_everything_is_explicit() {
        let net = NetworkConfig::resolve("proj", "default", "", "default", "", "us-central1");
        assert!(!net.is_shared_vpc());
        assert_eq!(
            net.instance_network_url().as_deref(),
            Some("https://www.googleapis.com/compute/v1/projects/proj/global/networks/default")
        );
        assert_eq!(
            net.instance_subnetwork_url(),
            "https://www.googleapis.com/compute/v1/projects/proj/regions/us-central1/subnetworks/default"
        );
        assert_eq!(net.required_firewall_projects("proj"), vec!["proj"]);
    }

    #[test]
    fn foreign_subnetwork_without_network_project_infers_shared_vpc() {
        let net = NetworkConfig::resolve("proj", "shared-net", "", "shared-subnet", "host-proj", "us-central1");
        assert!(net.is_shared_vpc());
        // The network must be inferred, not stated.
        assert_eq!(net.instance_network_url(), None);
        assert_eq!(
            net.instance_subnetwork_url(),
            "https://www.googleapis.com/compute/v1/projects/host-proj/regions/us-central1/subnetworks/shared-subnet"
        );
        assert_eq!(net.required_firewall_projects("proj"), vec!["proj", "host-proj"]);
    }

    #[test]
    fn explicit_network_project_equal_to_instance_project_stays_explicit() {
        let net = NetworkConfig::resolve("proj", "default", "proj", "default", "", "us-central1");
        assert!(!net.is_shared_vpc());
        assert!(net.instance_network_url().is_some());
        assert_eq!(net.required_firewall_projects("proj"), vec!["proj"]);
    }

    #[test]
    fn explicit_foreign_network_project_is_stated_not_inferred() {
        let net = NetworkConfig::resolve("proj", "net", "host-proj", "subnet", "", "us-central1");
        assert!(!net.is_shared_vpc());
        assert_eq!(
            net.instance_network_url().as_deref(),
            Some("https://www.googleapis.com/compute/v1/projects/host-proj/global/networks/net")
        );
        // Subnetwork project falls back to the network project.
        assert_eq!(
            net.instance_subnetwork_url(),
            "https://www.googleapis.com/compute/v1/projects/host-proj/regions/us-central1/subnetworks/subnet"
        );
        assert_eq!(net.required_firewall_projects("proj"), vec!["proj", "host-proj"]);
    }

    #[test]
    fn interface_matching_compares_resource_paths_across_hosts() {
        let net = NetworkConfig::resolve("proj", "default", "", "default", "", "us-central1");
        // The instances API returns the compute.googleapis.com host form.
        assert!(net.matches_interface(
            Some("https://compute.googleapis.com/compute/v1/projects/proj/global/networks/default"),
            Some("https://compute.googleapis.com/compute/v1/projects/proj/regions/us-central1/subnetworks/default"),
        ));
        assert!(!net.matches_interface(
            Some("https://compute.googleapis.com/compute/v1/projects/proj/global/networks/default"),
            Some("https://compute.googleapis.com/compute/v1/projects/proj/regions/us-central1/subnetworks/other"),
        ));
        assert!(!net.matches_interface(None, None));

        // Inferred network: only the subnetwork has to line up.
        let shared = NetworkConfig::resolve("proj", "shared-net", "", "sub", "host-proj", "us-central1");
        assert!(shared.matches_interface(
            None,
            Some("https://compute.googleapis.com/compute/v1/projects/host-proj/regions/us-central1/subnetworks/sub"),
        ));
    }

    #[test]
    fn firewall_network_matching_follows_inference() {
        let explicit = NetworkConfig::resolve("proj", "default", "", "default", "", "us-central1");
        assert!(explicit.matches_firewall_network(
            "https://www.googleapis.com/compute/v1/projects/proj/global/networks/default"
        ));
        assert!(!explicit.matches_firewall_network(
            "https://www.googleapis.com/compute/v1/projects/other/global/networks/default"
        ));

        let inferred = NetworkConfig::resolve("proj", "shared-net", "", "sub", "host-proj", "us-central1");
        assert!(inferred.matches_firewall_network(
            "https://www.googleapis.com/compute/v1/projects/host-proj/global/networks/shared-net"
        ));
        assert!(!inferred.matches_firewall_network(
            "https://www.googleapis.com/compute/v1/projects/host-proj/global/networks/other-net"
        ));
    }
}
