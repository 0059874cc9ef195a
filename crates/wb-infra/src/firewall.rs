//! Firewall preflight for the WinRM management port.
//!
//! Creating an instance no rule can reach fails much later, as an
//! uninformative readiness timeout; checking up front turns that into an
//! immediate error naming the exact remediation command.

use gce_api::{ComputeClient, Firewall};
use tracing::{info, warn};

use crate::network::NetworkConfig;
use crate::{Error, Result};

const WINRM_PORT: &str = "5986";

/// Verify that every project behind the resolved network configuration
/// has an enabled ingress-allow rule for tcp:5986 from any source,
/// scoped to the resolved network.
pub async fn check_project_firewalls(
    compute: &ComputeClient,
    net: &NetworkConfig,
    instance_project: &str,
) -> Result<()> {
    for project in net.required_firewall_projects(instance_project) {
        info!(
            project = %project,
            network = %net.display_network(),
            "checking WinRM firewall rule is present"
        );
        if !winrm_ingress_allowed(compute, &project, net).await {
            let remediation = format!(
                "gcloud compute firewall-rules create --project={project} allow-winrm-ingress --allow=tcp:{WINRM_PORT} --direction=INGRESS --network={}",
                net.display_network()
            );
            return Err(Error::FirewallMissing { project, remediation });
        }
    }
    Ok(())
}

async fn winrm_ingress_allowed(
    compute: &ComputeClient,
    project: &str,
    net: &NetworkConfig,
) -> bool {
    let list = match compute.list_firewalls(project).await {
        Ok(list) => list,
        Err(e) => {
            warn!(project, error = %e, "firewall list failed");
            return false;
        }
    };

    let allowed = list.items.iter().any(|rule| rule_allows_winrm(rule, net));
    if allowed {
        info!(project, "found an INGRESS firewall rule for tcp:{WINRM_PORT}");
    }
    allowed
}

fn rule_allows_winrm(rule: &Firewall, net: &NetworkConfig) -> bool {
    net.matches_firewall_network(&rule.network)
        && rule.direction == "INGRESS"
        && !rule.disabled
        && rule.source_ranges.first().map(String::as_str) == Some("0.0.0.0/0")
        && rule
            .allowed
            .iter()
            .any(|a| a.ip_protocol == "tcp" && a.ports.iter().any(|p| p == WINRM_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> NetworkConfig {
        NetworkConfig::resolve("proj", "default", "", "default", "", "us-central1")
    }

    fn rule(json: serde_json::Value) -> Firewall {
        serde_json::from_value(json).unwrap()
    }

    fn allowing_rule() -> serde_json::Value {
        serde_json::json!({
            "name": "allow-winrm-ingress",
            "network": "https://www.googleapis.com/compute/v1/projects/proj/global/networks/default",
            "direction": "INGRESS",
            "disabled": false,
            "sourceRanges": ["0.0.0.0/0"],
            "allowed": [{"IPProtocol": "tcp", "ports": ["5986"]}]
        })
    }

    #[test]
    fn accepts_matching_ingress_rule() {
        assert!(rule_allows_winrm(&rule(allowing_rule()), &net()));
    }

    #[test]
    fn rejects_disabled_wrong_port_wrong_direction_or_foreign_network() {
        let mut disabled = allowing_rule();
        disabled["disabled"] = serde_json::json!(true);
        assert!(!rule_allows_winrm(&rule(disabled), &net()));

        let mut wrong_port = allowing_rule();
        wrong_port["allowed"] = serde_json::json!([{"IPProtocol": "tcp", "ports": ["3389"]}]);
        assert!(!rule_allows_winrm(&rule(wrong_port), &net()));

        let mut egress = allowing_rule();
        egress["direction"] = serde_json::json!("EGRESS");
        assert!(!rule_allows_winrm(&rule(egress), &net()));

        let mut foreign = allowing_rule();
        foreign["network"] =
            serde_json::json!("https://www.googleapis.com/compute/v1/projects/other/global/networks/default");
        assert!(!rule_allows_winrm(&rule(foreign), &net()));

        let mut scoped_source = allowing_rule();
        scoped_source["sourceRanges"] = serde_json::json!(["10.0.0.0/8"]);
        assert!(!rule_allows_winrm(&rule(scoped_source), &net()));
    }

    #[test]
    fn shared_vpc_matches_rule_by_network_name() {
        let shared = NetworkConfig::resolve("proj", "shared-net", "", "sub", "host-proj", "us-central1");
        let mut host_rule = allowing_rule();
        host_rule["network"] = serde_json::json!(
            "https://www.googleapis.com/compute/v1/projects/host-proj/global/networks/shared-net"
        );
        assert!(rule_allows_winrm(&rule(host_rule), &shared));
    }
}
