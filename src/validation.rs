//! Field checks run before anything is sent to the backend.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::ValidationErrors;
use crate::models::cluster::{ClusterNode, ClusterRequest, ClusterResource, HelmApp, NodeType};

const HOSTNAME_MAX: usize = 128;
const MIN_VM_ID: u32 = 100;
const IP_MIN_LEN: usize = 7;

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Letters and digits at both ends, hyphens allowed inside.
pub fn is_hostname(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            name.len() <= HOSTNAME_MAX
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}

pub fn is_ipv4(addr: &str) -> bool {
    addr.parse::<Ipv4Addr>().is_ok()
}

pub fn validate_settings(draft: &ClusterRequest) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    for (field, value) in [
        ("node", &draft.node),
        ("osImage", &draft.os_image),
        ("osImageStorage", &draft.os_image_storage),
        ("kubeVersion", &draft.kube_version),
    ] {
        if blank(value) {
            errors.push(field, "required");
        }
    }
    errors
}

pub fn validate_cluster(draft: &ClusterRequest) -> ValidationErrors {
    let mut errors = ValidationErrors::default();

    if blank(&draft.cluster_name) {
        errors.push("clusterName", "required");
    } else if !is_hostname(&draft.cluster_name) {
        errors.push("clusterName", "must be a valid hostname");
    }
    if blank(&draft.node_username) {
        errors.push("nodeUsername", "required");
    }
    if blank(&draft.node_password) {
        errors.push("nodePassword", "required");
    }
    if draft.disk_size == 0 {
        errors.push("diskSize", "must be greater than 0");
    }

    let net = &draft.network;
    if !is_ipv4(&net.gateway) {
        errors.push("network.gateway", "must be a valid IPv4 address");
    }
    if !(1..=32).contains(&net.subnet_mask) {
        errors.push("network.subnetMask", "must be between 1 and 32");
    }
    if !is_ipv4(&net.dns) {
        errors.push("network.dns", "must be a valid IPv4 address");
    }
    if blank(&net.bridge) {
        errors.push("network.bridge", "required");
    }
    errors
}

/// Check one node against the rest of the topology. `others` must not
/// contain the node itself.
pub fn validate_node(node: &ClusterNode, others: &[ClusterNode]) -> ValidationErrors {
    let mut errors = ValidationErrors::default();

    if blank(&node.name) {
        errors.push("name", "required");
    } else if !is_hostname(&node.name) {
        errors.push("name", "must be a valid hostname");
    } else if others.iter().any(|n| n.name == node.name) {
        errors.push("name", "already used by another node");
    }

    if node.vm_id < MIN_VM_ID {
        errors.push("vmId", format!("must be at least {}", MIN_VM_ID));
    } else if others.iter().any(|n| n.vm_id == node.vm_id) {
        errors.push("vmId", "already used by another node");
    }

    if node.cores < 1 {
        errors.push("cores", "must be at least 1");
    }
    if node.memory == 0 {
        errors.push("memory", "must be greater than 0");
    }
    if node.ip_address.trim().len() < IP_MIN_LEN {
        errors.push("ipAddress", format!("must be at least {} characters", IP_MIN_LEN));
    }
    if blank(&node.storage_pool) {
        errors.push("storagePool", "required");
    }
    errors
}

pub fn validate_nodes(nodes: &[ClusterNode]) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    if !nodes.iter().any(|n| n.node_type == NodeType::Master) {
        errors.push("nodes", "at least one master node is required");
    }
    for (idx, node) in nodes.iter().enumerate() {
        let others: Vec<ClusterNode> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, n)| n.clone())
            .collect();
        for e in validate_node(node, &others).0 {
            errors.push(format!("nodes[{}].{}", idx, e.field), e.message);
        }
    }
    errors
}

pub fn validate_helm_app(app: &HelmApp, others: &[HelmApp]) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    if blank(&app.release_name) {
        errors.push("releaseName", "required");
    } else if others.iter().any(|a| a.release_name == app.release_name) {
        errors.push("releaseName", "already used by another app");
    }
    if blank(&app.chart_name) {
        errors.push("chartName", "required");
    }
    if blank(&app.repository) {
        errors.push("repository", "required");
    }
    if blank(&app.namespace) {
        errors.push("namespace", "required");
    }
    errors
}

pub fn validate_helm_apps(apps: &[HelmApp]) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    let mut seen = HashSet::new();
    for (idx, app) in apps.iter().enumerate() {
        for e in validate_helm_app(app, &[]).0 {
            errors.push(format!("helmApps[{}].{}", idx, e.field), e.message);
        }
        if !blank(&app.release_name) && !seen.insert(app.release_name.as_str()) {
            errors.push(
                format!("helmApps[{}].releaseName", idx),
                "already used by another app",
            );
        }
    }
    errors
}

pub fn validate_resource(resource: &ClusterResource, others: &[ClusterResource]) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    if blank(&resource.name) {
        errors.push("name", "required");
    } else if others.iter().any(|r| r.name == resource.name) {
        errors.push("name", "already used by another resource");
    }
    if blank(&resource.content) {
        errors.push("content", "required");
    }
    errors
}

pub fn validate_resources(resources: &[ClusterResource]) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    let mut seen = HashSet::new();
    for (idx, resource) in resources.iter().enumerate() {
        for e in validate_resource(resource, &[]).0 {
            errors.push(format!("clusterResources[{}].{}", idx, e.field), e.message);
        }
        if !blank(&resource.name) && !seen.insert(resource.name.as_str()) {
            errors.push(
                format!("clusterResources[{}].name", idx),
                "already used by another resource",
            );
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::Network;

    fn node(vm_id: u32, name: &str, node_type: NodeType) -> ClusterNode {
        ClusterNode {
            vm_id,
            name: name.to_string(),
            cores: 2,
            memory: 2048,
            ip_address: "10.0.0.10".to_string(),
            storage_pool: "local-lvm".to_string(),
            node_type,
            lock: None,
        }
    }

    fn draft() -> ClusterRequest {
        ClusterRequest {
            os_image: "ubuntu-22.04".into(),
            os_image_storage: "local".into(),
            kube_version: "1.29".into(),
            node: "pve".into(),
            cluster_name: "demo".into(),
            node_username: "ops".into(),
            node_password: "secret".into(),
            disk_size: 32,
            network: Network {
                gateway: "10.0.0.1".into(),
                subnet_mask: 24,
                dns: "1.1.1.1".into(),
                bridge: "vmbr0".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn hostname_rules() {
        assert!(is_hostname("worker-1"));
        assert!(is_hostname("a"));
        assert!(!is_hostname("-worker"));
        assert!(!is_hostname("worker-"));
        assert!(!is_hostname("worker_1"));
        assert!(!is_hostname(""));
        assert!(!is_hostname(&"a".repeat(129)));
    }

    #[test]
    fn complete_draft_passes_settings_and_cluster() {
        assert!(validate_settings(&draft()).is_empty());
        assert!(validate_cluster(&draft()).is_empty());
    }

    #[test]
    fn blank_settings_are_reported_per_field() {
        let mut d = draft();
        d.os_image.clear();
        d.kube_version = "  ".into();
        let errors = validate_settings(&d);
        assert!(errors.has("osImage"));
        assert!(errors.has("kubeVersion"));
        assert!(!errors.has("node"));
    }

    #[test]
    fn bad_network_is_rejected() {
        let mut d = draft();
        d.network.gateway = "10.0.0".into();
        d.network.subnet_mask = 33;
        d.disk_size = 0;
        let errors = validate_cluster(&d);
        assert!(errors.has("network.gateway"));
        assert!(errors.has("network.subnetMask"));
        assert!(errors.has("diskSize"));
        assert!(!errors.has("network.dns"));
    }

    #[test]
    fn node_collisions_are_reported() {
        let existing = vec![node(100, "master-1", NodeType::Master)];
        let errors = validate_node(&node(100, "master-1", NodeType::Master), &existing);
        assert!(errors.has("name"));
        assert!(errors.has("vmId"));
    }

    #[test]
    fn node_field_bounds() {
        let mut n = node(99, "master-1", NodeType::Master);
        n.cores = 0;
        n.memory = 0;
        n.ip_address = "10.0.1".into();
        n.storage_pool.clear();
        let errors = validate_node(&n, &[]);
        for field in ["vmId", "cores", "memory", "ipAddress", "storagePool"] {
            assert!(errors.has(field), "{} not reported", field);
        }
    }

    #[test]
    fn nodes_step_requires_a_master() {
        let errors = validate_nodes(&[node(105, "worker-1", NodeType::Worker)]);
        assert!(errors.has("nodes"));

        let ok = validate_nodes(&[
            node(100, "master-1", NodeType::Master),
            node(105, "worker-1", NodeType::Worker),
        ]);
        assert!(ok.is_empty());
    }

    #[test]
    fn duplicate_release_names_are_rejected() {
        let app = HelmApp {
            chart_name: "ingress-nginx".into(),
            repository: "https://kubernetes.github.io/ingress-nginx".into(),
            release_name: "ingress".into(),
            namespace: "ingress".into(),
            ..Default::default()
        };
        assert!(validate_helm_apps(&[app.clone()]).is_empty());
        let errors = validate_helm_apps(&[app.clone(), app]);
        assert!(errors.has("helmApps[1].releaseName"));
    }

    #[test]
    fn resource_needs_name_and_content() {
        let errors = validate_resource(&ClusterResource::default(), &[]);
        assert!(errors.has("name"));
        assert!(errors.has("content"));
    }
}
