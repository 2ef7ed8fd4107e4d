//! Identity proposals for new cluster nodes.
//!
//! Everything here is pure: the same node list always yields the same
//! proposal, and nothing checks the result for collisions. Callers validate
//! before committing and re-sort by vmId after inserting.

use crate::models::cluster::{ClusterNode, NodeType};

/// Offset used when a role has no node yet and the proposal is derived from a
/// node of the other role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStep(pub u32);

impl Default for BlockStep {
    fn default() -> Self {
        BlockStep(5)
    }
}

/// Propose the next node of `role` for the given topology.
pub fn propose_node(
    nodes: &[ClusterNode],
    role: NodeType,
    default_master: &ClusterNode,
    step: BlockStep,
) -> ClusterNode {
    let mut by_id_desc: Vec<&ClusterNode> = nodes.iter().collect();
    by_id_desc.sort_by(|a, b| b.vm_id.cmp(&a.vm_id));

    if let Some(latest) = by_id_desc.iter().find(|n| n.node_type == role) {
        return next_node(latest, 1);
    }

    // No node of this role: anchor on the lowest vmId of any role.
    let Some(anchor) = by_id_desc.last() else {
        return default_master.clone();
    };

    let offset = match role {
        NodeType::Worker => i64::from(step.0).max(nodes.len() as i64),
        NodeType::Master => -i64::from(step.0),
    };
    let mut proposal = next_node(anchor, offset);
    proposal.name = format!("{}-1", role);
    proposal.node_type = role;
    proposal
}

fn next_node(node: &ClusterNode, offset: i64) -> ClusterNode {
    ClusterNode {
        vm_id: shift_vm_id(node.vm_id, offset),
        name: shift_name(&node.name, offset),
        cores: node.cores,
        memory: node.memory,
        ip_address: shift_last_octet(&node.ip_address, offset),
        storage_pool: node.storage_pool.clone(),
        node_type: node.node_type,
        lock: None,
    }
}

fn shift_vm_id(vm_id: u32, offset: i64) -> u32 {
    u32::try_from(i64::from(vm_id) + offset).unwrap_or(0)
}

/// `master-3` + 1 => `master-4`. A name whose suffix is not a number is
/// returned unchanged and will collide on validation.
fn shift_name(name: &str, offset: i64) -> String {
    let (prefix, number) = match name.rfind('-') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => ("", name),
    };
    match number.parse::<i64>() {
        Ok(n) => format!("{}-{}", prefix, n + offset),
        Err(_) => name.to_string(),
    }
}

/// Only the last octet moves and there is no carry: `10.0.0.255` + 1 gives
/// `10.0.0.256`. Blank addresses stay blank.
fn shift_last_octet(ip: &str, offset: i64) -> String {
    let (head, last) = match ip.rfind('.') {
        Some(idx) => (&ip[..=idx], &ip[idx + 1..]),
        None => ("", ip),
    };
    match last.parse::<i64>() {
        Ok(octet) => format!("{}{}", head, octet + offset),
        Err(_) => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(vm_id: u32, name: &str, ip: &str, node_type: NodeType) -> ClusterNode {
        ClusterNode {
            vm_id,
            name: name.to_string(),
            cores: 4,
            memory: 4096,
            ip_address: ip.to_string(),
            storage_pool: "local-lvm".to_string(),
            node_type,
            lock: None,
        }
    }

    fn template() -> ClusterNode {
        ClusterNode {
            vm_id: 999,
            name: "master-1".to_string(),
            cores: 2,
            memory: 2048,
            ip_address: String::new(),
            storage_pool: String::new(),
            node_type: NodeType::Master,
            lock: None,
        }
    }

    #[test]
    fn empty_topology_returns_the_template_for_any_role() {
        for role in [NodeType::Master, NodeType::Worker] {
            let proposal = propose_node(&[], role, &template(), BlockStep::default());
            assert_eq!(proposal, template());
        }
    }

    #[test]
    fn next_master_follows_the_highest_master() {
        let nodes = vec![node(100, "master-1", "192.168.1.10", NodeType::Master)];
        let proposal = propose_node(&nodes, NodeType::Master, &template(), BlockStep::default());

        assert_eq!(proposal.vm_id, 101);
        assert_eq!(proposal.name, "master-2");
        assert_eq!(proposal.ip_address, "192.168.1.11");
        assert_eq!(proposal.cores, 4);
        assert_eq!(proposal.memory, 4096);
        assert_eq!(proposal.storage_pool, "local-lvm");
        assert_eq!(proposal.node_type, NodeType::Master);
    }

    #[test]
    fn same_role_uses_max_vm_id_regardless_of_order() {
        let nodes = vec![
            node(107, "worker-3", "10.0.0.27", NodeType::Worker),
            node(100, "master-1", "10.0.0.10", NodeType::Master),
            node(105, "worker-1", "10.0.0.25", NodeType::Worker),
            node(106, "worker-2", "10.0.0.26", NodeType::Worker),
        ];
        let proposal = propose_node(&nodes, NodeType::Worker, &template(), BlockStep::default());
        assert_eq!(proposal.vm_id, 108);
        assert_eq!(proposal.name, "worker-4");
        assert_eq!(proposal.ip_address, "10.0.0.28");
    }

    #[test]
    fn first_worker_is_offset_from_the_lowest_master_by_the_block_step() {
        let nodes = vec![
            node(101, "master-2", "10.0.0.11", NodeType::Master),
            node(100, "master-1", "10.0.0.10", NodeType::Master),
        ];
        let proposal = propose_node(&nodes, NodeType::Worker, &template(), BlockStep(5));

        assert_eq!(proposal.vm_id, 105);
        assert_eq!(proposal.name, "worker-1");
        assert_eq!(proposal.ip_address, "10.0.0.15");
        assert_eq!(proposal.node_type, NodeType::Worker);
    }

    #[test]
    fn first_worker_step_grows_with_a_dense_topology() {
        let nodes: Vec<ClusterNode> = (0..7)
            .map(|i| {
                node(
                    100 + i,
                    &format!("master-{}", i + 1),
                    &format!("10.0.0.{}", 10 + i),
                    NodeType::Master,
                )
            })
            .collect();
        let proposal = propose_node(&nodes, NodeType::Worker, &template(), BlockStep(5));
        assert_eq!(proposal.vm_id, 107);
        assert!(nodes.iter().all(|n| n.vm_id != proposal.vm_id));
    }

    #[test]
    fn first_master_is_a_block_below_every_worker() {
        let nodes = vec![
            node(200, "worker-1", "10.0.0.50", NodeType::Worker),
            node(201, "worker-2", "10.0.0.51", NodeType::Worker),
            node(202, "worker-3", "10.0.0.52", NodeType::Worker),
        ];
        let step = BlockStep(10);
        let proposal = propose_node(&nodes, NodeType::Master, &template(), step);

        assert_eq!(proposal.vm_id, 190);
        assert_eq!(proposal.name, "master-1");
        assert_eq!(proposal.ip_address, "10.0.0.40");
        for n in &nodes {
            assert!(n.vm_id - proposal.vm_id >= step.0);
        }
    }

    #[test]
    fn proposal_is_idempotent_without_commit() {
        let nodes = vec![
            node(100, "master-1", "10.0.0.10", NodeType::Master),
            node(105, "worker-1", "10.0.0.15", NodeType::Worker),
        ];
        let first = propose_node(&nodes, NodeType::Worker, &template(), BlockStep::default());
        let second = propose_node(&nodes, NodeType::Worker, &template(), BlockStep::default());
        assert_eq!(first, second);
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn last_octet_does_not_carry() {
        let nodes = vec![node(100, "master-1", "192.168.1.255", NodeType::Master)];
        let proposal = propose_node(&nodes, NodeType::Master, &template(), BlockStep::default());
        assert_eq!(proposal.ip_address, "192.168.1.256");
    }

    #[test]
    fn name_prefix_keeps_inner_hyphens() {
        let nodes = vec![node(300, "edge-master-9", "10.1.1.9", NodeType::Master)];
        let proposal = propose_node(&nodes, NodeType::Master, &template(), BlockStep::default());
        assert_eq!(proposal.name, "edge-master-10");
    }

    #[test]
    fn blank_ip_stays_blank() {
        let nodes = vec![template()];
        let proposal = propose_node(&nodes, NodeType::Master, &template(), BlockStep::default());
        assert_eq!(proposal.vm_id, 1000);
        assert_eq!(proposal.name, "master-2");
        assert_eq!(proposal.ip_address, "");
    }

    #[test]
    fn lock_marker_is_not_inherited() {
        let mut locked = node(100, "master-1", "10.0.0.10", NodeType::Master);
        locked.lock = Some(crate::models::cluster::NodeLock::Create);
        let proposal = propose_node(&[locked], NodeType::Master, &template(), BlockStep::default());
        assert_eq!(proposal.lock, None);
    }
}
