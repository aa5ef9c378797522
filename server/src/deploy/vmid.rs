//! VMID allocation.

use std::collections::HashSet;

use anyhow::Error;

use plm_api_types::clusters::ClusterConfig;

use crate::connection;

/// Collect every VMID in use on a cluster.
///
/// Prefers one cluster-resources call (short-lived cache in front); falls
/// back to per-node QEMU and LXC listings when the clustered endpoint is
/// unavailable.
pub async fn used_vmids(cluster: &ClusterConfig) -> Result<HashSet<u32>, Error> {
    if let Some(resources) = crate::cache::registry().cluster_resources_lookup(&cluster.id) {
        return Ok(resources.into_iter().filter_map(|r| r.vmid).collect());
    }

    let client = connection::make_pve_client(cluster).await?;

    match client.cluster_resources(Some("vm")).await {
        Ok(resources) => Ok(resources.into_iter().filter_map(|r| r.vmid).collect()),
        Err(err) => {
            log::debug!(
                "cluster-resources failed on '{}', using per-node enumeration: {err}",
                cluster.id
            );
            let mut used = HashSet::new();
            for node in client.list_nodes().await? {
                if let Ok(guests) = client.list_qemu(&node.node).await {
                    used.extend(guests.into_iter().map(|g| g.vmid));
                }
                if let Ok(guests) = client.list_lxc(&node.node).await {
                    used.extend(guests.into_iter().map(|g| g.vmid));
                }
            }
            Ok(used)
        }
    }
}

/// Lowest free VMID at or above `start`.
pub fn next_free(used: &HashSet<u32>, start: u32) -> u32 {
    let mut candidate = start.max(100);
    while used.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free() {
        let used: HashSet<u32> = [100, 101, 103].into_iter().collect();
        assert_eq!(next_free(&used, 100), 102);
        assert_eq!(next_free(&used, 103), 104);
        assert_eq!(next_free(&used, 500), 500);
        // never allocates below 100
        assert_eq!(next_free(&HashSet::new(), 1), 100);
    }
}
