//! ARP sweep over the configured subnets of a cluster.
//!
//! The sweep runs on the cluster gateway: a short ping fan-out populates the
//! neighbor table, then `ip neigh show` is harvested and matched against the
//! wanted MAC set. Input and output are keyed `cluster:vmid`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Error;

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::normalize_mac;

use crate::shell::{self, quote_arg};

/// Ping fan-out budget per subnet.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Map `cluster:vmid` keys to IPv4 addresses for all MACs found in the
/// neighbor table after sweeping the configured subnets.
pub async fn sweep(
    cluster: &ClusterConfig,
    mac_map: &HashMap<String, String>,
) -> Result<HashMap<String, String>, Error> {
    if mac_map.is_empty() || cluster.arp_subnets.is_empty() {
        return Ok(HashMap::new());
    }

    let gateway = shell::acquire(cluster, &cluster.host).await?;

    for subnet in &cluster.arp_subnets {
        // fping touches every address quickly; ignore its exit code, the
        // point is only to freshen the neighbor table
        let cmd = format!("fping -q -c1 -t200 -g {} 2>/dev/null || true", quote_arg(subnet));
        if let Err(err) = gateway.execute(&cmd, SWEEP_TIMEOUT, false).await {
            log::debug!("ping sweep of {subnet} failed: {err}");
        }
    }

    let output = gateway
        .execute("ip neigh show", shell::DEFAULT_COMMAND_TIMEOUT, false)
        .await?;

    let neighbor_map = parse_neighbor_table(&output.stdout);

    let mut discovered = HashMap::new();
    for (key, mac) in mac_map {
        if let Some(ip) = neighbor_map.get(mac.as_str()) {
            discovered.insert(key.clone(), ip.clone());
        }
    }

    log::info!(
        "ARP sweep on '{}' resolved {}/{} MACs",
        cluster.id,
        discovered.len(),
        mac_map.len()
    );

    Ok(discovered)
}

/// Parse `ip neigh show` output into a normalized-MAC -> IPv4 map.
///
/// Lines look like `10.220.15.33 dev vmbr0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`;
/// entries without `lladdr` (FAILED/INCOMPLETE) are skipped.
fn parse_neighbor_table(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let ip = match fields.first() {
            // IPv6 neighbors are not usable for the lab RDP/SSH surface
            Some(ip) if ip.contains('.') => *ip,
            _ => continue,
        };

        let lladdr = fields
            .iter()
            .position(|field| *field == "lladdr")
            .and_then(|pos| fields.get(pos + 1));

        if let Some(mac) = lladdr.and_then(|mac| normalize_mac(mac)) {
            // first sighting wins; duplicate MACs on several subnets are rare
            map.entry(mac).or_insert_with(|| ip.to_string());
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_neighbor_table() {
        let output = "\
10.220.15.33 dev vmbr0 lladdr aa:bb:cc:dd:ee:ff REACHABLE
10.220.15.77 dev vmbr0 lladdr 02:00:0c:29:ab:cd STALE
10.220.15.99 dev vmbr0  FAILED
fe80::1 dev vmbr0 lladdr aa:bb:cc:dd:ee:01 router REACHABLE
";
        let map = parse_neighbor_table(output);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("aabbccddeeff").unwrap(), "10.220.15.33");
        assert_eq!(map.get("02000c29abcd").unwrap(), "10.220.15.77");
        // FAILED entry has no lladdr, IPv6 entry is skipped
        assert!(!map.values().any(|ip| ip.contains(':')));
    }
}
