//! MAC to IP discovery.
//!
//! Three tiers, in priority order: the database cache (TTL bound), a
//! guest-side query (QEMU guest agent or the LXC interfaces endpoint), and
//! finally an ARP sweep over the cluster's configured subnets. Discovered
//! addresses are written through to the owning entity; placeholders never
//! replace a known address.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::pve::{AgentInterfacesResult, LxcInterface};
use plm_api_types::{normalize_mac, GuestKind};

use crate::cache::{registry, ArpCacheEntry};
use crate::connection;
use crate::db::Database;

pub mod arp;

/// How long a database-cached IP stays authoritative.
pub const DB_IP_CACHE_TTL: i64 = 3600;

/// Bounded worker pool for parallel guest queries.
pub const IP_LOOKUP_WORKERS: usize = 4; // within the allowed 2..8 range

/// Port probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// One guest the resolver should find an address for.
#[derive(Clone, Debug)]
pub struct IpTarget {
    pub vmid: u32,
    pub kind: GuestKind,
    pub node: String,
    pub running: bool,
    pub mac: Option<String>,
    pub cached_ip: Option<String>,
    pub ip_updated_at: Option<i64>,
    pub category: Option<String>,
}

/// Whether an ARP sweep blocks the caller or runs detached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SweepMode {
    /// Used by the sync daemon so results are persisted in-iteration.
    Sync,
    /// Used by interactive paths: cached results now, refresh detached.
    Background,
}

/// Clusters with a sweep in flight; a flurry of requests coalesces into one.
static SWEEPS_IN_FLIGHT: LazyLock<StdMutex<HashSet<String>>> =
    LazyLock::new(|| StdMutex::new(HashSet::new()));

/// Pick the guest's primary IPv4 from agent-reported interfaces.
///
/// First non-loopback IPv4 on an `eth*`/`ens*` interface wins.
pub fn agent_primary_ip(interfaces: &AgentInterfacesResult) -> Option<String> {
    for iface in &interfaces.result {
        if !(iface.name.starts_with("eth") || iface.name.starts_with("ens")) {
            continue;
        }
        for addr in &iface.ip_addresses {
            if addr.ip_address_type == "ipv4" && !addr.ip_address.starts_with("127.") {
                return Some(addr.ip_address.clone());
            }
        }
    }
    None
}

/// Pick a container's primary IPv4, preferring `eth0`/`veth0`.
pub fn lxc_primary_ip(interfaces: &[LxcInterface]) -> Option<String> {
    let extract = |iface: &LxcInterface| -> Option<String> {
        let inet = iface.inet.as_deref()?;
        let ip = inet.split('/').next().unwrap_or(inet);
        if ip.is_empty() || ip.starts_with("127.") {
            None
        } else {
            Some(ip.to_string())
        }
    };

    for iface in interfaces {
        if matches!(iface.name.as_str(), "eth0" | "veth0") {
            if let Some(ip) = extract(iface) {
                return Some(ip);
            }
        }
    }
    interfaces.iter().find_map(extract)
}

/// Guest-side address query (tier 2).
async fn lookup_guest_ip(
    cluster: &ClusterConfig,
    target: &IpTarget,
) -> Result<Option<String>, Error> {
    // each worker uses its own short-lived client
    let client = connection::make_pve_client_uncached(cluster).await?;

    let ip = match target.kind {
        GuestKind::Qemu => {
            // the agent only answers while the guest runs
            if !target.running {
                return Ok(None);
            }
            let interfaces = client
                .agent_network_interfaces(&target.node, target.vmid)
                .await?;
            agent_primary_ip(&interfaces)
        }
        GuestKind::Lxc => {
            let interfaces = client.lxc_interfaces(&target.node, target.vmid).await?;
            lxc_primary_ip(&interfaces)
        }
    };

    Ok(ip)
}

/// Probe a TCP port, used for the RDP/SSH availability signals.
pub async fn probe_port(ip: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::net::TcpStream::connect((ip, port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Persist a discovered address to the owning entity.
fn write_through(db: &Database, cluster_id: &str, vmid: u32, ip: &str, mac: Option<&str>) {
    let result = match db.get_assignment_by_vmid(vmid) {
        Ok(Some(_)) => db.update_assignment_ip(vmid, ip, mac),
        _ => Ok(()),
    };
    if let Err(err) = result {
        log::warn!("failed to persist IP for VM {vmid}: {err}");
    }
    if let Err(err) = db.update_vm_ip(cluster_id, vmid, ip) {
        log::warn!("failed to persist inventory IP for VM {vmid}: {err}");
    }
}

/// Resolve addresses for a batch of guests of one cluster.
///
/// Returns the vmid -> IP map of everything known after the cache and
/// guest-query tiers plus, in [`SweepMode::Sync`], the ARP tier.
pub async fn resolve_cluster_ips(
    db: &Database,
    cluster: &ClusterConfig,
    targets: &[IpTarget],
    mode: SweepMode,
) -> HashMap<u32, String> {
    let now = proxmox_time::epoch_i64();
    let mut resolved: HashMap<u32, String> = HashMap::new();
    let mut pending: Vec<IpTarget> = Vec::new();

    // tier 1: database cache
    for target in targets {
        let fresh = match (&target.cached_ip, target.ip_updated_at) {
            (Some(ip), Some(updated_at)) if !plm_api_types::is_ip_placeholder(ip) => {
                now - updated_at < DB_IP_CACHE_TTL
            }
            _ => false,
        };
        if fresh {
            resolved.insert(target.vmid, target.cached_ip.clone().unwrap());
        } else {
            pending.push(target.clone());
        }
    }

    // tier 2: guest-side queries, bounded fan-out
    if cluster.enable_ip_lookup && !pending.is_empty() {
        let semaphore = Arc::new(Semaphore::new(IP_LOOKUP_WORKERS));
        let mut handles = JoinSet::new();

        for target in pending.iter().cloned() {
            let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();
            let cluster = cluster.clone();
            handles.spawn(async move {
                let _permit = permit;
                let result = lookup_guest_ip(&cluster, &target).await;
                (target.vmid, result)
            });
        }

        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((vmid, Ok(Some(ip)))) => {
                    resolved.insert(vmid, ip);
                }
                Ok((vmid, Ok(None))) => {
                    log::debug!("guest query found no address for VM {vmid}");
                }
                Ok((vmid, Err(err))) => {
                    // stopped guests and missing agents are routine
                    log::debug!("guest IP query failed for VM {vmid}: {err}");
                }
                Err(err) => log::error!("join error in IP lookup: {err}"),
            }
        }

        for target in &pending {
            if let Some(ip) = resolved.get(&target.vmid) {
                write_through(db, &cluster.id, target.vmid, ip, target.mac.as_deref());
            }
        }
    }

    // tier 3: ARP sweep for running guests that still lack an address
    let mut mac_map: HashMap<String, String> = HashMap::new();
    for target in &pending {
        if resolved.contains_key(&target.vmid) || !target.running {
            continue;
        }
        let mac = match target.mac.as_deref().and_then(normalize_mac) {
            Some(mac) => mac,
            None => continue,
        };

        if let Some(entry) = registry().arp_lookup(&mac) {
            resolved.insert(target.vmid, entry.ip.clone());
            write_through(db, &cluster.id, target.vmid, &entry.ip, Some(&mac));
            continue;
        }

        mac_map.insert(format!("{}:{}", cluster.id, target.vmid), mac);
    }

    if !mac_map.is_empty() {
        match mode {
            SweepMode::Sync => {
                let discovered = run_sweep(db, cluster, mac_map).await;
                resolved.extend(discovered);
            }
            SweepMode::Background => {
                let db = db.clone();
                let cluster = cluster.clone();
                tokio::spawn(async move {
                    run_sweep(&db, &cluster, mac_map).await;
                });
            }
        }
    }

    update_rdp_availability(db, cluster, targets, &resolved).await;

    resolved
}

/// Run one coalesced ARP sweep and persist its results.
async fn run_sweep(
    db: &Database,
    cluster: &ClusterConfig,
    mac_map: HashMap<String, String>,
) -> HashMap<u32, String> {
    {
        let mut in_flight = SWEEPS_IN_FLIGHT.lock().unwrap();
        if !in_flight.insert(cluster.id.clone()) {
            log::debug!("ARP sweep already running for '{}', coalescing", cluster.id);
            return HashMap::new();
        }
    }

    let result = arp::sweep(cluster, &mac_map).await;

    SWEEPS_IN_FLIGHT.lock().unwrap().remove(&cluster.id);

    let discovered = match result {
        Ok(discovered) => discovered,
        Err(err) => {
            log::warn!("ARP sweep on '{}' failed: {err}", cluster.id);
            return HashMap::new();
        }
    };

    let mut resolved = HashMap::new();
    for (key, ip) in discovered {
        let vmid: u32 = match key.rsplit(':').next().and_then(|v| v.parse().ok()) {
            Some(vmid) => vmid,
            None => continue,
        };
        let mac = mac_map.get(&key).cloned();

        write_through(db, &cluster.id, vmid, &ip, mac.as_deref());
        if let Some(mac) = mac {
            registry().arp_store(
                mac,
                ArpCacheEntry {
                    ip: ip.clone(),
                    ..Default::default()
                },
            );
        }
        resolved.insert(vmid, ip);
    }
    resolved
}

/// Derive RDP availability: running, has an address, and either a Windows
/// guest or an open port 3389. Probe results are cached with the sweep
/// cycle via the MAC entry.
async fn update_rdp_availability(
    db: &Database,
    cluster: &ClusterConfig,
    targets: &[IpTarget],
    resolved: &HashMap<u32, String>,
) {
    for target in targets {
        if !target.running {
            continue;
        }
        let ip = match resolved
            .get(&target.vmid)
            .cloned()
            .or_else(|| target.cached_ip.clone())
        {
            Some(ip) if !plm_api_types::is_ip_placeholder(&ip) => ip,
            _ => continue,
        };

        let rdp_available = if target.category.as_deref() == Some("windows") {
            true
        } else if let Some(cached) = target
            .mac
            .as_deref()
            .and_then(normalize_mac)
            .and_then(|mac| registry().arp_lookup(&mac))
            .filter(|entry| entry.rdp_open)
        {
            cached.rdp_open
        } else {
            let open = probe_port(&ip, 3389).await;
            if let Some(mac) = target.mac.as_deref().and_then(normalize_mac) {
                registry().arp_store(
                    mac,
                    ArpCacheEntry {
                        ip: ip.clone(),
                        rdp_open: open,
                        ssh_open: false,
                    },
                );
            }
            open
        };

        if let Err(err) = db.set_vm_rdp_available(&cluster.id, target.vmid, rdp_available) {
            log::warn!("failed to store RDP flag for VM {}: {err}", target.vmid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plm_api_types::pve::{AgentInterface, AgentIpAddress};

    fn agent_result(entries: Vec<(&str, Vec<(&str, &str)>)>) -> AgentInterfacesResult {
        AgentInterfacesResult {
            result: entries
                .into_iter()
                .map(|(name, addrs)| AgentInterface {
                    name: name.to_string(),
                    hardware_address: None,
                    ip_addresses: addrs
                        .into_iter()
                        .map(|(ty, ip)| AgentIpAddress {
                            ip_address_type: ty.to_string(),
                            ip_address: ip.to_string(),
                            prefix: None,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_agent_primary_ip() {
        let interfaces = agent_result(vec![
            ("lo", vec![("ipv4", "127.0.0.1")]),
            ("eth0", vec![("ipv6", "fe80::1"), ("ipv4", "10.0.0.7")]),
        ]);
        assert_eq!(agent_primary_ip(&interfaces).as_deref(), Some("10.0.0.7"));

        // ens-style names count, docker-style ones do not
        let interfaces = agent_result(vec![
            ("docker0", vec![("ipv4", "172.17.0.1")]),
            ("ens18", vec![("ipv4", "10.0.0.9")]),
        ]);
        assert_eq!(agent_primary_ip(&interfaces).as_deref(), Some("10.0.0.9"));

        let interfaces = agent_result(vec![("lo", vec![("ipv4", "127.0.0.1")])]);
        assert_eq!(agent_primary_ip(&interfaces), None);
    }

    #[test]
    fn test_lxc_primary_ip() {
        let interfaces = vec![
            LxcInterface {
                name: "lo".to_string(),
                hwaddr: None,
                inet: Some("127.0.0.1/8".to_string()),
                inet6: None,
            },
            LxcInterface {
                name: "eth0".to_string(),
                hwaddr: Some("aa:bb:cc:dd:ee:ff".to_string()),
                inet: Some("10.0.0.12/24".to_string()),
                inet6: None,
            },
        ];
        assert_eq!(lxc_primary_ip(&interfaces).as_deref(), Some("10.0.0.12"));

        // fallback to any non-loopback interface
        let interfaces = vec![LxcInterface {
            name: "net1".to_string(),
            hwaddr: None,
            inet: Some("192.168.1.5/24".to_string()),
            inet6: None,
        }];
        assert_eq!(lxc_primary_ip(&interfaces).as_deref(), Some("192.168.1.5"));

        assert_eq!(lxc_primary_ip(&[]), None);
    }
}
