//! VM inventory synchronization.

use std::collections::{HashMap, HashSet};

use anyhow::Error;

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::pve::ClusterResource;
use plm_api_types::{GuestKind, VmInventoryEntry};

use crate::connection;
use crate::db::Database;
use crate::error::is_expected_offline_error;
use crate::ip::{self, IpTarget, SweepMode};

/// Guests the quick sync refreshes at most per iteration.
const QUICK_SYNC_LIMIT: usize = 50;

/// Derive the OS category from ostype, name and guest kind.
///
/// No extra API calls; works on the data the listing already carries.
pub fn guess_category(kind: GuestKind, ostype: Option<&str>, name: &str) -> &'static str {
    if kind == GuestKind::Lxc {
        return "linux";
    }
    let ostype = ostype.unwrap_or("").to_lowercase();
    if ostype.contains("win") || name.to_lowercase().contains("win") {
        return "windows";
    }
    "linux"
}

fn entry_from_resource(cluster: &ClusterConfig, resource: &ClusterResource) -> Option<VmInventoryEntry> {
    let vmid = resource.vmid?;
    let node = resource.node.clone()?;
    let kind: GuestKind = resource.ty.parse().ok()?;
    let name = resource
        .name
        .clone()
        .unwrap_or_else(|| format!("vm-{vmid}"));

    let memory_usage = match (resource.mem, resource.maxmem) {
        (Some(mem), Some(maxmem)) if maxmem > 0 => Some(mem as f64 / maxmem as f64),
        _ => None,
    };

    Some(VmInventoryEntry {
        cluster_id: cluster.id.clone(),
        vmid,
        name: name.clone(),
        node,
        status: resource.status.clone().unwrap_or_else(|| "unknown".to_string()),
        kind,
        category: Some(guess_category(kind, None, &name).to_string()),
        ip: None,
        mac_address: None,
        memory: resource.maxmem,
        cores: resource.maxcpu,
        disk_size: resource.maxdisk,
        uptime: resource.uptime,
        cpu_usage: resource.cpu,
        memory_usage,
        is_template: resource.template,
        tags: resource.tags.clone(),
        rdp_available: false,
        ssh_available: false,
        last_updated: 0,
        last_status_check: None,
        sync_error: None,
    })
}

/// Enumerate all guests of a cluster.
///
/// Prefers the cluster-resources endpoint; falls back to per-node
/// enumeration when that is unavailable.
pub async fn enumerate_cluster_vms(
    cluster: &ClusterConfig,
) -> Result<Vec<VmInventoryEntry>, Error> {
    let client = connection::make_pve_client(cluster).await?;

    match client.cluster_resources(Some("vm")).await {
        Ok(resources) => {
            crate::cache::registry().cluster_resources_store(cluster.id.clone(), resources.clone());
            Ok(resources
                .iter()
                .filter(|r| r.ty == "qemu" || r.ty == "lxc")
                .filter_map(|r| entry_from_resource(cluster, r))
                .collect())
        }
        Err(err) => {
            log::warn!(
                "cluster-resources query failed on '{}', falling back to per-node enumeration: {err}",
                cluster.id
            );
            let mut entries = Vec::new();
            for node in client.list_nodes().await? {
                for (kind, guests) in [
                    (GuestKind::Qemu, client.list_qemu(&node.node).await),
                    (GuestKind::Lxc, client.list_lxc(&node.node).await),
                ] {
                    let guests = match guests {
                        Ok(guests) => guests,
                        Err(err) => {
                            let msg = err.to_string();
                            if is_expected_offline_error(&msg) {
                                log::debug!("node {} unreachable: {msg}", node.node);
                            } else {
                                log::error!("guest listing on {} failed: {msg}", node.node);
                            }
                            continue;
                        }
                    };
                    for guest in guests {
                        let name = guest
                            .name
                            .clone()
                            .unwrap_or_else(|| format!("vm-{}", guest.vmid));
                        entries.push(VmInventoryEntry {
                            cluster_id: cluster.id.clone(),
                            vmid: guest.vmid,
                            name: name.clone(),
                            node: node.node.clone(),
                            status: guest.status.clone(),
                            kind,
                            category: Some(guess_category(kind, None, &name).to_string()),
                            memory: guest.maxmem,
                            disk_size: guest.maxdisk,
                            uptime: guest.uptime,
                            is_template: guest.template,
                            tags: guest.tags.clone(),
                            ..Default::default()
                        });
                    }
                }
            }
            Ok(entries)
        }
    }
}

/// Fill in MAC addresses for entries that do not have one stored yet.
async fn fill_missing_macs(
    db: &Database,
    cluster: &ClusterConfig,
    entries: &mut [VmInventoryEntry],
) {
    let client = match connection::make_pve_client(cluster).await {
        Ok(client) => client,
        Err(err) => {
            log::warn!("cannot fetch MACs on '{}': {err}", cluster.id);
            return;
        }
    };

    for entry in entries.iter_mut() {
        if entry.mac_address.is_some() || entry.is_template {
            continue;
        }

        let known = db
            .get_vm(&cluster.id, entry.vmid)
            .ok()
            .flatten()
            .and_then(|row| row.mac_address);
        if known.is_some() {
            entry.mac_address = known;
            continue;
        }

        match client.guest_config(&entry.node, entry.kind, entry.vmid).await {
            Ok(config) => {
                entry.mac_address = config.primary_mac();
                if let Some(ostype) = config.get_str("ostype") {
                    entry.category =
                        Some(guess_category(entry.kind, Some(ostype), &entry.name).to_string());
                }
            }
            Err(err) => {
                log::debug!("config fetch for VM {} failed: {err}", entry.vmid);
            }
        }
    }
}

/// Full sync: enumerate every guest of every active cluster, upsert the
/// inventory, resolve IPs synchronously and track cross-node migrations.
pub async fn full_sync(db: &Database) -> Result<usize, Error> {
    let mut total = 0;

    for cluster in super::active_clusters()? {
        let mut entries = match enumerate_cluster_vms(&cluster).await {
            Ok(entries) => entries,
            Err(err) => {
                let msg = format!("{err:#}");
                if is_expected_offline_error(&msg) {
                    log::debug!("cluster '{}' unreachable: {msg}", cluster.id);
                    continue;
                }
                return Err(err);
            }
        };

        fill_missing_macs(db, &cluster, &mut entries).await;

        let seen: HashSet<u32> = entries.iter().map(|entry| entry.vmid).collect();
        let entries_for_db = entries.clone();
        let cluster_id = cluster.id.clone();
        let count = db
            .run(move |db| {
                let count = db.upsert_vms(&entries_for_db)?;
                db.delete_stale_vms(&cluster_id, &seen)?;
                Ok(count)
            })
            .await?;
        total += count;

        // detect cross-node migrations of managed VMs
        for entry in &entries {
            match db.update_assignment_node(entry.vmid, &entry.node) {
                Ok(true) => {
                    log::info!("VM {} migrated to node {}", entry.vmid, entry.node)
                }
                Ok(false) => {}
                Err(err) => log::warn!("node update for VM {} failed: {err}", entry.vmid),
            }
        }

        // IP discovery runs synchronously here so results are persisted
        // within this iteration
        let targets = build_ip_targets(db, &cluster, &entries);
        ip::resolve_cluster_ips(db, &cluster, &targets, SweepMode::Sync).await;
    }

    Ok(total)
}

/// Build resolver targets from freshly synced entries, merging in the
/// cached addresses the database already holds.
pub fn build_ip_targets(
    db: &Database,
    cluster: &ClusterConfig,
    entries: &[VmInventoryEntry],
) -> Vec<IpTarget> {
    let cached: HashMap<u32, (Option<String>, Option<i64>)> = db
        .list_assignments()
        .unwrap_or_default()
        .into_iter()
        .map(|a| (a.proxmox_vmid, (a.cached_ip, a.ip_updated_at)))
        .collect();

    entries
        .iter()
        .filter(|entry| !entry.is_template)
        .map(|entry| {
            let (cached_ip, ip_updated_at) = cached
                .get(&entry.vmid)
                .cloned()
                .unwrap_or_else(|| (entry.ip.clone(), None));
            IpTarget {
                vmid: entry.vmid,
                kind: entry.kind,
                node: entry.node.clone(),
                running: entry.status == "running",
                mac: entry.mac_address.clone(),
                cached_ip,
                ip_updated_at,
                category: entry.category.clone(),
            }
        })
        .collect()
}

/// Quick sync: refresh only the status of recently running guests.
pub async fn quick_sync(db: &Database) -> Result<usize, Error> {
    let cutoff = proxmox_time::epoch_i64() - 3600;
    let recent = {
        let db = db.clone();
        db.run(move |db| db.list_recently_running(cutoff, QUICK_SYNC_LIMIT))
            .await?
    };
    if recent.is_empty() {
        return Ok(0);
    }

    let clusters: HashMap<String, ClusterConfig> = super::active_clusters()?
        .into_iter()
        .map(|cluster| (cluster.id.clone(), cluster))
        .collect();

    let mut updated = 0;
    for vm in recent {
        let cluster = match clusters.get(&vm.cluster_id) {
            Some(cluster) => cluster,
            None => continue,
        };
        let client = match connection::make_pve_client(cluster).await {
            Ok(client) => client,
            Err(err) => {
                log::debug!("quick sync cannot reach '{}': {err}", cluster.id);
                continue;
            }
        };

        match client.guest_status(&vm.node, vm.kind, vm.vmid).await {
            Ok(status) => {
                if status.status != vm.status {
                    db.set_vm_status(&vm.cluster_id, vm.vmid, &status.status)?;
                    updated += 1;
                }
            }
            Err(err) => {
                // per-VM failures do not abort the quick sync
                log::debug!("quick sync failed for VM {}: {err}", vm.vmid);
            }
        }
    }

    if updated > 0 {
        log::info!("quick sync: {updated} VMs updated");
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex, OnceLock};

    use plm_config::clusters::ClusterConfigAccess;

    use crate::db::Database;
    use crate::test_support::{
        fake_cluster_config, fake_cluster::FakeGuest, FakeClientFactory, FakeClusterState,
    };

    struct FixedClusterConfig(Vec<ClusterConfig>);

    impl ClusterConfigAccess for FixedClusterConfig {
        fn config(&self) -> Result<Vec<ClusterConfig>, Error> {
            Ok(self.0.clone())
        }
        fn save_cluster(&self, _cluster: &ClusterConfig) -> Result<(), Error> {
            Ok(())
        }
        fn remove_cluster(&self, _id: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    // The config and connection singletons can only be initialized once per
    // test binary, so every test sharing them goes through here.
    static SHARED_STATE: OnceLock<Arc<Mutex<FakeClusterState>>> = OnceLock::new();

    // tests mutate the shared fake state, so they must not interleave
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_init() -> Arc<Mutex<FakeClusterState>> {
        SHARED_STATE
            .get_or_init(|| {
                let state = FakeClusterState::new(&["node-a", "node-b"]);
                plm_config::clusters::init(Box::new(FixedClusterConfig(vec![
                    fake_cluster_config("lab"),
                ])));
                crate::connection::init(Box::new(FakeClientFactory {
                    state: Arc::clone(&state),
                }));
                state
            })
            .clone()
    }

    #[tokio::test]
    async fn test_full_sync_populates_inventory_and_tracks_migration() {
        let _serialize = TEST_LOCK.lock().unwrap();
        let state = test_init();
        let db = Database::open_in_memory().unwrap();

        {
            let mut state = state.lock().unwrap();
            state.guests.clear();
            state.guests.push(FakeGuest {
                vmid: 700,
                name: "lab-student-1-700".to_string(),
                node: "node-a".to_string(),
                status: "running".to_string(),
                kind: GuestKind::Qemu,
                template: false,
            });
            state.guests.push(FakeGuest {
                vmid: 9000,
                name: "debian-template".to_string(),
                node: "node-a".to_string(),
                status: "stopped".to_string(),
                kind: GuestKind::Qemu,
                template: true,
            });
        }

        // a managed VM recorded on node-a
        let teacher = db.create_user("t", "h", plm_api_types::UserRole::Teacher).unwrap();
        let class_id = db.insert_class("lab", teacher).unwrap();
        db.insert_assignment_row(Some(class_id), 700, "lab-student-1-700", "node-a", false, false)
            .unwrap();

        let sync_start = proxmox_time::epoch_i64() - 1;
        let count = full_sync(&db).await.unwrap();
        assert_eq!(count, 2);

        // every guest appears exactly once with a fresh last_updated
        let rows = db.list_vms(Some("lab"), None, None).unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert!(row.last_updated > sync_start);
        }
        assert!(rows.iter().any(|row| row.is_template && row.vmid == 9000));

        // the admin migrates the VM; the next full sync follows it
        state
            .lock()
            .unwrap()
            .guests
            .iter_mut()
            .find(|g| g.vmid == 700)
            .unwrap()
            .node = "node-b".to_string();

        full_sync(&db).await.unwrap();

        let row = db.get_vm("lab", 700).unwrap().unwrap();
        assert_eq!(row.node, "node-b");
        let assignment = db.get_assignment_by_vmid(700).unwrap().unwrap();
        assert_eq!(assignment.node, "node-b");

        // a guest that disappears is dropped by the following sync
        state.lock().unwrap().guests.retain(|g| g.vmid != 9000);
        full_sync(&db).await.unwrap();
        assert!(db.get_vm("lab", 9000).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quick_sync_updates_status_only() {
        let _serialize = TEST_LOCK.lock().unwrap();
        let state = test_init();
        let db = Database::open_in_memory().unwrap();

        {
            let mut state = state.lock().unwrap();
            state.guests.clear();
            state.guests.push(FakeGuest {
                vmid: 800,
                name: "filesrv".to_string(),
                node: "node-a".to_string(),
                status: "running".to_string(),
                kind: GuestKind::Qemu,
                template: false,
            });
        }

        full_sync(&db).await.unwrap();
        assert_eq!(db.get_vm("lab", 800).unwrap().unwrap().status, "running");

        // guest powers off between syncs
        state
            .lock()
            .unwrap()
            .guests
            .iter_mut()
            .find(|g| g.vmid == 800)
            .unwrap()
            .status = "stopped".to_string();

        let updated = quick_sync(&db).await.unwrap();
        assert_eq!(updated, 1);
        assert_eq!(db.get_vm("lab", 800).unwrap().unwrap().status, "stopped");
    }

    #[test]
    fn test_guess_category() {
        assert_eq!(guess_category(GuestKind::Lxc, None, "anything"), "linux");
        assert_eq!(guess_category(GuestKind::Qemu, Some("win11"), "desktop"), "windows");
        assert_eq!(guess_category(GuestKind::Qemu, None, "Win2k22-dc"), "windows");
        assert_eq!(guess_category(GuestKind::Qemu, Some("l26"), "debian"), "linux");
    }

    #[test]
    fn test_entry_from_resource_skips_incomplete() {
        let cluster = crate::test_support::fake_cluster_config("lab");

        let complete = ClusterResource {
            id: "qemu/100".into(),
            ty: "qemu".into(),
            vmid: Some(100),
            node: Some("node1".into()),
            status: Some("running".into()),
            maxmem: Some(2048),
            mem: Some(1024),
            ..Default::default()
        };
        let entry = entry_from_resource(&cluster, &complete).unwrap();
        assert_eq!(entry.vmid, 100);
        assert_eq!(entry.memory_usage, Some(0.5));

        let no_node = ClusterResource {
            id: "qemu/101".into(),
            ty: "qemu".into(),
            vmid: Some(101),
            ..Default::default()
        };
        assert!(entry_from_resource(&cluster, &no_node).is_none());
    }
}
