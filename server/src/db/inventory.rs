//! Synchronized VM inventory access.
//!
//! Only the sync engine writes here (plus the eager status update after
//! power operations); everything the API surface lists comes out of this
//! table.

use std::collections::HashSet;

use anyhow::Error;
use rusqlite::{params, OptionalExtension, Row};

use plm_api_types::{is_ip_placeholder, GuestKind, VmInventoryEntry};

use super::Database;

fn row_to_entry(row: &Row) -> Result<VmInventoryEntry, rusqlite::Error> {
    let kind: String = row.get("type")?;
    Ok(VmInventoryEntry {
        cluster_id: row.get("cluster_id")?,
        vmid: row.get("vmid")?,
        name: row.get("name")?,
        node: row.get("node")?,
        status: row.get("status")?,
        kind: kind.parse().unwrap_or(GuestKind::Qemu),
        category: row.get("category")?,
        ip: row.get("ip")?,
        mac_address: row.get("mac_address")?,
        memory: row.get("memory")?,
        cores: row.get("cores")?,
        disk_size: row.get("disk_size")?,
        uptime: row.get("uptime")?,
        cpu_usage: row.get("cpu_usage")?,
        memory_usage: row.get("memory_usage")?,
        is_template: row.get("is_template")?,
        tags: row.get("tags")?,
        rdp_available: row.get("rdp_available")?,
        ssh_available: row.get("ssh_available")?,
        last_updated: row.get("last_updated")?,
        last_status_check: row.get("last_status_check")?,
        sync_error: row.get("sync_error")?,
    })
}

impl Database {
    /// Merge a batch of freshly synced entries.
    ///
    /// Existing rows are updated in place; a known IP is kept when the new
    /// entry carries only a placeholder. Idempotent apart from
    /// `last_updated`.
    pub fn upsert_vms(&self, entries: &[VmInventoryEntry]) -> Result<usize, Error> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let now = proxmox_time::epoch_i64();

        for entry in entries {
            let new_ip = match &entry.ip {
                Some(ip) if !is_ip_placeholder(ip) => Some(ip.as_str()),
                _ => None,
            };

            tx.execute(
                "INSERT INTO vm_inventory
                    (cluster_id, vmid, name, node, status, type, category, ip, mac_address,
                     memory, cores, disk_size, uptime, cpu_usage, memory_usage, is_template,
                     tags, rdp_available, ssh_available, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT (cluster_id, vmid) DO UPDATE SET
                    name = excluded.name,
                    node = excluded.node,
                    status = excluded.status,
                    type = excluded.type,
                    category = excluded.category,
                    ip = COALESCE(excluded.ip, vm_inventory.ip),
                    mac_address = COALESCE(excluded.mac_address, vm_inventory.mac_address),
                    memory = excluded.memory,
                    cores = excluded.cores,
                    disk_size = excluded.disk_size,
                    uptime = excluded.uptime,
                    cpu_usage = excluded.cpu_usage,
                    memory_usage = excluded.memory_usage,
                    is_template = excluded.is_template,
                    tags = excluded.tags,
                    last_updated = excluded.last_updated,
                    sync_error = NULL",
                params![
                    entry.cluster_id,
                    entry.vmid,
                    entry.name,
                    entry.node,
                    entry.status,
                    entry.kind.to_string(),
                    entry.category,
                    new_ip,
                    entry.mac_address,
                    entry.memory,
                    entry.cores,
                    entry.disk_size,
                    entry.uptime,
                    entry.cpu_usage,
                    entry.memory_usage,
                    entry.is_template,
                    entry.tags,
                    entry.rdp_available,
                    entry.ssh_available,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        Ok(entries.len())
    }

    /// Drop rows of a cluster that a completed full sync did not see.
    pub fn delete_stale_vms(
        &self,
        cluster_id: &str,
        seen_vmids: &HashSet<u32>,
    ) -> Result<usize, Error> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let stale: Vec<u32> = {
            let mut stmt = tx.prepare("SELECT vmid FROM vm_inventory WHERE cluster_id = ?1")?;
            let all = stmt
                .query_map([cluster_id], |row| row.get(0))?
                .collect::<Result<Vec<u32>, _>>()?;
            all.into_iter().filter(|vmid| !seen_vmids.contains(vmid)).collect()
        };

        for vmid in &stale {
            tx.execute(
                "DELETE FROM vm_inventory WHERE cluster_id = ?1 AND vmid = ?2",
                params![cluster_id, vmid],
            )?;
        }

        tx.commit()?;
        Ok(stale.len())
    }

    pub fn get_vm(&self, cluster_id: &str, vmid: u32) -> Result<Option<VmInventoryEntry>, Error> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM vm_inventory WHERE cluster_id = ?1 AND vmid = ?2",
                params![cluster_id, vmid],
                row_to_entry,
            )
            .optional()?)
    }

    /// Find an inventory row by VMID alone, first match wins.
    ///
    /// Only safe where VMID ranges are unique across clusters; callers that
    /// know the cluster should use [`Database::get_vm`].
    pub fn find_vm_any_cluster(&self, vmid: u32) -> Result<Option<VmInventoryEntry>, Error> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM vm_inventory WHERE vmid = ?1 ORDER BY cluster_id LIMIT 1",
                [vmid],
                row_to_entry,
            )
            .optional()?)
    }

    /// List inventory rows with optional cluster, search and VMID filters.
    pub fn list_vms(
        &self,
        cluster_id: Option<&str>,
        search: Option<&str>,
        vmid_set: Option<&HashSet<u32>>,
    ) -> Result<Vec<VmInventoryEntry>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM vm_inventory
             WHERE (?1 IS NULL OR cluster_id = ?1)
             ORDER BY cluster_id, vmid",
        )?;
        let rows = stmt
            .query_map(params![cluster_id], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        let needle = search.map(str::to_lowercase);
        Ok(rows
            .into_iter()
            .filter(|entry| match &needle {
                Some(needle) => {
                    entry.name.to_lowercase().contains(needle)
                        || entry.vmid.to_string().contains(needle.as_str())
                        || entry.node.to_lowercase().contains(needle)
                        || entry
                            .ip
                            .as_deref()
                            .map(|ip| ip.contains(needle.as_str()))
                            .unwrap_or(false)
                }
                None => true,
            })
            .filter(|entry| match vmid_set {
                Some(set) => set.contains(&entry.vmid),
                None => true,
            })
            .collect())
    }

    /// Eagerly set the status after a power operation so the next read does
    /// not have to wait for the sync loop.
    pub fn set_vm_status(&self, cluster_id: &str, vmid: u32, status: &str) -> Result<(), Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "UPDATE vm_inventory SET status = ?1, last_status_check = ?2
             WHERE cluster_id = ?3 AND vmid = ?4",
            params![status, now, cluster_id, vmid],
        )?;
        Ok(())
    }

    /// Write a discovered IP, refusing to replace a real address with a
    /// placeholder.
    pub fn update_vm_ip(&self, cluster_id: &str, vmid: u32, ip: &str) -> Result<(), Error> {
        if is_ip_placeholder(ip) {
            return Ok(());
        }
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_inventory SET ip = ?1 WHERE cluster_id = ?2 AND vmid = ?3",
            params![ip, cluster_id, vmid],
        )?;
        Ok(())
    }

    pub fn set_vm_rdp_available(
        &self,
        cluster_id: &str,
        vmid: u32,
        rdp_available: bool,
    ) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_inventory SET rdp_available = ?1 WHERE cluster_id = ?2 AND vmid = ?3",
            params![rdp_available, cluster_id, vmid],
        )?;
        Ok(())
    }

    pub fn set_vm_sync_error(
        &self,
        cluster_id: &str,
        vmid: u32,
        error: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_inventory SET sync_error = ?1 WHERE cluster_id = ?2 AND vmid = ?3",
            params![error, cluster_id, vmid],
        )?;
        Ok(())
    }

    /// Up to `limit` recently running guests, refreshed by the quick sync.
    pub fn list_recently_running(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<VmInventoryEntry>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM vm_inventory
             WHERE status = 'running' OR last_status_check > ?1
             ORDER BY last_updated DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cluster: &str, vmid: u32, name: &str, node: &str, status: &str) -> VmInventoryEntry {
        VmInventoryEntry {
            cluster_id: cluster.to_string(),
            vmid,
            name: name.to_string(),
            node: node.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();

        let batch = vec![entry("lab", 100, "web", "node1", "running")];
        db.upsert_vms(&batch).unwrap();
        db.upsert_vms(&batch).unwrap();

        let rows = db.list_vms(Some("lab"), None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "web");
    }

    #[test]
    fn test_known_ip_survives_placeholder_refresh() {
        let db = Database::open_in_memory().unwrap();

        let mut vm = entry("lab", 800, "filesrv", "node1", "running");
        vm.ip = Some("10.0.0.5".to_string());
        db.upsert_vms(&[vm.clone()]).unwrap();

        // quick refresh without IP information
        vm.ip = None;
        db.upsert_vms(&[vm.clone()]).unwrap();
        vm.ip = Some("N/A".to_string());
        db.upsert_vms(&[vm]).unwrap();

        let row = db.get_vm("lab", 800).unwrap().unwrap();
        assert_eq!(row.ip.as_deref(), Some("10.0.0.5"));

        // a real new address does replace it
        db.update_vm_ip("lab", 800, "10.0.0.42").unwrap();
        let row = db.get_vm("lab", 800).unwrap().unwrap();
        assert_eq!(row.ip.as_deref(), Some("10.0.0.42"));
    }

    #[test]
    fn test_full_sync_visibility_and_stale_removal() {
        let db = Database::open_in_memory().unwrap();
        let sync_start = proxmox_time::epoch_i64() - 1;

        db.upsert_vms(&[
            entry("lab", 100, "a", "node1", "running"),
            entry("lab", 101, "b", "node1", "stopped"),
            entry("other", 100, "c", "nodeX", "running"),
        ])
        .unwrap();

        for row in db.list_vms(None, None, None).unwrap() {
            assert!(row.last_updated > sync_start);
        }

        // second sync no longer sees vm 101 on cluster 'lab'
        let seen: HashSet<u32> = [100].into_iter().collect();
        assert_eq!(db.delete_stale_vms("lab", &seen).unwrap(), 1);

        assert!(db.get_vm("lab", 101).unwrap().is_none());
        // same vmid on another cluster is untouched
        assert!(db.get_vm("other", 100).unwrap().is_some());
    }

    #[test]
    fn test_search_filter() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_vms(&[
            entry("lab", 100, "web-frontend", "node1", "running"),
            entry("lab", 200, "database", "node2", "running"),
        ])
        .unwrap();

        let hits = db.list_vms(None, Some("web"), None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vmid, 100);

        let hits = db.list_vms(None, Some("node2"), None).unwrap();
        assert_eq!(hits.len(), 1);

        let set: HashSet<u32> = [200].into_iter().collect();
        let hits = db.list_vms(None, None, Some(&set)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vmid, 200);
    }
}
