//! Template table access.

use std::collections::HashSet;

use anyhow::Error;
use rusqlite::{params, OptionalExtension, Row};

use plm_api_types::{CachedSpecs, TemplateEntry};

use super::Database;
use crate::error::LabError;

fn row_to_template(row: &Row) -> Result<TemplateEntry, rusqlite::Error> {
    Ok(TemplateEntry {
        id: row.get("id")?,
        name: row.get("name")?,
        proxmox_vmid: row.get("proxmox_vmid")?,
        cluster_host: row.get("cluster_host")?,
        node: row.get("node")?,
        is_replica: row.get("is_replica")?,
        created_by: row.get("created_by")?,
        is_class_template: row.get("is_class_template")?,
        class_id: row.get("class_id")?,
        original_template_id: row.get("original_template_id")?,
        specs: CachedSpecs {
            cores: row.get("cores")?,
            sockets: row.get("sockets")?,
            memory_mb: row.get("memory_mb")?,
            os_type: row.get("os_type")?,
            disk_storage: row.get("disk_storage")?,
            disk_size_gb: row.get("disk_size_gb")?,
            network_bridge: row.get("network_bridge")?,
        },
        last_verified_at: row.get("last_verified_at")?,
    })
}

impl Database {
    /// Insert or refresh a template discovered by the sync engine.
    ///
    /// Identity is `(cluster_host, node, proxmox_vmid)`. Specs are only
    /// rewritten when `specs` is `Some` (full syncs); the verify pass passes
    /// `None` and merely touches `last_verified_at`.
    pub fn upsert_template(
        &self,
        name: &str,
        vmid: u32,
        cluster_host: &str,
        node: &str,
        specs: Option<&CachedSpecs>,
    ) -> Result<i64, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM templates
                 WHERE cluster_host = ?1 AND node = ?2 AND proxmox_vmid = ?3",
                params![cluster_host, node, vmid],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE templates SET name = ?1, last_verified_at = ?2 WHERE id = ?3",
                    params![name, now, id],
                )?;
                if let Some(specs) = specs {
                    conn.execute(
                        "UPDATE templates SET cores = ?1, sockets = ?2, memory_mb = ?3,
                         os_type = ?4, disk_storage = ?5, disk_size_gb = ?6,
                         network_bridge = ?7 WHERE id = ?8",
                        params![
                            specs.cores,
                            specs.sockets,
                            specs.memory_mb,
                            specs.os_type,
                            specs.disk_storage,
                            specs.disk_size_gb,
                            specs.network_bridge,
                            id,
                        ],
                    )?;
                }
                Ok(id)
            }
            None => {
                let specs = specs.cloned().unwrap_or_default();
                conn.execute(
                    "INSERT INTO templates
                        (name, proxmox_vmid, cluster_host, node, cores, sockets, memory_mb,
                         os_type, disk_storage, disk_size_gb, network_bridge, last_verified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        name,
                        vmid,
                        cluster_host,
                        node,
                        specs.cores,
                        specs.sockets,
                        specs.memory_mb,
                        specs.os_type,
                        specs.disk_storage,
                        specs.disk_size_gb,
                        specs.network_bridge,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Record a template created for one specific class.
    pub fn insert_class_template(
        &self,
        name: &str,
        vmid: u32,
        cluster_host: &str,
        node: &str,
        class_id: i64,
        created_by: Option<i64>,
        original_template_id: Option<i64>,
    ) -> Result<i64, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "INSERT INTO templates
                (name, proxmox_vmid, cluster_host, node, is_class_template, class_id,
                 created_by, original_template_id, last_verified_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8)",
            params![name, vmid, cluster_host, node, class_id, created_by, original_template_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_template(&self, id: i64) -> Result<TemplateEntry, Error> {
        let conn = self.lock_conn();
        conn.query_row("SELECT * FROM templates WHERE id = ?1", [id], row_to_template)
            .optional()?
            .ok_or_else(|| LabError::NotFound(format!("no such template {id}")).into())
    }

    pub fn list_templates(&self) -> Result<Vec<TemplateEntry>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM templates ORDER BY name, proxmox_vmid")?;
        let rows = stmt
            .query_map([], row_to_template)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Refresh `last_verified_at` without touching specs (verify pass).
    pub fn touch_template_verified(
        &self,
        cluster_host: &str,
        node: &str,
        vmid: u32,
    ) -> Result<bool, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        let changed = conn.execute(
            "UPDATE templates SET last_verified_at = ?1
             WHERE cluster_host = ?2 AND node = ?3 AND proxmox_vmid = ?4",
            params![now, cluster_host, node, vmid],
        )?;
        Ok(changed > 0)
    }

    /// Drop non-class templates a full sync did not find anywhere.
    pub fn delete_stale_templates(
        &self,
        found: &HashSet<(String, String, u32)>,
    ) -> Result<usize, Error> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let stale: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id, cluster_host, node, proxmox_vmid FROM templates
                 WHERE is_class_template = 0",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, host, node, vmid)| {
                    !found.contains(&(host.clone(), node.clone(), *vmid))
                })
                .map(|(id, ..)| id)
                .collect()
        };

        for id in &stale {
            tx.execute("DELETE FROM templates WHERE id = ?1", [id])?;
        }

        tx.commit()?;
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_upsert_identity() {
        let db = Database::open_in_memory().unwrap();

        let specs = CachedSpecs {
            cores: Some(4),
            memory_mb: Some(4096),
            disk_storage: Some("tank".to_string()),
            ..Default::default()
        };

        let id = db
            .upsert_template("debian-12", 9000, "10.0.0.1", "node1", Some(&specs))
            .unwrap();
        // same triple updates in place
        let id2 = db
            .upsert_template("debian-12.1", 9000, "10.0.0.1", "node1", None)
            .unwrap();
        assert_eq!(id, id2);

        // specs survive a verify-style upsert without specs
        let row = db.get_template(id).unwrap();
        assert_eq!(row.name, "debian-12.1");
        assert_eq!(row.specs.cores, Some(4));

        // same vmid elsewhere is a separate template
        let id3 = db
            .upsert_template("debian-12", 9000, "10.0.0.1", "node2", None)
            .unwrap();
        assert_ne!(id, id3);
    }

    #[test]
    fn test_stale_cleanup_keeps_class_templates() {
        let db = Database::open_in_memory().unwrap();
        let teacher = db
            .create_user("t", "h", plm_api_types::UserRole::Teacher)
            .unwrap();
        let class_id = db.insert_class("c", teacher).unwrap();

        db.upsert_template("plain", 9000, "host", "node1", None).unwrap();
        db.insert_class_template("cls", 9100, "host", "node1", class_id, None, None)
            .unwrap();

        // nothing found in any cluster
        let removed = db.delete_stale_templates(&HashSet::new()).unwrap();
        assert_eq!(removed, 1);

        let remaining = db.list_templates().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_class_template);
    }
}
