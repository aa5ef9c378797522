//! ISO image table access, written only by the sync engine.

use std::collections::HashSet;

use anyhow::Error;
use rusqlite::{params, Row};

use plm_api_types::IsoImage;

use super::Database;

fn row_to_iso(row: &Row) -> Result<IsoImage, rusqlite::Error> {
    Ok(IsoImage {
        volid: row.get("volid")?,
        name: row.get("name")?,
        size: row.get("size")?,
        node: row.get("node")?,
        storage: row.get("storage")?,
        cluster_id: row.get("cluster_id")?,
        discovered_at: row.get("discovered_at")?,
        last_seen: row.get("last_seen")?,
    })
}

impl Database {
    pub fn upsert_iso(
        &self,
        volid: &str,
        name: &str,
        size: u64,
        node: &str,
        storage: &str,
        cluster_id: &str,
    ) -> Result<(), Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "INSERT INTO iso_images
                (volid, name, size, node, storage, cluster_id, discovered_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (volid) DO UPDATE SET
                name = excluded.name,
                size = excluded.size,
                node = excluded.node,
                storage = excluded.storage,
                cluster_id = excluded.cluster_id,
                last_seen = excluded.last_seen",
            params![volid, name, size, node, storage, cluster_id, now],
        )?;
        Ok(())
    }

    pub fn list_isos(&self) -> Result<Vec<IsoImage>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM iso_images ORDER BY name")?;
        let rows = stmt.query_map([], row_to_iso)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn touch_iso_seen(&self, volid: &str) -> Result<(), Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "UPDATE iso_images SET last_seen = ?1 WHERE volid = ?2",
            params![now, volid],
        )?;
        Ok(())
    }

    pub fn delete_iso(&self, volid: &str) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute("DELETE FROM iso_images WHERE volid = ?1", [volid])?;
        Ok(())
    }

    /// Drop entries a full sync did not find.
    pub fn delete_stale_isos(&self, found_volids: &HashSet<String>) -> Result<usize, Error> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare("SELECT volid FROM iso_images")?;
            let all = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            all.into_iter().filter(|volid| !found_volids.contains(volid)).collect()
        };

        for volid in &stale {
            tx.execute("DELETE FROM iso_images WHERE volid = ?1", [volid])?;
        }

        tx.commit()?;
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_dedup_by_volid() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_iso("local:iso/debian.iso", "debian.iso", 1000, "node1", "local", "lab")
            .unwrap();
        // rediscovered on another node, still one row
        db.upsert_iso("local:iso/debian.iso", "debian.iso", 1000, "node2", "local", "lab")
            .unwrap();

        let isos = db.list_isos().unwrap();
        assert_eq!(isos.len(), 1);
        assert_eq!(isos[0].node, "node2");

        let found: HashSet<String> = HashSet::new();
        assert_eq!(db.delete_stale_isos(&found).unwrap(), 1);
        assert!(db.list_isos().unwrap().is_empty());
    }
}
