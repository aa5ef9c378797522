//! VM assignment table access.
//!
//! The invariants over this table (unique VMID, pool membership, orphan and
//! builder classification) are documented in `plm_api_types::VmAssignment`.

use anyhow::Error;
use rusqlite::{params, OptionalExtension, Row};

use plm_api_types::{is_ip_placeholder, AssignmentStatus, VmAssignment};

use super::Database;
use crate::error::LabError;

fn row_to_assignment(row: &Row) -> Result<VmAssignment, rusqlite::Error> {
    let status: String = row.get("status")?;
    Ok(VmAssignment {
        id: row.get("id")?,
        class_id: row.get("class_id")?,
        proxmox_vmid: row.get("proxmox_vmid")?,
        vm_name: row.get("vm_name")?,
        mac_address: row.get("mac_address")?,
        cached_ip: row.get("cached_ip")?,
        ip_updated_at: row.get("ip_updated_at")?,
        node: row.get("node")?,
        assigned_user_id: row.get("assigned_user_id")?,
        status: status.parse().unwrap_or(AssignmentStatus::Available),
        is_template_vm: row.get("is_template_vm")?,
        manually_added: row.get("manually_added")?,
        hostname_configured: row.get("hostname_configured")?,
        target_hostname: row.get("target_hostname")?,
        usage_hours: row.get("usage_hours")?,
        created_at: row.get("created_at")?,
        assigned_at: row.get("assigned_at")?,
    })
}

impl Database {
    /// Insert a fresh assignment row.
    ///
    /// Fails with [`LabError::IntegrityViolation`] if the VMID is already
    /// tracked; use [`Database::upsert_assignment_class`] for the
    /// update-in-place recovery path.
    pub fn insert_assignment_row(
        &self,
        class_id: Option<i64>,
        vmid: u32,
        name: &str,
        node: &str,
        is_template_vm: bool,
        manually_added: bool,
    ) -> Result<i64, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        match conn.execute(
            "INSERT INTO vm_assignments
                (class_id, proxmox_vmid, vm_name, node, is_template_vm, manually_added, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![class_id, vmid, name, node, is_template_vm, manually_added, now],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(LabError::IntegrityViolation(format!(
                    "assignment for VM {vmid} already exists"
                ))
                .into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Attach a VM to a class, reusing an existing row for the same VMID.
    ///
    /// This is the manual-add/recovery path; moving a VM between classes
    /// updates the row in place so the VMID stays unique.
    pub fn upsert_assignment_class(
        &self,
        class_id: i64,
        vmid: u32,
        name: &str,
        node: &str,
    ) -> Result<i64, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM vm_assignments WHERE proxmox_vmid = ?1",
                [vmid],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE vm_assignments SET class_id = ?1, vm_name = ?2, node = ?3,
                     manually_added = 1 WHERE id = ?4",
                    params![class_id, name, node, id],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO vm_assignments
                        (class_id, proxmox_vmid, vm_name, node, manually_added, created_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![class_id, vmid, name, node, now],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn get_assignment(&self, id: i64) -> Result<VmAssignment, Error> {
        let conn = self.lock_conn();
        conn.query_row("SELECT * FROM vm_assignments WHERE id = ?1", [id], row_to_assignment)
            .optional()?
            .ok_or_else(|| LabError::NotFound(format!("no such assignment {id}")).into())
    }

    pub fn get_assignment_by_vmid(&self, vmid: u32) -> Result<Option<VmAssignment>, Error> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM vm_assignments WHERE proxmox_vmid = ?1",
                [vmid],
                row_to_assignment,
            )
            .optional()?)
    }

    pub fn list_assignments(&self) -> Result<Vec<VmAssignment>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM vm_assignments ORDER BY proxmox_vmid")?;
        let rows = stmt
            .query_map([], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_assignments_for_class(&self, class_id: i64) -> Result<Vec<VmAssignment>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM vm_assignments WHERE class_id = ?1 ORDER BY proxmox_vmid",
        )?;
        let rows = stmt
            .query_map([class_id], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_assignments_for_user(&self, user_id: i64) -> Result<Vec<VmAssignment>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM vm_assignments WHERE assigned_user_id = ?1 ORDER BY proxmox_vmid",
        )?;
        let rows = stmt
            .query_map([user_id], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Claim the lowest-VMID pool VM of a class for a user.
    ///
    /// Returns `None` when the pool is empty. Template and manually added
    /// VMs are never handed out. Callers must hold the class lock; the
    /// statement itself is atomic, so a racing sync cannot observe a
    /// half-claimed row.
    pub fn claim_pool_vm(&self, class_id: i64, user_id: i64) -> Result<Option<VmAssignment>, Error> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let now = proxmox_time::epoch_i64();

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM vm_assignments
                 WHERE class_id = ?1 AND assigned_user_id IS NULL
                   AND status = 'available' AND is_template_vm = 0 AND manually_added = 0
                 ORDER BY proxmox_vmid ASC LIMIT 1",
                [class_id],
                |row| row.get(0),
            )
            .optional()?;

        let id = match candidate {
            Some(id) => id,
            None => return Ok(None),
        };

        tx.execute(
            "UPDATE vm_assignments
             SET assigned_user_id = ?1, assigned_at = ?2, status = 'assigned'
             WHERE id = ?3",
            params![user_id, now, id],
        )?;

        let assignment =
            tx.query_row("SELECT * FROM vm_assignments WHERE id = ?1", [id], row_to_assignment)?;
        tx.commit()?;
        Ok(Some(assignment))
    }

    pub fn unassign_vm(&self, id: i64) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_assignments
             SET assigned_user_id = NULL, assigned_at = NULL, status = 'available'
             WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn set_assignment_status(&self, id: i64, status: AssignmentStatus) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_assignments SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        Ok(())
    }

    pub fn delete_assignment(&self, id: i64) -> Result<(), Error> {
        let conn = self.lock_conn();
        let changed = conn.execute("DELETE FROM vm_assignments WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(LabError::NotFound(format!("no such assignment {id}")).into());
        }
        Ok(())
    }

    /// Update the node after a cross-node migration was observed by the
    /// sync engine.
    pub fn update_assignment_node(&self, vmid: u32, node: &str) -> Result<bool, Error> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE vm_assignments SET node = ?1
             WHERE proxmox_vmid = ?2 AND node != ?1",
            params![node, vmid],
        )?;
        Ok(changed > 0)
    }

    /// Write a discovered IP, refusing to replace a real address with a
    /// placeholder.
    pub fn update_assignment_ip(
        &self,
        vmid: u32,
        ip: &str,
        mac: Option<&str>,
    ) -> Result<(), Error> {
        if is_ip_placeholder(ip) {
            return Ok(());
        }
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "UPDATE vm_assignments
             SET cached_ip = ?1, ip_updated_at = ?2,
                 mac_address = COALESCE(?3, mac_address)
             WHERE proxmox_vmid = ?4",
            params![ip, now, mac, vmid],
        )?;
        Ok(())
    }

    pub fn set_target_hostname(&self, id: i64, hostname: &str) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_assignments
             SET target_hostname = ?1, hostname_configured = 0 WHERE id = ?2",
            params![hostname, id],
        )?;
        Ok(())
    }

    pub fn mark_hostname_configured(&self, id: i64) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_assignments SET hostname_configured = 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Assignments with a pending hostname rename.
    pub fn list_pending_renames(&self) -> Result<Vec<VmAssignment>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM vm_assignments
             WHERE hostname_configured = 0 AND target_hostname IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn add_usage_hours(&self, id: i64, hours: f64) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE vm_assignments SET usage_hours = usage_hours + ?1 WHERE id = ?2",
            params![hours, id],
        )?;
        Ok(())
    }

    /// Rows belonging to nobody (no class, no user).
    pub fn list_orphan_assignments(&self) -> Result<Vec<VmAssignment>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM vm_assignments
             WHERE class_id IS NULL AND assigned_user_id IS NULL",
        )?;
        let rows = stmt
            .query_map([], row_to_assignment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete orphans only; pool VMs (class set, user unset) are never
    /// touched by this.
    pub fn delete_orphan_assignments(&self) -> Result<usize, Error> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM vm_assignments
             WHERE class_id IS NULL AND assigned_user_id IS NULL",
            [],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plm_api_types::UserRole;

    fn setup() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("t", "h", UserRole::Teacher).unwrap();
        let student = db.create_user("s", "h", UserRole::Student).unwrap();
        let class_id = db.insert_class("malware-lab", teacher).unwrap();
        (db, class_id, student)
    }

    #[test]
    fn test_vmid_uniqueness() {
        let (db, class_id, _) = setup();

        db.insert_assignment_row(Some(class_id), 12300, "vm-a", "node1", false, false)
            .unwrap();
        let err = db
            .insert_assignment_row(Some(class_id), 12300, "vm-b", "node2", false, false)
            .unwrap_err();
        match err.downcast_ref::<LabError>() {
            Some(LabError::IntegrityViolation(_)) => {}
            other => panic!("unexpected error: {other:?}"),
        }

        // recovery path reuses the row instead
        let id = db
            .upsert_assignment_class(class_id, 12300, "vm-b", "node2")
            .unwrap();
        let row = db.get_assignment(id).unwrap();
        assert_eq!(row.vm_name, "vm-b");
        assert_eq!(row.node, "node2");
        assert_eq!(db.list_assignments().unwrap().len(), 1);
    }

    #[test]
    fn test_claim_prefers_lowest_vmid_and_skips_special_vms() {
        let (db, class_id, student) = setup();

        db.insert_assignment_row(Some(class_id), 502, "vm-502", "node1", false, false)
            .unwrap();
        db.insert_assignment_row(Some(class_id), 501, "vm-501", "node1", false, false)
            .unwrap();
        // template and manually added rows must never be claimed
        db.insert_assignment_row(Some(class_id), 400, "tpl", "node1", true, false)
            .unwrap();
        db.insert_assignment_row(Some(class_id), 300, "manual", "node1", false, true)
            .unwrap();

        let claimed = db.claim_pool_vm(class_id, student).unwrap().unwrap();
        assert_eq!(claimed.proxmox_vmid, 501);
        assert_eq!(claimed.assigned_user_id, Some(student));
        assert_eq!(claimed.status, AssignmentStatus::Assigned);
        assert!(claimed.assigned_at.is_some());

        let second = db.claim_pool_vm(class_id, student).unwrap().unwrap();
        assert_eq!(second.proxmox_vmid, 502);

        // pool exhausted: 300 and 400 are not allocatable
        assert!(db.claim_pool_vm(class_id, student).unwrap().is_none());
    }

    #[test]
    fn test_ip_placeholder_preservation() {
        let (db, class_id, _) = setup();
        let id = db
            .insert_assignment_row(Some(class_id), 800, "vm", "node1", false, false)
            .unwrap();

        db.update_assignment_ip(800, "10.0.0.5", Some("02000c29abcd"))
            .unwrap();
        let row = db.get_assignment(id).unwrap();
        assert_eq!(row.cached_ip.as_deref(), Some("10.0.0.5"));
        let first_update = row.ip_updated_at;

        for placeholder in ["", "N/A", "Fetching..."] {
            db.update_assignment_ip(800, placeholder, None).unwrap();
        }
        let row = db.get_assignment(id).unwrap();
        assert_eq!(row.cached_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(row.ip_updated_at, first_update);
    }

    #[test]
    fn test_orphan_cleanup_spares_pool_vms() {
        let (db, class_id, student) = setup();

        // orphan: no class, no user
        db.insert_assignment_row(None, 900, "orphan", "node1", false, false)
            .unwrap();
        // pool VM: class, no user
        db.insert_assignment_row(Some(class_id), 901, "pool", "node1", false, false)
            .unwrap();
        // builder VM: user, no class
        let builder = db
            .insert_assignment_row(None, 902, "builder", "node1", false, false)
            .unwrap();
        {
            let conn = db.lock_conn();
            conn.execute(
                "UPDATE vm_assignments SET assigned_user_id = ?1, assigned_at = 1, status = 'assigned' WHERE id = ?2",
                params![student, builder],
            )
            .unwrap();
        }

        assert_eq!(db.list_orphan_assignments().unwrap().len(), 1);
        assert_eq!(db.delete_orphan_assignments().unwrap(), 1);

        assert!(db.get_assignment_by_vmid(900).unwrap().is_none());
        assert!(db.get_assignment_by_vmid(901).unwrap().is_some());
        let builder = db.get_assignment_by_vmid(902).unwrap().unwrap();
        assert!(builder.is_builder_vm());
    }

    #[test]
    fn test_node_update_after_migration() {
        let (db, class_id, _) = setup();
        db.insert_assignment_row(Some(class_id), 700, "vm", "node-a", false, false)
            .unwrap();

        assert!(db.update_assignment_node(700, "node-b").unwrap());
        assert!(!db.update_assignment_node(700, "node-b").unwrap());
        let row = db.get_assignment_by_vmid(700).unwrap().unwrap();
        assert_eq!(row.node, "node-b");
    }
}
