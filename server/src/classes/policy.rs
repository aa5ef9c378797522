//! Assignment graph policy: orphan cleanup and VM recovery.
//!
//! The invariants themselves (unique VMID, pool/builder/orphan
//! classification, allocation exclusions) live in the database layer and in
//! `plm_api_types::VmAssignment`; this module provides the administrative
//! workflows on top.

use anyhow::Error;

use plm_api_types::{VmAssignment, VmInventoryEntry};

use crate::db::Database;

/// VMIDs recoverable for a class share its zero-padded id as their decimal
/// prefix and are at least five digits long.
pub fn vmid_matches_class(vmid: u32, class_id: i64) -> bool {
    let vmid = vmid.to_string();
    vmid.len() >= 5 && vmid.starts_with(&format!("{class_id:02}"))
}

/// List orphaned assignments (no class, no user).
pub fn list_orphans(db: &Database) -> Result<Vec<VmAssignment>, Error> {
    db.list_orphan_assignments()
}

/// Delete orphans; pool VMs are never touched.
pub fn delete_orphans(db: &Database) -> Result<usize, Error> {
    let deleted = db.delete_orphan_assignments()?;
    if deleted > 0 {
        log::info!("deleted {deleted} orphaned assignments");
    }
    Ok(deleted)
}

/// Scan the synchronized inventory for guests whose VMID falls into a
/// class's range but which are not tracked for it.
///
/// The result is presented to an admin who confirms a subset for
/// [`add_vms_to_class`].
pub fn scan_recoverable_vms(
    db: &Database,
    class_id: i64,
) -> Result<Vec<VmInventoryEntry>, Error> {
    let tracked: Vec<u32> = db
        .list_assignments_for_class(class_id)?
        .into_iter()
        .map(|vm| vm.proxmox_vmid)
        .collect();

    Ok(db
        .list_vms(None, None, None)?
        .into_iter()
        .filter(|vm| !vm.is_template)
        .filter(|vm| vmid_matches_class(vm.vmid, class_id))
        .filter(|vm| !tracked.contains(&vm.vmid))
        .collect())
}

/// Attach the given VMs to a class.
///
/// An existing assignment row for the same VMID is moved to the target
/// class (update-in-place) so the VMID stays unique across the table.
pub fn add_vms_to_class(db: &Database, class_id: i64, vmids: &[u32]) -> Result<usize, Error> {
    // ensure the class exists before touching any row
    db.get_class(class_id)?;

    let mut added = 0;
    for &vmid in vmids {
        let (name, node) = match db.find_vm_any_cluster(vmid)? {
            Some(entry) => (entry.name, entry.node),
            None => (format!("vm-{vmid}"), String::new()),
        };
        db.upsert_assignment_class(class_id, vmid, &name, &node)?;
        added += 1;
    }

    if added > 0 {
        log::info!("attached {added} VMs to class {class_id}");
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plm_api_types::UserRole;

    #[test]
    fn test_vmid_prefix_match() {
        // class 12 owns the 12xxx range
        assert!(vmid_matches_class(12300, 12));
        assert!(vmid_matches_class(12399, 12));
        assert!(!vmid_matches_class(1230, 12)); // too short
        assert!(!vmid_matches_class(13300, 12));
        // single digit classes are zero padded, so a plain 7xxxx range does
        // not belong to class 7
        assert!(!vmid_matches_class(7300, 7));
        assert!(!vmid_matches_class(73000, 7));
    }

    #[test]
    fn test_scan_and_recover() {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("t", "h", UserRole::Teacher).unwrap();
        // a two digit class id keeps the recoverable range in plain decimal
        let mut class_id = 0;
        for i in 0..12 {
            class_id = db.insert_class(&format!("c{i}"), teacher).unwrap();
        }
        assert_eq!(class_id, 12);

        let matching: u32 = 12300;
        let tracked: u32 = 12301;

        let entry = |vmid: u32| VmInventoryEntry {
            cluster_id: "lab".to_string(),
            vmid,
            name: format!("vm-{vmid}"),
            node: "node1".to_string(),
            status: "stopped".to_string(),
            ..Default::default()
        };
        db.upsert_vms(&[entry(matching), entry(tracked), entry(99999)])
            .unwrap();

        // one of the range VMs is already tracked
        db.insert_assignment_row(Some(class_id), tracked, "vm", "node1", false, false)
            .unwrap();

        let recoverable = scan_recoverable_vms(&db, class_id).unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].vmid, matching);

        assert_eq!(add_vms_to_class(&db, class_id, &[matching]).unwrap(), 1);
        let row = db.get_assignment_by_vmid(matching).unwrap().unwrap();
        assert_eq!(row.class_id, Some(class_id));
        assert!(row.manually_added);

        // nothing recoverable remains
        assert!(scan_recoverable_vms(&db, class_id).unwrap().is_empty());
    }
}
