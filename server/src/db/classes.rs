//! Class table access.

use anyhow::Error;
use rusqlite::{params, OptionalExtension, Row};

use plm_api_types::{
    AutoShutdownPolicy, ClassConfig, DeploymentMethod, RestrictHours,
};

use super::Database;
use crate::error::LabError;

fn row_to_class(row: &Row) -> Result<ClassConfig, rusqlite::Error> {
    let method: String = row.get("deployment_method")?;
    Ok(ClassConfig {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        teacher_id: row.get("teacher_id")?,
        template_id: row.get("template_id")?,
        join_token: row.get("join_token")?,
        token_expires_at: row.get("token_expires_at")?,
        token_never_expires: row.get("token_never_expires")?,
        pool_size: row.get("pool_size")?,
        deployment_method: method.parse().unwrap_or(DeploymentMethod::LinkedClone),
        deployment_cluster: row.get("deployment_cluster")?,
        vmid_prefix: row.get("vmid_prefix")?,
        auto_shutdown: AutoShutdownPolicy {
            enabled: row.get("auto_shutdown_enabled")?,
            cpu_threshold: row.get("auto_shutdown_cpu_threshold")?,
            idle_minutes: row.get("auto_shutdown_idle_minutes")?,
        },
        restrict_hours: RestrictHours {
            enabled: row.get("restrict_hours_enabled")?,
            start: row.get("restrict_hours_start")?,
            end: row.get("restrict_hours_end")?,
        },
        max_usage_hours: row.get("max_usage_hours")?,
        cpu_cores: row.get("cpu_cores")?,
        memory_mb: row.get("memory_mb")?,
        clone_task_id: row.get("clone_task_id")?,
        lock_version: row.get("lock_version")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    pub fn insert_class(&self, name: &str, teacher_id: i64) -> Result<i64, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "INSERT INTO classes (name, teacher_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, teacher_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_class(&self, id: i64) -> Result<ClassConfig, Error> {
        let conn = self.lock_conn();
        conn.query_row("SELECT * FROM classes WHERE id = ?1", [id], row_to_class)
            .optional()?
            .ok_or_else(|| LabError::NotFound(format!("no such class {id}")).into())
    }

    pub fn list_classes(&self) -> Result<Vec<ClassConfig>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM classes ORDER BY name")?;
        let classes = stmt
            .query_map([], row_to_class)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(classes)
    }

    pub fn find_class_by_token(&self, token: &str) -> Result<Option<ClassConfig>, Error> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM classes WHERE join_token = ?1",
                [token],
                row_to_class,
            )
            .optional()?)
    }

    /// Persist class settings, detecting concurrent modification.
    ///
    /// `class.lock_version` must carry the version the caller loaded; the
    /// row's version is incremented on success. A version mismatch surfaces
    /// [`LabError::OptimisticLockConflict`].
    pub fn update_class(&self, class: &ClassConfig) -> Result<(), Error> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE classes SET
                name = ?1, description = ?2, template_id = ?3, pool_size = ?4,
                deployment_method = ?5, deployment_cluster = ?6, vmid_prefix = ?7,
                auto_shutdown_enabled = ?8, auto_shutdown_cpu_threshold = ?9,
                auto_shutdown_idle_minutes = ?10, restrict_hours_enabled = ?11,
                restrict_hours_start = ?12, restrict_hours_end = ?13,
                max_usage_hours = ?14, cpu_cores = ?15, memory_mb = ?16,
                lock_version = lock_version + 1
             WHERE id = ?17 AND lock_version = ?18",
            params![
                class.name,
                class.description,
                class.template_id,
                class.pool_size,
                class.deployment_method.to_string(),
                class.deployment_cluster,
                class.vmid_prefix,
                class.auto_shutdown.enabled,
                class.auto_shutdown.cpu_threshold,
                class.auto_shutdown.idle_minutes,
                class.restrict_hours.enabled,
                class.restrict_hours.start,
                class.restrict_hours.end,
                class.max_usage_hours,
                class.cpu_cores,
                class.memory_mb,
                class.id,
                class.lock_version,
            ],
        )?;

        if changed == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM classes WHERE id = ?1",
                [class.id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(LabError::NotFound(format!("no such class {}", class.id)).into());
            }
            return Err(LabError::OptimisticLockConflict(format!(
                "class {} was modified concurrently",
                class.id
            ))
            .into());
        }
        Ok(())
    }

    pub fn set_join_token(
        &self,
        class_id: i64,
        token: Option<&str>,
        expires_at: Option<i64>,
        never_expires: bool,
    ) -> Result<(), Error> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE classes SET join_token = ?1, token_expires_at = ?2,
             token_never_expires = ?3 WHERE id = ?4",
            params![token, expires_at, never_expires, class_id],
        )?;
        if changed == 0 {
            return Err(LabError::NotFound(format!("no such class {class_id}")).into());
        }
        Ok(())
    }

    pub fn set_clone_task(&self, class_id: i64, upid: Option<&str>) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE classes SET clone_task_id = ?1 WHERE id = ?2",
            params![upid, class_id],
        )?;
        Ok(())
    }

    /// Remove a class; assignments, enrollments, co-owners and class
    /// templates go with it (cascade).
    pub fn delete_class(&self, class_id: i64) -> Result<(), Error> {
        let conn = self.lock_conn();
        let changed = conn.execute("DELETE FROM classes WHERE id = ?1", [class_id])?;
        if changed == 0 {
            return Err(LabError::NotFound(format!("no such class {class_id}")).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plm_api_types::UserRole;

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("teacher", "h", UserRole::Teacher).unwrap();
        let class_id = db.insert_class("forensics", teacher).unwrap();
        (db, class_id)
    }

    #[test]
    fn test_optimistic_locking_detects_conflicts() {
        let (db, class_id) = setup();

        let mut first = db.get_class(class_id).unwrap();
        let mut second = first.clone();

        first.pool_size = 10;
        db.update_class(&first).unwrap();

        // second still carries the old lock_version
        second.pool_size = 20;
        let err = db.update_class(&second).unwrap_err();
        match err.downcast_ref::<LabError>() {
            Some(LabError::OptimisticLockConflict(_)) => {}
            other => panic!("unexpected error: {other:?}"),
        }

        // reload and retry succeeds
        let mut reloaded = db.get_class(class_id).unwrap();
        assert_eq!(reloaded.pool_size, 10);
        reloaded.pool_size = 20;
        db.update_class(&reloaded).unwrap();
        assert_eq!(db.get_class(class_id).unwrap().pool_size, 20);
    }

    #[test]
    fn test_join_token_lookup() {
        let (db, class_id) = setup();

        db.set_join_token(class_id, Some("token-abc"), None, true)
            .unwrap();
        let class = db.find_class_by_token("token-abc").unwrap().unwrap();
        assert_eq!(class.id, class_id);
        assert!(class.token_never_expires);

        assert!(db.find_class_by_token("other").unwrap().is_none());
    }

    #[test]
    fn test_delete_class_cascades_assignments() {
        let (db, class_id) = setup();

        db.insert_assignment_row(Some(class_id), 50001, "vm", "node1", false, false)
            .unwrap();
        assert_eq!(db.list_assignments_for_class(class_id).unwrap().len(), 1);

        db.delete_class(class_id).unwrap();
        assert!(db.get_assignment_by_vmid(50001).unwrap().is_none());
    }
}
