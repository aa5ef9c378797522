//! User accounts and class membership tables.

use anyhow::{format_err, Error};
use rusqlite::{params, OptionalExtension, Row};

use plm_api_types::{UserEntry, UserRole};

use super::Database;
use crate::error::LabError;

fn row_to_user(row: &Row) -> Result<(UserEntry, String), rusqlite::Error> {
    let role: String = row.get("role")?;
    let entry = UserEntry {
        id: row.get("id")?,
        username: row.get("username")?,
        role: role.parse().unwrap_or(UserRole::Student),
        created_at: row.get("created_at")?,
    };
    let password_hash = row.get("password_hash")?;
    Ok((entry, password_hash))
}

impl Database {
    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        role: UserRole,
    ) -> Result<i64, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        match conn.execute(
            "INSERT INTO users (username, password_hash, role, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, password_hash, role.to_string(), now],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(LabError::InvalidInput(format!("user '{username}' already exists")).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_user(&self, id: i64) -> Result<UserEntry, Error> {
        let conn = self.lock_conn();
        conn.query_row("SELECT * FROM users WHERE id = ?1", [id], |row| {
            row_to_user(row).map(|(user, _)| user)
        })
        .optional()?
        .ok_or_else(|| LabError::NotFound(format!("no such user {id}")).into())
    }

    pub fn lookup_user(&self, username: &str) -> Result<Option<UserEntry>, Error> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row("SELECT * FROM users WHERE username = ?1", [username], |row| {
                row_to_user(row).map(|(user, _)| user)
            })
            .optional()?)
    }

    /// Look up a user together with the stored password hash.
    pub fn lookup_user_with_hash(
        &self,
        username: &str,
    ) -> Result<Option<(UserEntry, String)>, Error> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row("SELECT * FROM users WHERE username = ?1", [username], row_to_user)
            .optional()?)
    }

    pub fn list_users(&self) -> Result<Vec<UserEntry>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM users ORDER BY username")?;
        let users = stmt
            .query_map([], |row| row_to_user(row).map(|(user, _)| user))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn update_user_role(&self, id: i64, role: UserRole) -> Result<(), Error> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role.to_string(), id],
        )?;
        if changed == 0 {
            return Err(LabError::NotFound(format!("no such user {id}")).into());
        }
        Ok(())
    }

    pub fn enroll_user(&self, user_id: i64, class_id: i64) -> Result<bool, Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO class_enrollments (user_id, class_id, enrolled_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, class_id, now],
        )?;
        Ok(inserted > 0)
    }

    pub fn is_enrolled(&self, user_id: i64, class_id: i64) -> Result<bool, Error> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM class_enrollments WHERE user_id = ?1 AND class_id = ?2",
            params![user_id, class_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_enrollments(&self, class_id: i64) -> Result<Vec<UserEntry>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT u.* FROM users u
             JOIN class_enrollments e ON e.user_id = u.id
             WHERE e.class_id = ?1 ORDER BY u.username",
        )?;
        let users = stmt
            .query_map([class_id], |row| row_to_user(row).map(|(user, _)| user))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn add_co_owner(&self, user_id: i64, class_id: i64) -> Result<(), Error> {
        let conn = self.lock_conn();
        let now = proxmox_time::epoch_i64();
        conn.execute(
            "INSERT OR IGNORE INTO class_co_owners (user_id, class_id, added_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, class_id, now],
        )?;
        Ok(())
    }

    pub fn is_co_owner(&self, user_id: i64, class_id: i64) -> Result<bool, Error> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM class_co_owners WHERE user_id = ?1 AND class_id = ?2",
            params![user_id, class_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Classes the user teaches or co-owns.
    pub fn owned_class_ids(&self, user_id: i64) -> Result<Vec<i64>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM classes WHERE teacher_id = ?1
             UNION
             SELECT class_id FROM class_co_owners WHERE user_id = ?1",
        )?;
        let ids = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn username_of(&self, user_id: i64) -> Result<String, Error> {
        self.get_user(user_id)
            .map(|user| user.username)
            .map_err(|_| format_err!("dangling user reference {user_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_roundtrip_and_duplicate() {
        let db = Database::open_in_memory().unwrap();

        let id = db.create_user("alice", "hash", UserRole::Teacher).unwrap();
        let user = db.get_user(id).unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.role, UserRole::Teacher);

        // duplicate username is rejected
        assert!(db.create_user("alice", "hash2", UserRole::Student).is_err());

        assert!(db.lookup_user("bob").unwrap().is_none());
        let (found, hash) = db.lookup_user_with_hash("alice").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(hash, "hash");
    }

    #[test]
    fn test_enrollment_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("t", "h", UserRole::Teacher).unwrap();
        let student = db.create_user("s", "h", UserRole::Student).unwrap();
        let class_id = db.insert_class("netsec", teacher).unwrap();

        assert!(db.enroll_user(student, class_id).unwrap());
        assert!(!db.enroll_user(student, class_id).unwrap());
        assert!(db.is_enrolled(student, class_id).unwrap());
        assert_eq!(db.list_enrollments(class_id).unwrap().len(), 1);
    }
}
