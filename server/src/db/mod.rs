//! SQLite backed inventory store.
//!
//! One database file holds users, classes, templates, VM assignments, the
//! synchronized VM inventory, ISO images and the cluster configuration.
//! The connection lives behind a mutex; async callers go through
//! [`Database::run`] which moves the access onto a blocking thread.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use anyhow::{format_err, Error};
use rusqlite::Connection;

pub mod assignments;
pub mod classes;
pub mod clusters;
pub mod inventory;
pub mod isos;
pub mod locks;
pub mod templates;
pub mod users;

pub use locks::ClassLockMap;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(15);

static INSTANCE: OnceLock<Database> = OnceLock::new();

/// Handle to the inventory store, cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    class_locks: ClassLockMap,
}

/// Initialize the process-wide database instance.
///
/// Will panic if the instance has already been set.
pub fn init(db: Database) {
    if INSTANCE.set(db).is_err() {
        panic!("database instance already set");
    }
}

/// Access the process-wide database instance.
///
/// Will panic if [`init`] has not been called.
pub fn get() -> &'static Database {
    INSTANCE.get().expect("database not initialized")
}

impl Database {
    /// Open (and create if necessary) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let this = Self {
            conn: Arc::new(Mutex::new(conn)),
            class_locks: ClassLockMap::new(),
        };
        this.create_tables()?;
        Ok(this)
    }

    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // there is no good way to recover from a poisoned connection mutex
        self.conn.lock().expect("database mutex poisoned")
    }

    /// The per-class lock map serializing batch operations.
    pub fn class_locks(&self) -> &ClassLockMap {
        &self.class_locks
    }

    /// Run a database access on a blocking thread.
    pub async fn run<F, T>(&self, func: F) -> Result<T, Error>
    where
        F: FnOnce(Database) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || func(this))
            .await
            .map_err(|err| format_err!("database task panicked: {err}"))?
    }

    fn create_tables(&self) -> Result<(), Error> {
        let conn = self.lock_conn();
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'student',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

CREATE TABLE IF NOT EXISTS classes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    teacher_id INTEGER NOT NULL REFERENCES users(id),
    template_id INTEGER,
    join_token TEXT UNIQUE,
    token_expires_at INTEGER,
    token_never_expires INTEGER NOT NULL DEFAULT 0,
    pool_size INTEGER NOT NULL DEFAULT 0,
    deployment_method TEXT NOT NULL DEFAULT 'linked_clone',
    deployment_cluster TEXT,
    vmid_prefix INTEGER,
    auto_shutdown_enabled INTEGER NOT NULL DEFAULT 0,
    auto_shutdown_cpu_threshold INTEGER,
    auto_shutdown_idle_minutes INTEGER,
    restrict_hours_enabled INTEGER NOT NULL DEFAULT 0,
    restrict_hours_start INTEGER,
    restrict_hours_end INTEGER,
    max_usage_hours INTEGER NOT NULL DEFAULT 0,
    cpu_cores INTEGER,
    memory_mb INTEGER,
    clone_task_id TEXT,
    lock_version INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_classes_join_token ON classes(join_token);

CREATE TABLE IF NOT EXISTS class_enrollments (
    user_id INTEGER NOT NULL REFERENCES users(id),
    class_id INTEGER NOT NULL REFERENCES classes(id) ON DELETE CASCADE,
    enrolled_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, class_id)
);

CREATE TABLE IF NOT EXISTS class_co_owners (
    user_id INTEGER NOT NULL REFERENCES users(id),
    class_id INTEGER NOT NULL REFERENCES classes(id) ON DELETE CASCADE,
    added_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, class_id)
);

CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    proxmox_vmid INTEGER NOT NULL,
    cluster_host TEXT NOT NULL,
    node TEXT NOT NULL,
    is_replica INTEGER NOT NULL DEFAULT 0,
    created_by INTEGER,
    is_class_template INTEGER NOT NULL DEFAULT 0,
    class_id INTEGER REFERENCES classes(id) ON DELETE CASCADE,
    original_template_id INTEGER,
    cores INTEGER,
    sockets INTEGER,
    memory_mb INTEGER,
    os_type TEXT,
    disk_storage TEXT,
    disk_size_gb REAL,
    network_bridge TEXT,
    last_verified_at INTEGER,
    UNIQUE (cluster_host, node, proxmox_vmid)
);
CREATE INDEX IF NOT EXISTS idx_templates_vmid ON templates(proxmox_vmid);

CREATE TABLE IF NOT EXISTS vm_assignments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    class_id INTEGER REFERENCES classes(id) ON DELETE CASCADE,
    proxmox_vmid INTEGER NOT NULL UNIQUE,
    vm_name TEXT NOT NULL DEFAULT '',
    mac_address TEXT,
    cached_ip TEXT,
    ip_updated_at INTEGER,
    node TEXT NOT NULL DEFAULT '',
    assigned_user_id INTEGER REFERENCES users(id),
    status TEXT NOT NULL DEFAULT 'available',
    is_template_vm INTEGER NOT NULL DEFAULT 0,
    manually_added INTEGER NOT NULL DEFAULT 0,
    hostname_configured INTEGER NOT NULL DEFAULT 0,
    target_hostname TEXT,
    usage_hours REAL NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    assigned_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_assignments_class ON vm_assignments(class_id);
CREATE INDEX IF NOT EXISTS idx_assignments_user ON vm_assignments(assigned_user_id);
CREATE INDEX IF NOT EXISTS idx_assignments_mac ON vm_assignments(mac_address);

CREATE TABLE IF NOT EXISTS vm_inventory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id TEXT NOT NULL,
    vmid INTEGER NOT NULL,
    name TEXT NOT NULL,
    node TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'unknown',
    type TEXT NOT NULL DEFAULT 'qemu',
    category TEXT,
    ip TEXT,
    mac_address TEXT,
    memory INTEGER,
    cores INTEGER,
    disk_size INTEGER,
    uptime INTEGER,
    cpu_usage REAL,
    memory_usage REAL,
    is_template INTEGER NOT NULL DEFAULT 0,
    tags TEXT,
    rdp_available INTEGER NOT NULL DEFAULT 0,
    ssh_available INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL,
    last_status_check INTEGER,
    sync_error TEXT,
    UNIQUE (cluster_id, vmid)
);
CREATE INDEX IF NOT EXISTS idx_inventory_cluster_status ON vm_inventory(cluster_id, status);
CREATE INDEX IF NOT EXISTS idx_inventory_cluster_template ON vm_inventory(cluster_id, is_template);

CREATE TABLE IF NOT EXISTS iso_images (
    volid TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    node TEXT NOT NULL,
    storage TEXT NOT NULL,
    cluster_id TEXT NOT NULL,
    discovered_at INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clusters (
    id TEXT PRIMARY KEY,
    config TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.create_tables().unwrap();
        db.create_tables().unwrap();
    }
}
