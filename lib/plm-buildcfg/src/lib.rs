//! Exports configuration data from the build system

pub const PROXMOX_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const PROXMOX_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");

/// The configured configuration directory
pub const CONFIGDIR: &str = "/etc/proxmox-lab-manager";

/// Static web assets served next to the API.
pub const SHARE_DIR: &str = "/usr/share/proxmox-lab-manager";

/// Unix system user the API daemon runs as
pub const API_USER_NAME: &str = "www-data";
/// Unix system group the API daemon runs as
pub const API_GROUP_NAME: &str = "www-data";

/// The TCP port the API daemon listens on.
pub const PLM_PORT: u16 = 8445;

#[macro_export]
macro_rules! PLM_RUN_DIR_M {
    () => {
        "/run/proxmox-lab-manager"
    };
}

#[macro_export]
macro_rules! PLM_STATE_DIR_M {
    () => {
        "/var/lib/proxmox-lab-manager"
    };
}

#[macro_export]
macro_rules! PLM_LOG_DIR_M {
    () => {
        "/var/log/proxmox-lab-manager"
    };
}

#[macro_export]
macro_rules! PLM_CACHE_DIR_M {
    () => {
        "/var/cache/proxmox-lab-manager"
    };
}

/// namespaced directory for in-memory (tmpfs) run state
pub const PLM_RUN_DIR: &str = PLM_RUN_DIR_M!();

/// namespaced directory for persistent cache
pub const PLM_CACHE_DIR: &str = PLM_CACHE_DIR_M!();

/// namespaced directory for persistent state
pub const PLM_STATE_DIR: &str = PLM_STATE_DIR_M!();

/// namespaced directory for persistent logging
pub const PLM_LOG_DIR: &str = PLM_LOG_DIR_M!();

/// The inventory database file.
pub const PLM_DB_FN: &str = concat!(PLM_STATE_DIR_M!(), "/lab.db");

/// Optional legacy JSON file used to seed the cluster table on first start.
pub const PLM_CLUSTER_BOOTSTRAP_FN: &str = configdir!("/clusters.json");

/// logfile for all API requests handled by the API daemon. Note that not all
/// failed logins can be logged here with full information, use the auth log
/// for that.
pub const API_ACCESS_LOG_FN: &str = concat!(PLM_LOG_DIR_M!(), "/api/access.log");

/// logfile for any failed authentication and new successful ticket creations.
/// This file can be useful for fail2ban.
pub const API_AUTH_LOG_FN: &str = concat!(PLM_LOG_DIR_M!(), "/api/auth.log");

/// the PID filename for the API daemon
pub const PLM_API_PID_FN: &str = concat!(PLM_RUN_DIR_M!(), "/api.pid");

/// Prepend configuration directory to a file name
///
/// This is a simply way to get the full path for configuration files.
/// #### Example:
/// ```
/// use plm_buildcfg::configdir;
/// let auth_key_path = configdir!("/auth/authkey.key");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/proxmox-lab-manager", $subdir)
    };
}

/// Prepend the run directory to a file name.
///
/// This is a simply way to get the full path for files in `/run`.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!($crate::PLM_RUN_DIR_M!(), $subdir)
    };
}
