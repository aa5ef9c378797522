//! Read/write cluster configuration
//!
//! The authoritative cluster list lives in the inventory database; the server
//! crate injects its implementation via [`init`] before any of the access
//! functions are used. A legacy JSON bootstrap file can seed an empty table
//! on first start (see [`read_bootstrap_file`]).

use std::sync::OnceLock;

use anyhow::{bail, Error};

use plm_api_types::clusters::ClusterConfig;

static INSTANCE: OnceLock<Box<dyn ClusterConfigAccess + Send + Sync>> = OnceLock::new();

fn instance() -> &'static (dyn ClusterConfigAccess + Send + Sync) {
    // Not initializing the cluster config instance is
    // entirely in our responsibility and not something we can recover from,
    // so it should be okay to panic in this case.
    INSTANCE
        .get()
        .expect("cluster config not initialized")
        .as_ref()
}

/// Return all configured clusters, ordered by priority.
///
/// Will panic if the cluster config instance has not been set before.
pub fn config() -> Result<Vec<ClusterConfig>, Error> {
    instance().config()
}

/// Look up a single cluster by id.
///
/// Will panic if the cluster config instance has not been set before.
pub fn get_cluster(id: &str) -> Result<ClusterConfig, Error> {
    match instance().config()?.into_iter().find(|c| c.id == id) {
        Some(cluster) => Ok(cluster),
        None => bail!("no such cluster '{id}'"),
    }
}

/// Persist a cluster entry (insert or replace).
///
/// Will panic if the cluster config instance has not been set before.
pub fn save_cluster(cluster: &ClusterConfig) -> Result<(), Error> {
    instance().save_cluster(cluster)
}

/// Remove a cluster entry.
///
/// Will panic if the cluster config instance has not been set before.
pub fn remove_cluster(id: &str) -> Result<(), Error> {
    instance().remove_cluster(id)
}

pub trait ClusterConfigAccess {
    /// Return all configured clusters, ordered by priority.
    fn config(&self) -> Result<Vec<ClusterConfig>, Error>;
    /// Persist a cluster entry (insert or replace).
    fn save_cluster(&self, cluster: &ClusterConfig) -> Result<(), Error>;
    /// Remove a cluster entry.
    fn remove_cluster(&self, id: &str) -> Result<(), Error>;
}

/// Initialize the [`ClusterConfigAccess`] instance.
///
/// Will panic if the instance has already been set.
pub fn init(instance: Box<dyn ClusterConfigAccess + Send + Sync>) {
    if INSTANCE.set(instance).is_err() {
        panic!("cluster config instance already set");
    }
}

/// Read the legacy JSON bootstrap file, if present.
///
/// Returns an empty list when the file does not exist. Only consulted once,
/// to seed an empty cluster table on first start.
pub fn read_bootstrap_file() -> Result<Vec<ClusterConfig>, Error> {
    let raw =
        proxmox_sys::fs::file_read_optional_string(plm_buildcfg::PLM_CLUSTER_BOOTSTRAP_FN)?;
    match raw {
        Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(Vec::new()),
    }
}
