//! Module to setup the API server's global runtime context.
//!
//! Make sure to call `init` *once* when starting up the API server.

use anyhow::Error;

use crate::connection;
use crate::db::{self, clusters::DbClusterConfig, Database};

/// Dependency-inject the production database, cluster-config and client
/// factory implementations.
pub fn init() -> Result<(), Error> {
    let database = Database::open(plm_buildcfg::PLM_DB_FN)?;
    db::init(database.clone());

    plm_config::clusters::init(Box::new(DbClusterConfig::new(database.clone())));
    connection::init(Box::new(connection::DefaultClientFactory::default()));

    // the JSON bootstrap file only seeds an empty cluster table; the table
    // is authoritative from then on
    match plm_config::clusters::read_bootstrap_file() {
        Ok(clusters) if !clusters.is_empty() => {
            let seeded = database.seed_clusters(&clusters)?;
            if seeded > 0 {
                log::info!("seeded {seeded} clusters from the legacy bootstrap file");
            }
        }
        Ok(_) => {}
        Err(err) => log::warn!("ignoring unreadable cluster bootstrap file: {err}"),
    }

    Ok(())
}
