//! Cluster configuration storage.
//!
//! The `clusters` table is the authoritative source; the JSON column keeps
//! the schema stable while the config type evolves. The
//! [`plm_config::clusters::ClusterConfigAccess`] implementation lives here
//! and is injected at daemon startup (see [`crate::context`]).

use anyhow::Error;
use rusqlite::params;

use plm_api_types::clusters::ClusterConfig;
use plm_config::clusters::ClusterConfigAccess;

use super::Database;

impl Database {
    pub fn list_clusters(&self) -> Result<Vec<ClusterConfig>, Error> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT config FROM clusters")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut clusters = Vec::with_capacity(raw.len());
        for entry in raw {
            clusters.push(serde_json::from_str::<ClusterConfig>(&entry)?);
        }
        clusters.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(clusters)
    }

    pub fn save_cluster(&self, cluster: &ClusterConfig) -> Result<(), Error> {
        let conn = self.lock_conn();
        let raw = serde_json::to_string(cluster)?;
        conn.execute(
            "INSERT INTO clusters (id, config) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET config = excluded.config",
            params![cluster.id, raw],
        )?;
        Ok(())
    }

    pub fn remove_cluster(&self, id: &str) -> Result<bool, Error> {
        let conn = self.lock_conn();
        let changed = conn.execute("DELETE FROM clusters WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Seed the table from the legacy JSON bootstrap file, but only while
    /// the table is still empty.
    pub fn seed_clusters(&self, clusters: &[ClusterConfig]) -> Result<usize, Error> {
        if !self.list_clusters()?.is_empty() {
            return Ok(0);
        }
        for cluster in clusters {
            self.save_cluster(cluster)?;
        }
        Ok(clusters.len())
    }
}

/// DB backed implementation injected into `plm_config::clusters`.
pub struct DbClusterConfig {
    db: Database,
}

impl DbClusterConfig {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl ClusterConfigAccess for DbClusterConfig {
    fn config(&self) -> Result<Vec<ClusterConfig>, Error> {
        self.db.list_clusters()
    }

    fn save_cluster(&self, cluster: &ClusterConfig) -> Result<(), Error> {
        self.db.save_cluster(cluster)
    }

    fn remove_cluster(&self, id: &str) -> Result<(), Error> {
        self.db.remove_cluster(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_cluster_config;

    #[test]
    fn test_cluster_roundtrip_and_priority_order() {
        let db = Database::open_in_memory().unwrap();

        let mut second = fake_cluster_config("beta");
        second.priority = 2;
        let mut first = fake_cluster_config("alpha");
        first.priority = 1;

        db.save_cluster(&second).unwrap();
        db.save_cluster(&first).unwrap();

        let clusters = db.list_clusters().unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].id, "alpha");

        // seeding does nothing once entries exist
        assert_eq!(db.seed_clusters(&[fake_cluster_config("gamma")]).unwrap(), 0);

        assert!(db.remove_cluster("beta").unwrap());
        assert!(!db.remove_cluster("beta").unwrap());
    }
}
