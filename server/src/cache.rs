//! Process-wide caches with explicit init and per-cache mutexes.
//!
//! Invalidation is always a method on the registry, never a free variable.
//! All caches allow stale reads when a refresh fails.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Admin group membership cache TTL.
pub const ADMIN_GROUP_CACHE_TTL: Duration = Duration::from_secs(120);

/// Cluster-resources cache TTL.
pub const CLUSTER_RESOURCES_CACHE_TTL: Duration = Duration::from_secs(10);

/// How long a swept MAC/IP pair stays fresh.
pub const ARP_CACHE_TTL: Duration = Duration::from_secs(3600);

static INSTANCE: OnceLock<CacheRegistry> = OnceLock::new();

/// Access the process-wide cache registry.
pub fn registry() -> &'static CacheRegistry {
    INSTANCE.get_or_init(CacheRegistry::new)
}

struct TimedEntry<T> {
    value: T,
    stored_at: Instant,
}

/// A value cached per key with a fixed TTL.
struct TtlMap<T> {
    entries: HashMap<String, TimedEntry<T>>,
    ttl: Duration,
}

impl<T: Clone> TtlMap<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn get_fresh(&self, key: &str) -> Option<T> {
        self.entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// The stored value regardless of age, for stale-on-error reads.
    fn get_stale(&self, key: &str) -> Option<T> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn insert(&mut self, key: String, value: T) {
        self.entries.insert(
            key,
            TimedEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A MAC/IP pair discovered by the ARP sweep, along with the port probe
/// results of the same cycle.
#[derive(Clone, Debug, Default)]
pub struct ArpCacheEntry {
    pub ip: String,
    pub rdp_open: bool,
    pub ssh_open: bool,
}

/// Holds each process-wide cache behind its own mutex.
pub struct CacheRegistry {
    /// normalized MAC -> sweep result
    arp: Mutex<TtlMap<ArpCacheEntry>>,
    /// cluster id -> admin group member list
    admin_groups: Mutex<TtlMap<Vec<String>>>,
    /// cluster id -> raw cluster resources
    cluster_resources: Mutex<TtlMap<Vec<plm_api_types::pve::ClusterResource>>>,
}

impl CacheRegistry {
    fn new() -> Self {
        Self {
            arp: Mutex::new(TtlMap::new(ARP_CACHE_TTL)),
            admin_groups: Mutex::new(TtlMap::new(ADMIN_GROUP_CACHE_TTL)),
            cluster_resources: Mutex::new(TtlMap::new(CLUSTER_RESOURCES_CACHE_TTL)),
        }
    }

    pub fn arp_lookup(&self, mac: &str) -> Option<ArpCacheEntry> {
        self.arp.lock().unwrap().get_fresh(mac)
    }

    pub fn arp_store(&self, mac: String, entry: ArpCacheEntry) {
        self.arp.lock().unwrap().insert(mac, entry);
    }

    pub fn admin_group_lookup(&self, cluster_id: &str) -> Option<Vec<String>> {
        self.admin_groups.lock().unwrap().get_fresh(cluster_id)
    }

    /// Stale admin-group members, used when the refresh fails.
    pub fn admin_group_lookup_stale(&self, cluster_id: &str) -> Option<Vec<String>> {
        self.admin_groups.lock().unwrap().get_stale(cluster_id)
    }

    pub fn admin_group_store(&self, cluster_id: String, members: Vec<String>) {
        self.admin_groups.lock().unwrap().insert(cluster_id, members);
    }

    pub fn invalidate_admin_group(&self, cluster_id: &str) {
        self.admin_groups.lock().unwrap().remove(cluster_id);
    }

    pub fn cluster_resources_lookup(
        &self,
        cluster_id: &str,
    ) -> Option<Vec<plm_api_types::pve::ClusterResource>> {
        self.cluster_resources.lock().unwrap().get_fresh(cluster_id)
    }

    pub fn cluster_resources_store(
        &self,
        cluster_id: String,
        resources: Vec<plm_api_types::pve::ClusterResource>,
    ) {
        self.cluster_resources
            .lock()
            .unwrap()
            .insert(cluster_id, resources);
    }

    pub fn invalidate_cluster(&self, cluster_id: &str) {
        self.cluster_resources.lock().unwrap().remove(cluster_id);
        self.admin_groups.lock().unwrap().remove(cluster_id);
    }

    pub fn invalidate_all(&self) {
        self.cluster_resources.lock().unwrap().clear();
        self.admin_groups.lock().unwrap().clear();
        self.arp.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_reads_survive_expiry() {
        let mut map = TtlMap::new(Duration::from_secs(0));
        map.insert("lab".to_string(), vec!["root@pam".to_string()]);

        // immediately expired with a zero TTL
        assert!(map.get_fresh("lab").is_none());
        assert_eq!(map.get_stale("lab").unwrap(), vec!["root@pam".to_string()]);

        map.remove("lab");
        assert!(map.get_stale("lab").is_none());
    }

    #[test]
    fn test_registry_invalidation() {
        let registry = CacheRegistry::new();
        registry.admin_group_store("lab".into(), vec!["root@pam".into()]);
        assert!(registry.admin_group_lookup("lab").is_some());

        registry.invalidate_cluster("lab");
        assert!(registry.admin_group_lookup("lab").is_none());
        assert!(registry.admin_group_lookup_stale("lab").is_none());
    }
}
