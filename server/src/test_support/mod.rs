//! Shared helpers for tests.

use plm_api_types::clusters::ClusterConfig;

pub mod fake_cluster;

pub use fake_cluster::{FakeClientFactory, FakeClusterState, FakePveApi};

/// A minimal cluster config for tests; IP lookup is off so no test ever
/// reaches for the network.
pub fn fake_cluster_config(id: &str) -> ClusterConfig {
    ClusterConfig {
        id: id.to_string(),
        name: id.to_string(),
        host: format!("{id}.example.test"),
        port: 8006,
        user: "root@pam".to_string(),
        password: "password".to_string(),
        verify_tls: false,
        is_default: true,
        is_active: true,
        allow_vm_deployment: true,
        allow_template_sync: true,
        allow_iso_sync: true,
        auto_shutdown_enabled: false,
        priority: 0,
        default_storage: Some("local-lvm".to_string()),
        template_storage: None,
        iso_storage: None,
        qcow2_template_path: None,
        qcow2_images_path: None,
        admin_group: None,
        admin_users: None,
        arp_subnets: Vec::new(),
        vm_cache_ttl: None,
        enable_ip_lookup: false,
        enable_ip_persistence: false,
        description: None,
    }
}
