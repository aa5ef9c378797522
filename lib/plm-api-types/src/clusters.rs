//! Cluster connection configuration.

use serde::{Deserialize, Serialize};

use proxmox_schema::{api, Updater};

use crate::CLUSTER_ID_SCHEMA;

#[api(
    properties: {
        "id": { schema: CLUSTER_ID_SCHEMA },
        "arp-subnets": {
            type: Array,
            optional: true,
            items: {
                type: String,
                description: "Subnet in CIDR notation scanned for MAC/IP pairs.",
            },
        },
    },
)]
/// The information required to connect to and manage a Proxmox VE cluster.
#[derive(Clone, Debug, Deserialize, Serialize, Updater, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// An id for this entry.
    #[updater(skip)]
    pub id: String,

    /// Display name.
    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    pub name: String,

    /// Cluster entry-point address (gateway node).
    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    pub host: String,

    /// API port.
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Realm-suffixed user for API and shell access (e.g. `root@pam`).
    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    pub user: String,

    /// Password for API and shell access.
    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    pub password: String,

    /// Whether to verify the cluster's TLS certificate.
    #[serde(default)]
    pub verify_tls: bool,

    /// Whether this is the default cluster for new classes.
    #[serde(default)]
    pub is_default: bool,

    /// Inactive clusters are skipped by the sync engine.
    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Whether student VMs may be deployed here.
    #[serde(default = "default_true")]
    pub allow_vm_deployment: bool,

    /// Whether templates are synchronized from this cluster.
    #[serde(default = "default_true")]
    pub allow_template_sync: bool,

    /// Whether ISO images are synchronized from this cluster.
    #[serde(default = "default_true")]
    pub allow_iso_sync: bool,

    /// Whether the auto-shutdown daemon considers this cluster.
    #[serde(default)]
    pub auto_shutdown_enabled: bool,

    /// Ordering weight when multiple clusters are configured.
    #[serde(default)]
    pub priority: i64,

    /// Storage used when nothing more specific applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_storage: Option<String>,

    /// Storage holding class templates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_storage: Option<String>,

    /// Storage holding ISO images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso_storage: Option<String>,

    /// Shared-storage path for exported base images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qcow2_template_path: Option<String>,

    /// Shared-storage path for student overlay images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qcow2_images_path: Option<String>,

    /// Proxmox group whose members count as PLM admins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_group: Option<String>,

    /// Additional admin user ids (comma separated, realm suffixed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_users: Option<String>,

    /// Subnets scanned by the ARP sweep.
    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arp_subnets: Vec<String>,

    /// TTL for the cluster-resources cache in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_cache_ttl: Option<u64>,

    /// Whether guest-side IP lookup is attempted.
    #[serde(default = "default_true")]
    pub enable_ip_lookup: bool,

    /// Whether discovered IPs are persisted to guest notes.
    #[serde(default)]
    pub enable_ip_persistence: bool,

    /// Free form comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_api_port() -> u16 {
    8006
}

fn default_true() -> bool {
    true
}

impl ClusterConfig {
    /// The user name without the realm suffix, as used for SSH logins.
    pub fn shell_user(&self) -> &str {
        match self.user.split_once('@') {
            Some((name, _realm)) => name,
            None => &self.user,
        }
    }

    /// Base URL of the cluster API.
    pub fn api_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_user_strips_realm() {
        let mut cluster = ClusterConfig {
            id: "lab".into(),
            name: "Lab".into(),
            host: "10.0.0.1".into(),
            port: 8006,
            user: "root@pam".into(),
            password: "secret".into(),
            verify_tls: false,
            is_default: true,
            is_active: true,
            allow_vm_deployment: true,
            allow_template_sync: true,
            allow_iso_sync: true,
            auto_shutdown_enabled: false,
            priority: 0,
            default_storage: None,
            template_storage: None,
            iso_storage: None,
            qcow2_template_path: None,
            qcow2_images_path: None,
            admin_group: None,
            admin_users: None,
            arp_subnets: Vec::new(),
            vm_cache_ttl: None,
            enable_ip_lookup: true,
            enable_ip_persistence: false,
            description: None,
        };

        assert_eq!(cluster.shell_user(), "root");
        cluster.user = "admin".into();
        assert_eq!(cluster.shell_user(), "admin");
        assert_eq!(cluster.api_url(), "https://10.0.0.1:8006");
    }
}
