use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// Guest hardware specs cached from the template's config.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CachedSpecs {
    /// CPU cores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,

    /// CPU sockets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,

    /// Memory in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// Guest OS type (`l26`, `win11`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,

    /// Storage holding the primary disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_storage: Option<String>,

    /// Primary disk size in GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<f64>,

    /// Bridge of the first network device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_bridge: Option<String>,
}

#[api(
    properties: {
        specs: { type: CachedSpecs, flatten: true },
    },
)]
/// Reference to a Proxmox VM template.
///
/// Uniqueness is `(cluster_host, node, proxmox_vmid)`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TemplateEntry {
    /// Database ID.
    pub id: i64,

    /// Template name as shown in Proxmox.
    pub name: String,

    /// The template's VMID.
    pub proxmox_vmid: u32,

    /// Host of the cluster this template lives on.
    pub cluster_host: String,

    /// The node holding the template.
    pub node: String,

    /// Whether this is a replica of a template on another node.
    #[serde(default)]
    pub is_replica: bool,

    /// The user who created this template, if created through PLM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<i64>,

    /// Whether this template exists for one specific class only.
    #[serde(default)]
    pub is_class_template: bool,

    /// The class owning this template; bounds its lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<i64>,

    /// The template this one was derived from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_template_id: Option<i64>,

    #[serde(flatten)]
    pub specs: CachedSpecs,

    /// When existence in the cluster was last confirmed (epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<i64>,
}
