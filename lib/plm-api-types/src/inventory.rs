use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// The virtualization type of a guest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    /// A QEMU virtual machine.
    #[default]
    Qemu,
    /// An LXC container.
    Lxc,
}

serde_plain::derive_display_from_serialize!(GuestKind);
serde_plain::derive_fromstr_from_deserialize!(GuestKind);

#[api(
    properties: {
        "type": { type: GuestKind },
    },
)]
/// One row of the synchronized VM inventory.
///
/// Written exclusively by the sync engine, read by the API surface.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmInventoryEntry {
    /// The cluster this guest lives on.
    pub cluster_id: String,

    /// Guest VMID, unique per cluster.
    pub vmid: u32,

    /// Guest name.
    pub name: String,

    /// The node the guest resides on.
    pub node: String,

    /// Power state as reported by the cluster (`running`, `stopped`, ...).
    pub status: String,

    #[serde(rename = "type", default)]
    pub kind: GuestKind,

    /// OS category derived from ostype and name (`linux`, `windows`, `other`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Last discovered IP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Primary NIC MAC address, canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    /// Configured memory in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,

    /// Configured CPU cores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,

    /// Configured disk size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u64>,

    /// Uptime in seconds, if running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,

    /// CPU usage fraction (0.0 - 1.0), if running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,

    /// Memory usage fraction (0.0 - 1.0), if running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,

    /// Whether the guest is a template.
    #[serde(default)]
    pub is_template: bool,

    /// Semicolon separated guest tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,

    /// Whether port 3389 was reachable at the last probe.
    #[serde(default)]
    pub rdp_available: bool,

    /// Whether port 22 was reachable at the last probe.
    #[serde(default)]
    pub ssh_available: bool,

    /// Last full-sync touch (epoch).
    #[serde(default)]
    pub last_updated: i64,

    /// Last quick status refresh (epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_check: Option<i64>,

    /// Error of the last sync attempt for this guest, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

#[api(
    properties: {
        entry: { type: VmInventoryEntry, flatten: true },
    },
)]
/// An inventory row augmented with assignment-derived fields for listings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmListEntry {
    #[serde(flatten)]
    pub entry: VmInventoryEntry,

    /// Whether this VM is a teacher-owned builder VM.
    #[serde(default)]
    pub is_builder_vm: bool,

    /// The owning username, only filled in for admin callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_to: Option<String>,
}
