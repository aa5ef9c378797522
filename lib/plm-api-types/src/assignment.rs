use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// Lifecycle state of a class VM.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// In the pool, waiting for a student.
    #[default]
    Available,
    /// Claimed by a student.
    Assigned,
    /// Queued for removal, skipped by allocation.
    Deleting,
}

serde_plain::derive_display_from_serialize!(AssignmentStatus);
serde_plain::derive_fromstr_from_deserialize!(AssignmentStatus);

#[api(
    properties: {
        status: { type: AssignmentStatus },
    },
)]
/// A VM managed by the lab workflow, optionally assigned to a user.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmAssignment {
    /// Database ID.
    pub id: i64,

    /// The owning class, `None` for builder VMs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_id: Option<i64>,

    /// The guest's VMID, unique across all assignments.
    pub proxmox_vmid: u32,

    /// Name given at clone time.
    pub vm_name: String,

    /// Primary NIC MAC address, canonical 12-hex-digit form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    /// Last discovered IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_ip: Option<String>,

    /// When `cached_ip` was last written (epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_updated_at: Option<i64>,

    /// The node the guest currently resides on.
    pub node: String,

    /// The student this VM is assigned to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_user_id: Option<i64>,

    pub status: AssignmentStatus,

    /// The template reference VM of a class, never allocated to users.
    #[serde(default)]
    pub is_template_vm: bool,

    /// Added by an admin, skipped by automatic allocation.
    #[serde(default)]
    pub manually_added: bool,

    /// Whether the in-guest hostname was already rewritten.
    #[serde(default)]
    pub hostname_configured: bool,

    /// The hostname the guest should be renamed to after boot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_hostname: Option<String>,

    /// Accumulated powered-on time while assigned, in hours.
    #[serde(default)]
    pub usage_hours: f64,

    /// Creation time (epoch).
    pub created_at: i64,

    /// When the VM was assigned to its user (epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<i64>,
}

impl VmAssignment {
    /// A pool member belongs to a class but has not been claimed yet.
    pub fn is_pool_member(&self) -> bool {
        self.class_id.is_some()
            && self.assigned_user_id.is_none()
            && self.status == AssignmentStatus::Available
    }

    /// A builder VM is owned by a teacher directly, outside any class.
    pub fn is_builder_vm(&self) -> bool {
        self.class_id.is_none() && self.assigned_user_id.is_some() && !self.is_template_vm
    }

    /// An orphan belongs to nobody and may be garbage collected.
    pub fn is_orphan(&self) -> bool {
        self.class_id.is_none() && self.assigned_user_id.is_none()
    }

    /// Whether `join_via_token` may hand this VM to a student.
    pub fn is_allocatable(&self) -> bool {
        self.is_pool_member() && !self.is_template_vm && !self.manually_added
    }
}
