use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// One VM created by a batch deployment.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatedVm {
    /// The new guest's VMID.
    pub vmid: u32,

    /// The DNS-safe name it was created with.
    pub name: String,

    /// The node it was placed on.
    pub node: String,
}

#[api(
    properties: {
        errors: {
            type: Array,
            description: "Per-VM error messages.",
            items: {
                type: String,
                description: "One error message.",
            },
        },
        vms: {
            type: Array,
            description: "Successfully created VMs.",
            items: { type: CreatedVm },
        },
    },
)]
/// Outcome of a batch student-VM deployment.
///
/// Per-VM failures are collected; the batch reports partial success.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeploymentResult {
    /// Number of VMs created.
    pub created_count: u64,

    /// Number of VMs that failed.
    pub error_count: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<CreatedVm>,
}
