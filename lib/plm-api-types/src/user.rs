use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// The role of a local user account.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Full access to all clusters, classes and templates.
    Admin,
    /// May create classes and manage VMs of classes they teach or co-own.
    Teacher,
    /// Sees only VMs assigned to them.
    Student,
}

serde_plain::derive_display_from_serialize!(UserRole);
serde_plain::derive_fromstr_from_deserialize!(UserRole);

impl UserRole {
    pub fn is_admin(self) -> bool {
        matches!(self, UserRole::Admin)
    }

    pub fn is_teacher(self) -> bool {
        matches!(self, UserRole::Teacher)
    }
}

#[api(
    properties: {
        role: { type: UserRole },
    },
)]
/// A local user account as returned by the API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserEntry {
    /// Database ID.
    pub id: i64,

    /// Unique login name.
    pub username: String,

    pub role: UserRole,

    /// Creation time (epoch).
    pub created_at: i64,
}
