use serde::{Deserialize, Serialize};

use proxmox_schema::{api, Updater};

#[api]
/// How student VMs of a class are created from the class template.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMethod {
    /// Snapshot based `qm clone` sharing the template disk.
    #[default]
    LinkedClone,
    /// Fresh QCOW2 overlay backed by an exported base image.
    ConfigClone,
}

serde_plain::derive_display_from_serialize!(DeploymentMethod);
serde_plain::derive_fromstr_from_deserialize!(DeploymentMethod);

#[api]
/// Automatic shutdown policy for the VMs of a class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AutoShutdownPolicy {
    /// Whether idle VMs of this class are shut down automatically.
    #[serde(default)]
    pub enabled: bool,

    /// CPU usage (percent) below which a VM counts as idle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_threshold: Option<u8>,

    /// Minutes of continuous idle time before shutdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u32>,
}

#[api]
/// Restricts when VMs of a class may run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RestrictHours {
    /// Whether the hour restriction is enforced.
    #[serde(default)]
    pub enabled: bool,

    /// First hour of the allowed window (0-23).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<u8>,

    /// First hour after the allowed window (0-23).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<u8>,
}

#[api(
    properties: {
        "deployment-method": { type: DeploymentMethod },
        "auto-shutdown": { type: AutoShutdownPolicy },
        "restrict-hours": { type: RestrictHours },
    },
)]
/// A lab class and its deployment settings.
#[derive(Clone, Debug, Deserialize, Serialize, Updater)]
#[serde(rename_all = "kebab-case")]
pub struct ClassConfig {
    /// Database ID.
    #[updater(skip)]
    pub id: i64,

    /// Display name, also the prefix for student VM names.
    pub name: String,

    /// Free form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The primary teacher owning this class.
    #[updater(skip)]
    pub teacher_id: i64,

    /// The template student VMs are cloned from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<i64>,

    /// Current join token, if one was issued.
    #[updater(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_token: Option<String>,

    /// Expiry of the join token (epoch).
    #[updater(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<i64>,

    /// Whether the join token is exempt from expiry.
    #[updater(skip)]
    #[serde(default)]
    pub token_never_expires: bool,

    /// Target number of VMs in the pool.
    #[serde(default)]
    pub pool_size: u32,

    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    #[updater(type = "Option<DeploymentMethod>")]
    #[serde(default)]
    pub deployment_method: DeploymentMethod,

    /// The cluster student VMs are deployed on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_cluster: Option<String>,

    /// VMID range prefix, student VMIDs start at `prefix * 100`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid_prefix: Option<u32>,

    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    #[updater(type = "Option<AutoShutdownPolicy>")]
    #[serde(default)]
    pub auto_shutdown: AutoShutdownPolicy,

    #[updater(serde(skip_serializing_if = "Option::is_none"))]
    #[updater(type = "Option<RestrictHours>")]
    #[serde(default)]
    pub restrict_hours: RestrictHours,

    /// Per-student session budget in hours, 0 disables the limit.
    #[serde(default)]
    pub max_usage_hours: u32,

    /// CPU cores for overlay-deployed student VMs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,

    /// Memory for overlay-deployed student VMs in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// UPID of an ongoing batch deployment, if any.
    #[updater(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clone_task_id: Option<String>,

    /// Optimistic locking version, incremented on every update.
    #[updater(skip)]
    #[serde(default)]
    pub lock_version: i64,

    /// Creation time (epoch).
    #[updater(skip)]
    #[serde(default)]
    pub created_at: i64,
}

impl ClassConfig {
    /// A join token is usable while it exists and has not expired.
    pub fn is_token_valid(&self, now: i64) -> bool {
        if self.join_token.is_none() {
            return false;
        }
        if self.token_never_expires {
            return true;
        }
        match self.token_expires_at {
            Some(expires_at) => now < expires_at,
            None => false,
        }
    }
}

#[api]
/// Per-student entry in a class summary.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClassStudent {
    /// User database ID.
    pub id: i64,

    /// Login name.
    pub username: String,

    /// VMID of the VM assigned to this student, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
}

#[api(
    properties: {
        class: { type: ClassConfig, flatten: true },
        students: {
            type: Array,
            description: "Enrolled students and their VMs.",
            items: { type: ClassStudent },
        },
    },
)]
/// A class together with derived pool statistics.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClassSummary {
    #[serde(flatten)]
    pub class: ClassConfig,

    /// Whether the join token is currently valid.
    pub token_valid: bool,

    /// Number of VMs assigned to users.
    pub assigned_count: u64,

    /// Number of pool VMs not yet assigned.
    pub unassigned_count: u64,

    /// Number of enrolled students.
    pub enrolled_count: u64,

    pub students: Vec<ClassStudent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class_with_token(
        token: Option<&str>,
        expires_at: Option<i64>,
        never_expires: bool,
    ) -> ClassConfig {
        ClassConfig {
            id: 1,
            name: "netsec".to_string(),
            description: None,
            teacher_id: 1,
            template_id: None,
            join_token: token.map(String::from),
            token_expires_at: expires_at,
            token_never_expires: never_expires,
            pool_size: 0,
            deployment_method: DeploymentMethod::LinkedClone,
            deployment_cluster: None,
            vmid_prefix: None,
            auto_shutdown: AutoShutdownPolicy::default(),
            restrict_hours: RestrictHours::default(),
            max_usage_hours: 0,
            cpu_cores: None,
            memory_mb: None,
            clone_task_id: None,
            lock_version: 1,
            created_at: 0,
        }
    }

    #[test]
    fn test_token_validity() {
        let now = 1_000_000;

        assert!(!class_with_token(None, None, false).is_token_valid(now));
        assert!(!class_with_token(None, None, true).is_token_valid(now));

        // expiring token
        assert!(class_with_token(Some("t"), Some(now + 1), false).is_token_valid(now));
        assert!(!class_with_token(Some("t"), Some(now), false).is_token_valid(now));
        assert!(!class_with_token(Some("t"), Some(now - 1), false).is_token_valid(now));

        // never expiring token wins over a stale expiry field
        assert!(class_with_token(Some("t"), Some(now - 1), true).is_token_valid(now));
        assert!(class_with_token(Some("t"), None, true).is_token_valid(now));

        // token present but neither flag nor expiry set
        assert!(!class_with_token(Some("t"), None, false).is_token_valid(now));
    }
}
