//! Class lifecycle: join tokens, enrollment, pool allocation.

use anyhow::Error;

use plm_api_types::{ClassConfig, ClassStudent, ClassSummary, VmAssignment};

use crate::db::Database;
use crate::error::LabError;

pub mod policy;

/// Default join-token lifetime.
pub const DEFAULT_TOKEN_DAYS: u32 = 7;

const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Issue a fresh join token for a class.
///
/// A positive `expires_in_days` arms the expiry; zero makes the token
/// permanent until explicitly invalidated.
pub fn generate_join_token(
    db: &Database,
    class_id: i64,
    expires_in_days: u32,
) -> Result<String, Error> {
    let raw = proxmox_sys::linux::random_data(32)?;
    let token = proxmox_base64::url::encode_no_pad(&raw);

    let (expires_at, never_expires) = if expires_in_days > 0 {
        (
            Some(proxmox_time::epoch_i64() + expires_in_days as i64 * SECONDS_PER_DAY),
            false,
        )
    } else {
        (None, true)
    };

    db.set_join_token(class_id, Some(&token), expires_at, never_expires)?;
    Ok(token)
}

/// Invalidate the current join token of a class.
pub fn invalidate_join_token(db: &Database, class_id: i64) -> Result<(), Error> {
    db.set_join_token(class_id, None, None, false)
}

/// Outcome of a join attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JoinOutcome {
    pub class_id: i64,
    /// Whether this call created the enrollment (false on repeat joins).
    pub newly_enrolled: bool,
    /// The VM held by the user after the call, if any.
    pub assigned_vmid: Option<u32>,
}

/// Enroll a user via join token and hand out a pool VM if one is free.
///
/// Idempotent: joining twice is a no-op success. When the pool is empty the
/// enrollment still succeeds and the user waits for allocation.
pub async fn join_via_token(
    db: &Database,
    user_id: i64,
    token: &str,
) -> Result<JoinOutcome, Error> {
    let class = db
        .find_class_by_token(token)?
        .ok_or_else(|| LabError::InvalidInput("invalid or expired join token".to_string()))?;

    if !class.is_token_valid(proxmox_time::epoch_i64()) {
        return Err(LabError::InvalidInput("invalid or expired join token".to_string()).into());
    }

    // claiming must not interleave with other joins or batch operations on
    // this class
    let _guard = db.class_locks().lock(class.id).await?;

    if db.is_enrolled(user_id, class.id)? {
        let assigned_vmid = db
            .list_assignments_for_class(class.id)?
            .into_iter()
            .find(|vm| vm.assigned_user_id == Some(user_id))
            .map(|vm| vm.proxmox_vmid);
        return Ok(JoinOutcome {
            class_id: class.id,
            newly_enrolled: false,
            assigned_vmid,
        });
    }

    db.enroll_user(user_id, class.id)?;

    let assigned_vmid = match db.claim_pool_vm(class.id, user_id)? {
        Some(vm) => {
            log::info!(
                "allocated VM {} to user {} in class '{}'",
                vm.proxmox_vmid,
                user_id,
                class.name
            );
            Some(vm.proxmox_vmid)
        }
        None => {
            log::info!(
                "user {} joined class '{}' but the pool is empty",
                user_id,
                class.name
            );
            None
        }
    };

    Ok(JoinOutcome {
        class_id: class.id,
        newly_enrolled: true,
        assigned_vmid,
    })
}

/// Manually allocate a pool VM to an (already enrolled) user.
pub async fn allocate_pool_vm(
    db: &Database,
    class_id: i64,
    user_id: i64,
) -> Result<VmAssignment, Error> {
    let _guard = db.class_locks().lock(class_id).await?;

    if !db.is_enrolled(user_id, class_id)? {
        return Err(
            LabError::InvalidInput(format!("user {user_id} is not enrolled in class {class_id}"))
                .into(),
        );
    }
    if db
        .list_assignments_for_class(class_id)?
        .iter()
        .any(|vm| vm.assigned_user_id == Some(user_id))
    {
        return Err(LabError::InvalidInput(format!(
            "user {user_id} already holds a VM in class {class_id}"
        ))
        .into());
    }

    db.claim_pool_vm(class_id, user_id)?
        .ok_or_else(|| LabError::NotFound(format!("class {class_id} has no free pool VM")).into())
}

/// Build the class summary with derived pool statistics.
pub fn class_summary(db: &Database, class: ClassConfig) -> Result<ClassSummary, Error> {
    let assignments = db.list_assignments_for_class(class.id)?;
    let students = db.list_enrollments(class.id)?;

    let students: Vec<ClassStudent> = students
        .into_iter()
        .map(|user| {
            let vmid = assignments
                .iter()
                .find(|vm| vm.assigned_user_id == Some(user.id))
                .map(|vm| vm.proxmox_vmid);
            ClassStudent {
                id: user.id,
                username: user.username,
                vmid,
            }
        })
        .collect();

    let assigned_count = assignments
        .iter()
        .filter(|vm| vm.assigned_user_id.is_some())
        .count() as u64;
    let unassigned_count = assignments
        .iter()
        .filter(|vm| vm.assigned_user_id.is_none())
        .count() as u64;

    Ok(ClassSummary {
        token_valid: class.is_token_valid(proxmox_time::epoch_i64()),
        enrolled_count: students.len() as u64,
        assigned_count,
        unassigned_count,
        students,
        class,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plm_api_types::UserRole;

    async fn setup_class_with_pool() -> (Database, i64, String) {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("teacher", "h", UserRole::Teacher).unwrap();
        let class_id = db.insert_class("pentest", teacher).unwrap();
        let token = generate_join_token(&db, class_id, 7).unwrap();

        db.insert_assignment_row(Some(class_id), 501, "vm-501", "node1", false, false)
            .unwrap();
        db.insert_assignment_row(Some(class_id), 502, "vm-502", "node1", false, false)
            .unwrap();

        (db, class_id, token)
    }

    #[tokio::test]
    async fn test_pool_allocation_on_join() {
        let (db, class_id, token) = setup_class_with_pool().await;
        let user = db.create_user("student", "h", UserRole::Student).unwrap();

        let outcome = join_via_token(&db, user, &token).await.unwrap();
        assert!(outcome.newly_enrolled);
        assert_eq!(outcome.assigned_vmid, Some(501));

        let vm = db.get_assignment_by_vmid(501).unwrap().unwrap();
        assert_eq!(vm.assigned_user_id, Some(user));

        // 502 remains untouched
        let other = db.get_assignment_by_vmid(502).unwrap().unwrap();
        assert!(other.assigned_user_id.is_none());

        // enrolled in exactly this class
        assert!(db.is_enrolled(user, class_id).unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_join_is_idempotent() {
        let (db, _class_id, token) = setup_class_with_pool().await;
        let user = db.create_user("student", "h", UserRole::Student).unwrap();

        let first = join_via_token(&db, user, &token).await.unwrap();
        assert!(first.newly_enrolled);

        let second = join_via_token(&db, user, &token).await.unwrap();
        assert!(!second.newly_enrolled);
        assert_eq!(second.assigned_vmid, Some(501));

        // no second VM was handed out
        let other = db.get_assignment_by_vmid(502).unwrap().unwrap();
        assert!(other.assigned_user_id.is_none());
    }

    #[tokio::test]
    async fn test_join_with_invalid_token() {
        let (db, class_id, token) = setup_class_with_pool().await;
        let user = db.create_user("student", "h", UserRole::Student).unwrap();

        assert!(join_via_token(&db, user, "bogus").await.is_err());

        // expire the token
        db.set_join_token(
            class_id,
            Some(&token),
            Some(proxmox_time::epoch_i64() - 10),
            false,
        )
        .unwrap();
        assert!(join_via_token(&db, user, &token).await.is_err());

        // a permanent token with a stale expiry field still works
        db.set_join_token(
            class_id,
            Some(&token),
            Some(proxmox_time::epoch_i64() - 10),
            true,
        )
        .unwrap();
        assert!(join_via_token(&db, user, &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_with_empty_pool_still_enrolls() {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("teacher", "h", UserRole::Teacher).unwrap();
        let class_id = db.insert_class("empty", teacher).unwrap();
        let token = generate_join_token(&db, class_id, 0).unwrap();
        let user = db.create_user("student", "h", UserRole::Student).unwrap();

        let outcome = join_via_token(&db, user, &token).await.unwrap();
        assert!(outcome.newly_enrolled);
        assert_eq!(outcome.assigned_vmid, None);
        assert!(db.is_enrolled(user, class_id).unwrap());
    }

    #[tokio::test]
    async fn test_token_expiry_policy() {
        let db = Database::open_in_memory().unwrap();
        let teacher = db.create_user("teacher", "h", UserRole::Teacher).unwrap();
        let class_id = db.insert_class("c", teacher).unwrap();

        generate_join_token(&db, class_id, 7).unwrap();
        let class = db.get_class(class_id).unwrap();
        assert!(!class.token_never_expires);
        let expires_at = class.token_expires_at.unwrap();
        let expected = proxmox_time::epoch_i64() + 7 * SECONDS_PER_DAY;
        assert!((expires_at - expected).abs() < 5);

        generate_join_token(&db, class_id, 0).unwrap();
        let class = db.get_class(class_id).unwrap();
        assert!(class.token_never_expires);
        assert!(class.token_expires_at.is_none());

        invalidate_join_token(&db, class_id).unwrap();
        let class = db.get_class(class_id).unwrap();
        assert!(class.join_token.is_none());
        assert!(!class.is_token_valid(proxmox_time::epoch_i64()));
    }
}
