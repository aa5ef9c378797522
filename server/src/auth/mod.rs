//! Authentication primitives for the HTTP server.
//!
//! Identity is a plain username backed by the local `users` table; tickets
//! are signed cookies in the usual `PLM:user:epoch::signature` shape with a
//! CSRF token for non-GET requests. Members of a cluster's configured admin
//! group count as admins in addition to database-role admins.

use anyhow::{bail, format_err, Error};

use proxmox_auth_api::api::assemble_csrf_prevention_token;
use proxmox_auth_api::ticket::Ticket;
use proxmox_auth_api::{HMACKey, Keyring};
use proxmox_rest_server::AuthError;
use proxmox_router::{RpcEnvironment, UserInformation};

use plm_api_types::{UserEntry, UserRole, Userid};

use crate::cache::registry;
use crate::connection;
use crate::db;
use crate::error::LabError;

pub mod csrf;
pub mod key;

/// Ticket prefix of the login cookie.
pub const TICKET_PREFIX: &str = "PLM";

/// Prefix of console tickets (path restricted, see the console API).
pub const TERM_PREFIX: &str = "PLMTERM";

const COOKIE_NAME: &str = "PLMAuthCookie";

/// Ticket lifetime in seconds.
const TICKET_LIFETIME: i64 = 2 * 3600;

/// Pre-load lazy things like the csrf and auth keys.
pub fn init(use_private_key: bool) {
    let _ = key::public_auth_key();
    let _ = csrf::csrf_secret();
    if use_private_key {
        let _ = key::private_auth_key();
    }
}

pub fn setup_keys() -> Result<(), Error> {
    if let Err(err) = key::generate_auth_key() {
        bail!("unable to generate auth key - {err}");
    }
    if let Err(err) = csrf::generate_csrf_key() {
        bail!("unable to generate csrf key - {err}");
    }
    Ok(())
}

/// Hash a password for storage (PBKDF2-HMAC-SHA256).
pub fn hash_password(password: &str) -> Result<String, Error> {
    const ITERATIONS: usize = 65536;

    let salt = proxmox_sys::linux::random_data(16)?;
    let mut digest = [0u8; 32];
    openssl::pkcs5::pbkdf2_hmac(
        password.as_bytes(),
        &salt,
        ITERATIONS,
        openssl::hash::MessageDigest::sha256(),
        &mut digest,
    )?;

    Ok(format!(
        "pbkdf2${ITERATIONS}${}${}",
        hex::encode(&salt),
        hex::encode(digest)
    ))
}

/// Verify a password against a stored hash.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, Error> {
    let mut parts = stored.split('$');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("pbkdf2"), Some(iterations), Some(salt), Some(expected)) => {
            let iterations: usize = iterations.parse()?;
            let salt = hex::decode(salt)?;
            let expected = hex::decode(expected)?;

            let mut digest = vec![0u8; expected.len()];
            openssl::pkcs5::pbkdf2_hmac(
                password.as_bytes(),
                &salt,
                iterations,
                openssl::hash::MessageDigest::sha256(),
                &mut digest,
            )?;

            Ok(openssl::memcmp::eq(&digest, &expected))
        }
        _ => bail!("unsupported password hash format"),
    }
}

/// Create a signed login ticket and matching CSRF token for a user.
pub fn create_ticket(username: &str) -> Result<(String, String), Error> {
    let userid: Userid = format!("{username}@plm").parse()?;

    let keyring = Keyring::with_private_key(key::private_auth_key().clone());
    let ticket = Ticket::new(TICKET_PREFIX, &userid)?.sign(&keyring, None)?;
    let csrf_token = assemble_csrf_prevention_token(csrf_secret(), &userid);

    Ok((ticket, csrf_token))
}

fn csrf_secret() -> &'static HMACKey {
    csrf::csrf_secret()
}

fn extract_auth_cookie(headers: &http::HeaderMap) -> Option<String> {
    for header in headers.get_all(http::header::COOKIE) {
        let value = header.to_str().ok()?;
        for cookie in value.split(';') {
            let cookie = cookie.trim();
            if let Some(ticket) = cookie.strip_prefix(COOKIE_NAME).and_then(|c| c.strip_prefix('='))
            {
                return Some(ticket.to_string());
            }
        }
    }
    None
}

/// Authentication hook for the REST server.
///
/// Verifies the ticket cookie, enforces the CSRF token on non-GET requests
/// and resolves the user's role from the database.
pub async fn check_auth(
    headers: &http::HeaderMap,
    method: &hyper::Method,
) -> Result<(String, Box<dyn UserInformation + Sync + Send>), AuthError> {
    let ticket = extract_auth_cookie(headers)
        .ok_or_else(|| AuthError::NoData)?;

    let keyring = Keyring::with_public_key(key::public_auth_key().clone());
    let userid: Userid = Ticket::<Userid>::parse(&ticket)
        .and_then(|ticket| ticket.verify(&keyring, TICKET_PREFIX, None))
        .map_err(AuthError::Generic)?;

    if method != hyper::Method::GET && method != hyper::Method::HEAD {
        let csrf_token = headers
            .get("CSRFPreventionToken")
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| AuthError::Generic(format_err!("missing CSRF prevention token")))?;

        proxmox_auth_api::api::verify_csrf_prevention_token(
            csrf_secret(),
            &userid,
            csrf_token,
            -300,
            TICKET_LIFETIME,
        )
        .map_err(AuthError::Generic)?;
    }

    let username = userid.name().as_str().to_string();
    let user = db::get()
        .lookup_user(&username)
        .map_err(AuthError::Generic)?
        .ok_or_else(|| AuthError::Generic(format_err!("no such user '{username}'")))?;

    Ok((username, Box::new(LabUserInfo { role: user.role })))
}

/// Role based [`UserInformation`]; all fine grained checks happen in the
/// handlers which see the full user entry.
struct LabUserInfo {
    role: UserRole,
}

impl UserInformation for LabUserInfo {
    fn is_superuser(&self, _auth_id: &str) -> bool {
        self.role.is_admin()
    }

    fn is_group_member(&self, _user_id: &str, group: &str) -> bool {
        match group {
            "teachers" => self.role.is_teacher(),
            _ => false,
        }
    }

    fn lookup_privs(&self, _auth_id: &str, _path: &[&str]) -> u64 {
        // authorization dispatches on the role enum inside the handlers
        0
    }
}

/// The calling user, resolved from the request environment.
pub fn current_user(rpcenv: &dyn RpcEnvironment) -> Result<UserEntry, Error> {
    let username = rpcenv
        .get_auth_id()
        .ok_or_else(|| format_err!("no authid available"))?;

    db::get()
        .lookup_user(&username)?
        .ok_or_else(|| LabError::AccessDenied(format!("unknown user '{username}'")).into())
}

/// Require one of the admin/teacher roles, surfacing `AccessDenied`
/// otherwise.
pub fn require_role(user: &UserEntry, minimum: UserRole) -> Result<(), Error> {
    let allowed = match minimum {
        UserRole::Admin => user.role.is_admin(),
        UserRole::Teacher => user.role.is_admin() || user.role.is_teacher(),
        UserRole::Student => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(LabError::AccessDenied(format!(
            "user '{}' lacks the required role",
            user.username
        ))
        .into())
    }
}

/// Whether a user may manage a given class (admin, teacher or co-owner).
pub fn can_manage_class(user: &UserEntry, class: &plm_api_types::ClassConfig) -> Result<bool, Error> {
    if user.role.is_admin() {
        return Ok(true);
    }
    if class.teacher_id == user.id {
        return Ok(true);
    }
    db::get().is_co_owner(user.id, class.id)
}

/// Admin-group members of a cluster, cached for two minutes with
/// stale-on-error reads.
pub async fn admin_group_members(cluster_id: &str) -> Vec<String> {
    if let Some(members) = registry().admin_group_lookup(cluster_id) {
        return members;
    }

    let fetch = async {
        let cluster = plm_config::clusters::get_cluster(cluster_id)?;
        let group = match &cluster.admin_group {
            Some(group) => group.clone(),
            None => return Ok::<_, Error>(Vec::new()),
        };
        let client = connection::make_pve_client(&cluster).await?;
        Ok(client.group_info(&group).await?.members)
    };

    match fetch.await {
        Ok(members) => {
            registry().admin_group_store(cluster_id.to_string(), members.clone());
            members
        }
        Err(err) => {
            log::warn!("failed to refresh admin group of '{cluster_id}': {err}");
            registry()
                .admin_group_lookup_stale(cluster_id)
                .unwrap_or_default()
        }
    }
}

/// Whether a username is listed as cluster admin (group membership or the
/// explicit admin-users list), accepting both realm variants.
pub async fn is_cluster_admin(username: &str) -> bool {
    let clusters = match plm_config::clusters::config() {
        Ok(clusters) => clusters,
        Err(_) => return false,
    };

    let variants = [
        username.to_string(),
        format!("{username}@pam"),
        format!("{username}@pve"),
    ];

    for cluster in clusters {
        if let Some(admin_users) = &cluster.admin_users {
            if admin_users
                .split(',')
                .map(str::trim)
                .any(|admin| variants.iter().any(|v| v == admin))
            {
                return true;
            }
        }
        if cluster.admin_group.is_some() {
            let members = admin_group_members(&cluster.id).await;
            if members.iter().any(|m| variants.iter().any(|v| v == m)) {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("pbkdf2$"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());

        // two hashes of the same password differ (fresh salt)
        let other = hash_password("hunter2").unwrap();
        assert_ne!(hash, other);

        assert!(verify_password("x", "plain$nonsense").is_err());
    }

    #[test]
    fn test_require_role() {
        let user = |role| UserEntry {
            id: 1,
            username: "u".to_string(),
            role,
            created_at: 0,
        };

        assert!(require_role(&user(UserRole::Admin), UserRole::Admin).is_ok());
        assert!(require_role(&user(UserRole::Teacher), UserRole::Admin).is_err());
        assert!(require_role(&user(UserRole::Teacher), UserRole::Teacher).is_ok());
        assert!(require_role(&user(UserRole::Student), UserRole::Teacher).is_err());
        assert!(require_role(&user(UserRole::Student), UserRole::Student).is_ok());
    }
}
