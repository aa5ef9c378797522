//! Common API endpoints

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{list_subdirs_api_method, Permission, Router, SubdirMap};
use proxmox_schema::api;
use proxmox_sortable_macro::sortable;

use crate::error::LabError;

pub mod access;
pub mod classes;
pub mod clusters;
pub mod console;
pub mod isos;
pub mod maintenance;
pub mod sync;
pub mod templates;
pub mod vms;

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([
    ("access", &access::ROUTER),
    ("classes", &classes::ROUTER),
    ("clusters", &clusters::ROUTER),
    ("isos", &isos::ROUTER),
    ("join", &classes::JOIN_ROUTER),
    ("maintenance", &maintenance::ROUTER),
    ("ping", &Router::new().get(&API_METHOD_PING)),
    ("sync", &sync::ROUTER),
    ("templates", &templates::ROUTER),
    ("version", &Router::new().get(&API_METHOD_VERSION)),
    ("vms", &vms::ROUTER),
]);

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);

/// Convert a service error into the matching HTTP error.
///
/// Only this layer maps error kinds to status codes; the services stay
/// status-code free.
pub fn http_error(err: Error) -> Error {
    match err.downcast::<LabError>() {
        Ok(lab_error) => {
            let code = lab_error.status_code();
            proxmox_router::HttpError::new(code, lab_error.to_string()).into()
        }
        Err(err) => err,
    }
}

#[api(
    access: {
        description: "Anyone can access this, just a cheap check if the API daemon is online.",
        permission: &Permission::World,
    }
)]
/// A simple ping method. returns "pong"
fn ping() -> Result<String, Error> {
    Ok("pong".to_string())
}

#[api(
    access: {
        description: "Any valid user can access this.",
        permission: &Permission::Anybody,
    }
)]
/// Return the program's version/release info
fn version() -> Result<Value, Error> {
    Ok(json!({
        "version": plm_buildcfg::PROXMOX_PKG_VERSION,
        "release": plm_buildcfg::PROXMOX_PKG_RELEASE,
    }))
}
