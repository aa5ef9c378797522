//! Sync engine status and manual trigger.

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use plm_api_types::UserRole;

use crate::auth;
use crate::sync;

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_SYNC_STATS)
    .post(&API_METHOD_TRIGGER_SYNC);

#[api(
    returns: {
        type: Object,
        description: "Counters of the sync engine.",
        properties: {},
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Current sync statistics.
pub fn sync_stats(rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;

    Ok(json!(sync::stats()))
}

#[api(
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Trigger one immediate full sync.
///
/// Triggers arriving while a sync runs are absorbed.
pub fn trigger_sync(rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;

    sync::trigger_immediate_sync();
    Ok(())
}
