//! ISO image listing.

use anyhow::Error;

use proxmox_router::{Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use plm_api_types::{IsoImage, UserRole};

use crate::auth;
use crate::db;

use super::http_error;

pub const ROUTER: Router = Router::new().get(&API_METHOD_LIST_ISOS);

#[api(
    returns: {
        type: Array,
        description: "ISO images discovered on the clusters.",
        items: { type: IsoImage },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// List ISO images from the synchronized cache.
pub fn list_isos(rpcenv: &mut dyn RpcEnvironment) -> Result<Vec<IsoImage>, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;

    db::get().list_isos().map_err(http_error)
}
