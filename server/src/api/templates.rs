//! Template listing.

use anyhow::Error;

use proxmox_router::{Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use plm_api_types::{TemplateEntry, UserRole};

use crate::auth;
use crate::db;

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_TEMPLATES)
    .match_all("template-id", &ITEM_ROUTER);

const ITEM_ROUTER: Router = Router::new().get(&API_METHOD_GET_TEMPLATE);

#[api(
    returns: {
        type: Array,
        description: "Known templates with cached specs.",
        items: { type: TemplateEntry },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// List templates from the synchronized cache.
pub fn list_templates(rpcenv: &mut dyn RpcEnvironment) -> Result<Vec<TemplateEntry>, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;

    db::get().list_templates().map_err(http_error)
}

#[api(
    input: {
        properties: {
            "template-id": {
                description: "Database ID of the template.",
                type: Integer,
            },
        },
    },
    returns: { type: TemplateEntry },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// A single template entry.
pub fn get_template(
    template_id: i64,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<TemplateEntry, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;

    db::get().get_template(template_id).map_err(http_error)
}
