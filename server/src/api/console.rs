//! VNC console tunnel.
//!
//! Two phases: a POST mints a path-restricted console ticket for the
//! caller; the websocket upgrade verifies that ticket, asks the cluster for
//! a VNC ticket (`vncproxy`, websocket mode) and then proxies binary frames
//! between the client and the cluster's `vncwebsocket` endpoint until either
//! side closes.

use anyhow::{bail, format_err, Error};
use futures::{FutureExt, TryFutureExt};
use http::{
    header::{SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE},
    request::Parts,
    Method, Request, StatusCode,
};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};

use proxmox_auth_api::{
    ticket::{Empty, Ticket},
    Keyring,
};
use proxmox_http::{websocket::WebSocket, Body};
use proxmox_router::{
    ApiHandler, ApiMethod, ApiResponseFuture, Permission, Router, RpcEnvironment,
};
use proxmox_schema::{api, IntegerSchema, ObjectSchema, StringSchema};
use proxmox_sortable_macro::sortable;

use plm_api_types::VMID_SCHEMA;

use crate::auth;
use crate::connection;
use crate::db;

use super::http_error;

pub const TICKET_ROUTER: Router = Router::new().post(&API_METHOD_CONSOLE_TICKET);

pub const WEBSOCKET_ROUTER: Router = Router::new().upgrade(&API_METHOD_VNC_WEBSOCKET);

fn encode_console_ticket_path(vmid: u32) -> String {
    format!("/console/{vmid}")
}

pub fn required_string_param<'a>(param: &'a Value, name: &str) -> Result<&'a str, Error> {
    match param[name].as_str() {
        Some(s) => Ok(s),
        None => bail!("missing parameter '{}'", name),
    }
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    returns: {
        type: Object,
        description: "Object with the user and console ticket",
        properties: {
            user: {
                description: "User that obtained the console ticket.",
                type: String,
            },
            ticket: {
                description: "Ticket used to authenticate the websocket upgrade.",
                type: String,
            },
            port: {
                description: "Always '0'.",
                type: Integer,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// Mint a console ticket for a VM.
pub fn console_ticket(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    super::vms::check_console_access(db::get(), &user, vmid).map_err(http_error)?;

    let path = encode_console_ticket_path(vmid);
    let private_auth_keyring = Keyring::with_private_key(auth::key::private_auth_key().clone());

    let ticket = Ticket::new(auth::TERM_PREFIX, &Empty)?.sign(
        &private_auth_keyring,
        Some(&format!("{}{}", user.username, path)),
    )?;

    Ok(json!({
        "user": user.username,
        "ticket": ticket,
        "port": 0,
    }))
}

#[sortable]
pub const API_METHOD_VNC_WEBSOCKET: ApiMethod = ApiMethod::new(
    &ApiHandler::AsyncHttp(&upgrade_to_websocket),
    &ObjectSchema::new(
        "Upgraded to websocket",
        &sorted!([
            ("vmid", false, &VMID_SCHEMA),
            (
                "vncticket",
                false,
                &StringSchema::new("Console ticket").schema()
            ),
            ("port", true, &IntegerSchema::new("Ignored").schema()),
        ]),
    ),
)
.access(
    Some("The caller needs access to the VM; verified via the console ticket."),
    &Permission::Anybody,
);

fn upgrade_to_websocket(
    parts: Parts,
    req_body: hyper::body::Incoming,
    param: Value,
    _info: &ApiMethod,
    rpcenv: Box<dyn RpcEnvironment>,
) -> ApiResponseFuture {
    async move {
        let username = rpcenv
            .get_auth_id()
            .ok_or_else(|| format_err!("no authid available"))?;

        let vmid = param["vmid"]
            .as_u64()
            .or_else(|| param["vmid"].as_str().and_then(|v| v.parse().ok()))
            .ok_or_else(|| format_err!("missing parameter 'vmid'"))? as u32;
        let ticket = required_string_param(&param, "vncticket")?;

        let public_auth_keyring = Keyring::with_public_key(auth::key::public_auth_key().clone());
        Ticket::<Empty>::parse(ticket)?.verify(
            &public_auth_keyring,
            auth::TERM_PREFIX,
            Some(&format!("{}{}", username, encode_console_ticket_path(vmid))),
        )?;

        let entry = db::get()
            .find_vm_any_cluster(vmid)?
            .ok_or_else(|| format_err!("no such VM {vmid}"))?;
        let cluster = plm_config::clusters::get_cluster(&entry.cluster_id)?;

        let (mut ws, response) = WebSocket::new(parts.headers.clone())?;

        proxmox_rest_server::spawn_internal_task(async move {
            let incoming_ws: Upgraded =
                match hyper::upgrade::on(Request::from_parts(parts, req_body))
                    .map_err(Error::from)
                    .await
                {
                    Ok(upgraded) => upgraded,
                    _ => bail!("websocket upgrade failed"),
                };

            // phase 1: mint a VNC ticket on the cluster
            let client = connection::make_pve_client(&cluster).await?;
            let vnc = client.vncproxy(&entry.node, entry.kind, vmid).await?;

            // phase 2: open the websocket towards the cluster node
            let raw_client = connection::make_raw_client(&cluster).await?;

            let ws_key = proxmox_sys::linux::random_data(16)?;
            let ws_key = proxmox_base64::encode(&ws_key);

            let api_url = raw_client.api_url().clone().into_parts();
            let mut builder = http::uri::Builder::new();
            if let Some(scheme) = api_url.scheme {
                builder = builder.scheme(scheme);
            }
            if let Some(authority) = api_url.authority {
                builder = builder.authority(authority);
            }

            let kind = match entry.kind {
                plm_api_types::GuestKind::Qemu => "qemu",
                plm_api_types::GuestKind::Lxc => "lxc",
            };
            let encoded_ticket =
                utf8_percent_encode(&vnc.ticket, NON_ALPHANUMERIC).to_string();
            let path = format!(
                "/api2/json/nodes/{}/{}/{}/vncwebsocket?port={}&vncticket={}",
                entry.node, kind, vmid, vnc.port, encoded_ticket
            );

            let uri = builder
                .path_and_query(path)
                .build()
                .map_err(|err| format_err!("failed to build Uri - {err}"))?;

            let auth = raw_client.login_auth()?;
            let req = Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header(UPGRADE, "websocket")
                .header(SEC_WEBSOCKET_VERSION, "13")
                .header(SEC_WEBSOCKET_KEY, ws_key);

            let req = auth.set_auth_headers(req).body(Body::empty())?;

            let res = raw_client.http_client().request(req).await?;
            if res.status() != StatusCode::SWITCHING_PROTOCOLS {
                bail!("cluster didn't upgrade: {}", res.status());
            }

            let cluster_ws = hyper::upgrade::on(res)
                .await
                .map_err(|err| format_err!("failed to upgrade - {}", err))?;

            // payloads are copied as-is in both directions, no framing
            // translation
            ws.mask = Some([0, 0, 0, 0]);

            if let Err(err) = ws
                .proxy_connection(TokioIo::new(incoming_ws), TokioIo::new(cluster_ws), &[])
                .await
            {
                log::warn!("error while proxying vnc websocket for VM {vmid}: {err:?}");
            }

            Ok(())
        });

        Ok(response)
    }
    .boxed()
}
