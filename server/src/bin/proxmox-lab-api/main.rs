use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context as _, Error};
use futures::*;
use http::request::Parts;
use http::Response;
use hyper::header;
use hyper::StatusCode;
use hyper_util::server::graceful::GracefulShutdown;
use openssl::ssl::SslAcceptor;
use serde_json::{json, Value};
use tracing::level_filters::LevelFilter;

use proxmox_lang::try_block;
use proxmox_rest_server::{ApiConfig, RestEnvironment, RestServer};
use proxmox_router::{RpcEnvironment, RpcEnvironmentType};
use proxmox_sys::fs::CreateOptions;

use plm_buildcfg::configdir;

use server::auth;
use server::db;
use server::sync;

mod tasks;

const PLM_LISTEN_ADDR: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0)),
    plm_buildcfg::PLM_PORT,
);

fn main() -> Result<(), Error> {
    server::env::sanitize_environment_vars();

    let debug = std::env::var("PLM_DEBUG").is_ok();

    proxmox_log::Logger::from_env("PLM_DEBUG", LevelFilter::INFO)
        .journald_on_no_workertask()
        .tasklog_pbs()
        .init()?;

    if std::env::args().nth(1).is_some() {
        bail!("unexpected command line parameters");
    }

    let api_uid = plm_config::api_user()?.uid;
    let api_gid = plm_config::api_group()?.gid;
    let running_uid = nix::unistd::Uid::effective();
    let running_gid = nix::unistd::Gid::effective();

    if running_uid != api_uid || running_gid != api_gid {
        bail!("api not running as api user or group (got uid {running_uid} gid {running_gid})");
    }

    proxmox_product_config::init(plm_config::api_user()?, plm_config::api_user()?);

    proxmox_async::runtime::main(run(debug))
}

async fn get_index_future(env: RestEnvironment, _parts: Parts) -> Response<proxmox_http::Body> {
    // no web UI is shipped with the API daemon; answer with basic info so
    // health checks and humans get something useful
    let data = json!({
        "nodename": proxmox_sys::nodename(),
        "product": "proxmox-lab-manager",
        "version": plm_buildcfg::PROXMOX_PKG_VERSION,
        "user": env.get_auth_id(),
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(data.to_string().into())
        .unwrap()
}

async fn run(debug: bool) -> Result<(), Error> {
    auth::setup_keys()?;
    auth::init(true);

    server::context::init()?;

    let api_user = plm_config::api_user()?;
    let mut command_sock = proxmox_daemon::command_socket::CommandSocket::new(api_user.gid);

    let dir_opts = CreateOptions::new().owner(api_user.uid).group(api_user.gid);
    let file_opts = CreateOptions::new().owner(api_user.uid).group(api_user.gid);

    let config = ApiConfig::new(plm_buildcfg::SHARE_DIR, RpcEnvironmentType::PUBLIC)
        .index_handler_func(|e, p| Box::pin(get_index_future(e, p)))
        .auth_handler_func(|h, m| Box::pin(auth::check_auth(h, m)))
        .formatted_router(&["api2"], &server::api::ROUTER)
        .enable_access_log(
            plm_buildcfg::API_ACCESS_LOG_FN,
            Some(dir_opts),
            Some(file_opts),
            &mut command_sock,
        )?
        .enable_auth_log(
            plm_buildcfg::API_AUTH_LOG_FN,
            Some(dir_opts),
            Some(file_opts),
            &mut command_sock,
        )?;

    let rest_server = RestServer::new(config);
    proxmox_rest_server::init_worker_tasks(plm_buildcfg::PLM_LOG_DIR_M!().into(), file_opts)?;

    // we build the initial acceptor here as we cannot start if this fails
    let acceptor = make_tls_acceptor()?;
    let acceptor = Arc::new(Mutex::new(acceptor));

    // to renew the acceptor we just add a command-socket handler
    command_sock.register_command("reload-certificate".to_string(), {
        let acceptor = Arc::clone(&acceptor);
        move |_value| -> Result<_, Error> {
            log::info!("reloading certificate");
            match make_tls_acceptor() {
                Err(err) => log::error!("error reloading certificate: {err}"),
                Ok(new_acceptor) => {
                    let mut guard = acceptor.lock().unwrap();
                    *guard = new_acceptor;
                }
            }
            Ok(Value::Null)
        }
    })?;

    let connections = proxmox_rest_server::connection::AcceptBuilder::new().debug(debug);
    let server = proxmox_daemon::server::create_daemon(
        PLM_LISTEN_ADDR,
        move |listener| {
            let mut connections = connections.accept_tls(listener, acceptor);

            Ok(async {
                log::info!("service ready and listening at {PLM_LISTEN_ADDR}");
                proxmox_systemd::notify::SystemdNotify::Ready.notify()?;

                let graceful = GracefulShutdown::new();
                loop {
                    tokio::select! {
                        Some(conn) = connections.next() => {
                            match conn {
                                Ok(conn) => {
                                    let api_service = rest_server.api_service(&conn)?;
                                    let watcher = graceful.watcher();
                                    tokio::spawn(async move {
                                        api_service.serve(conn, Some(watcher)).await
                                    });
                                },
                                Err(err) => { log::warn!("failed to accept connection: {err:?}"); }
                            }
                        },
                        _shutdown = proxmox_daemon::shutdown_future() => {
                            break;
                        }
                    }
                }
                graceful.shutdown().await;
                Ok::<(), Error>(())
            })
        },
        Some(plm_buildcfg::PLM_API_PID_FN),
    );

    proxmox_rest_server::write_pid(plm_buildcfg::PLM_API_PID_FN)?;

    let init_result: Result<(), Error> = try_block!({
        proxmox_rest_server::register_task_control_commands(&mut command_sock)?;
        command_sock.spawn(proxmox_rest_server::last_worker_future())?;
        proxmox_daemon::catch_shutdown_signal(proxmox_rest_server::last_worker_future())?;
        proxmox_daemon::catch_reload_signal(proxmox_rest_server::last_worker_future())?;
        Ok(())
    });

    if let Err(err) = init_result {
        bail!("unable to start daemon - {err}");
    }

    // stop gap for https://github.com/tokio-rs/tokio/issues/4730 where the
    // thread holding the IO-driver may block progress completely if it
    // starts polling its own tasks (blocks).
    let rt_handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || loop {
        rt_handle.spawn(std::future::ready(()));
        std::thread::sleep(Duration::from_secs(3));
    });

    // background daemons get their context explicitly at spawn time
    let database = db::get().clone();
    sync::start_task(database.clone());
    tasks::ip_scan::start_task(database.clone());
    tasks::auto_shutdown::start_task(database.clone());
    tasks::hostname_rename::start_task(database);

    server.await.context("failed to complete REST server task")?;
    log::info!("server shutting down, waiting for active workers to complete");
    proxmox_rest_server::last_worker_future().await;
    log::info!("done - exit server");

    Ok(())
}

fn make_tls_acceptor() -> Result<SslAcceptor, Error> {
    let key_path = configdir!("/auth/api.key");
    let cert_path = configdir!("/auth/api.pem");

    proxmox_rest_server::connection::TlsAcceptorBuilder::new()
        .certificate_paths_pem(key_path, cert_path)
        .build()
}
