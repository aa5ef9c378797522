//! Create API clients for clusters
//!
//! Make sure to call [`init`] to inject a concrete [`ClientFactory`]
//! instance before calling any of the provided functions.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use http::Uri;

use proxmox_client::{Client, TlsOptions};

use plm_api_types::clusters::ClusterConfig;

use crate::error::LabError;
use crate::pve_client::{PveApi, PveHttpClient};

static INSTANCE: OnceLock<Box<dyn ClientFactory + Send + Sync>> = OnceLock::new();

pub type PveClient = dyn PveApi + Send + Sync;

/// Build an unauthenticated client for the cluster's entry point.
fn prepare_connect_client(cluster: &ClusterConfig) -> Result<Client, Error> {
    let options = if cluster.verify_tls {
        TlsOptions::default()
    } else {
        // lab clusters typically run with self-signed certificates
        TlsOptions::Insecure
    };

    let uri: Uri = cluster
        .api_url()
        .parse()
        .map_err(|err| format_err!("bad cluster address {:?} - {err}", cluster.host))?;

    let client = Client::with_options(uri, options, Default::default())?;
    Ok(client)
}

/// Create a client and perform the password login, yielding an
/// authenticated connection with ticket cookie and CSRF token set.
async fn connect_and_login(cluster: &ClusterConfig) -> Result<Client, Error> {
    let client = prepare_connect_client(cluster)?;

    match client
        .login(proxmox_login::Login::new(
            client.api_url().to_string(),
            cluster.user.clone(),
            cluster.password.clone(),
        ))
        .await
    {
        Ok(Some(_)) => bail!("two factor auth not supported"),
        Ok(None) => {}
        Err(err) => match err {
            proxmox_client::Error::Api(code, _) if code.as_u16() == 401 => {
                bail!("authentication failed for cluster '{}'", cluster.id)
            }
            proxmox_client::Error::Authentication(_) => {
                bail!("authentication failed for cluster '{}'", cluster.id)
            }
            _ => {
                return Err(LabError::ClusterUnreachable(format!(
                    "cluster '{}': {err}",
                    cluster.id
                ))
                .into())
            }
        },
    }

    Ok(client)
}

/// Abstract factory for creating cluster clients.
#[async_trait]
pub trait ClientFactory {
    /// Create an authenticated API client for a cluster.
    async fn make_client(&self, cluster: &ClusterConfig) -> Result<Arc<PveClient>, Error>;

    /// Create a fresh, uncached client for worker-local use.
    ///
    /// Parallel scans must not share the registry's cached client; each
    /// worker gets its own short-lived connection.
    async fn make_client_uncached(&self, cluster: &ClusterConfig) -> Result<Arc<PveClient>, Error>;

    /// Create an authenticated raw client, used where the HTTP connection
    /// itself is needed (websocket upgrades).
    async fn make_raw_client(&self, cluster: &ClusterConfig) -> Result<Arc<Client>, Error>;

    /// Drop the cached client of a cluster.
    fn invalidate(&self, cluster_id: &str);

    /// Drop all cached clients.
    fn invalidate_all(&self);
}

/// A cached client for a cluster. The config is kept alongside so a changed
/// entry replaces the connection instead of reusing it.
struct ClientEntry {
    client: Arc<PveClient>,
    cluster: ClusterConfig,
}

/// Default production client factory, caching one client per cluster.
#[derive(Default)]
pub struct DefaultClientFactory {
    clients: StdMutex<HashMap<String, ClientEntry>>,
}

impl DefaultClientFactory {
    fn cached_client(&self, cluster: &ClusterConfig) -> Option<Arc<PveClient>> {
        let clients = self.clients.lock().unwrap();
        match clients.get(&cluster.id) {
            Some(entry) if entry.cluster == *cluster => Some(Arc::clone(&entry.client)),
            _ => None,
        }
    }
}

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn make_client(&self, cluster: &ClusterConfig) -> Result<Arc<PveClient>, Error> {
        if let Some(client) = self.cached_client(cluster) {
            return Ok(client);
        }

        let client: Arc<PveClient> = Arc::new(PveHttpClient(connect_and_login(cluster).await?));

        // double-checked: another task may have connected meanwhile
        let mut clients = self.clients.lock().unwrap();
        if let Some(entry) = clients.get(&cluster.id) {
            if entry.cluster == *cluster {
                return Ok(Arc::clone(&entry.client));
            }
        }
        clients.insert(
            cluster.id.clone(),
            ClientEntry {
                client: Arc::clone(&client),
                cluster: cluster.clone(),
            },
        );
        Ok(client)
    }

    async fn make_client_uncached(&self, cluster: &ClusterConfig) -> Result<Arc<PveClient>, Error> {
        Ok(Arc::new(PveHttpClient(connect_and_login(cluster).await?)))
    }

    async fn make_raw_client(&self, cluster: &ClusterConfig) -> Result<Arc<Client>, Error> {
        Ok(Arc::new(connect_and_login(cluster).await?))
    }

    fn invalidate(&self, cluster_id: &str) {
        self.clients.lock().unwrap().remove(cluster_id);
    }

    fn invalidate_all(&self) {
        self.clients.lock().unwrap().clear();
    }
}

fn instance() -> &'static (dyn ClientFactory + Send + Sync) {
    // Not initializing the connection factory instance is
    // entirely in our responsibility and not something we can recover from,
    // so it should be okay to panic in this case.
    INSTANCE
        .get()
        .expect("client factory instance not set")
        .as_ref()
}

/// Create an authenticated API client for the given cluster.
pub async fn make_pve_client(cluster: &ClusterConfig) -> Result<Arc<PveClient>, Error> {
    instance().make_client(cluster).await
}

/// Create an authenticated API client for the cluster with the given id.
pub async fn make_pve_client_for(cluster_id: &str) -> Result<Arc<PveClient>, Error> {
    let cluster = plm_config::clusters::get_cluster(cluster_id)
        .map_err(|_| LabError::NotFound(format!("no such cluster '{cluster_id}'")))?;
    instance().make_client(&cluster).await
}

/// Create a fresh, uncached client for worker-local use.
pub async fn make_pve_client_uncached(cluster: &ClusterConfig) -> Result<Arc<PveClient>, Error> {
    instance().make_client_uncached(cluster).await
}

/// Create an authenticated raw client (for websocket upgrades).
pub async fn make_raw_client(cluster: &ClusterConfig) -> Result<Arc<Client>, Error> {
    instance().make_raw_client(cluster).await
}

/// Drop the cached client of a cluster, e.g. after a config change.
pub fn invalidate_client(cluster_id: &str) {
    instance().invalidate(cluster_id)
}

/// Drop all cached clients.
pub fn invalidate_all_clients() {
    instance().invalidate_all()
}

/// Initialize the [`ClientFactory`] instance.
///
/// Will panic if the instance has already been set.
pub fn init(instance: Box<dyn ClientFactory + Send + Sync>) {
    if INSTANCE.set(instance).is_err() {
        panic!("connection factory instance already set");
    }
}
