//! A fake cluster client for sync and deployment tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use proxmox_client::Error;

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::pve::{
    AgentInterfacesResult, ClusterResource, GroupInfo, GuestConfig, GuestEntry, GuestStatus,
    LxcInterface, NodeIndexEntry, PveUserEntry, SnapshotEntry, StorageContentEntry, StorageEntry,
    TaskStatus, VersionResponse, VncProxyResponse,
};
use plm_api_types::GuestKind;

use crate::connection::{ClientFactory, PveClient};
use crate::pve_client::PveApi;

/// One simulated guest.
#[derive(Clone, Debug)]
pub struct FakeGuest {
    pub vmid: u32,
    pub name: String,
    pub node: String,
    pub status: String,
    pub kind: GuestKind,
    pub template: bool,
}

/// Mutable cluster state shared between a test and its fake clients.
#[derive(Default)]
pub struct FakeClusterState {
    pub nodes: Vec<String>,
    pub guests: Vec<FakeGuest>,
    /// Snapshots created through the fake, keyed by vmid.
    pub snapshots: HashMap<u32, Vec<String>>,
    /// Whether the cluster-resources endpoint fails (forces the per-node
    /// fallback path).
    pub fail_cluster_resources: bool,
}

impl FakeClusterState {
    pub fn new(nodes: &[&str]) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }))
    }
}

fn unsupported<T>(what: &'static str) -> Result<T, Error> {
    Err(Error::Other(what))
}

/// Fake [`PveApi`] implementation over shared [`FakeClusterState`].
pub struct FakePveApi {
    pub state: Arc<Mutex<FakeClusterState>>,
}

#[async_trait]
impl PveApi for FakePveApi {
    async fn version(&self) -> Result<VersionResponse, Error> {
        Ok(VersionResponse {
            version: "8.2".to_string(),
            release: "8.2-1".to_string(),
            repoid: "0".to_string(),
        })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeIndexEntry>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .map(|node| NodeIndexEntry {
                node: node.clone(),
                status: "online".to_string(),
                ..Default::default()
            })
            .collect())
    }

    async fn cluster_resources(&self, _ty: Option<&str>) -> Result<Vec<ClusterResource>, Error> {
        let state = self.state.lock().unwrap();
        if state.fail_cluster_resources {
            return Err(Error::Other("cluster resources unavailable"));
        }
        Ok(state
            .guests
            .iter()
            .map(|guest| ClusterResource {
                id: format!("{}/{}", kind_str(guest.kind), guest.vmid),
                ty: kind_str(guest.kind).to_string(),
                vmid: Some(guest.vmid),
                name: Some(guest.name.clone()),
                node: Some(guest.node.clone()),
                status: Some(guest.status.clone()),
                template: guest.template,
                maxmem: Some(2 * 1024 * 1024 * 1024),
                maxcpu: Some(2),
                ..Default::default()
            })
            .collect())
    }

    async fn list_qemu(&self, node: &str) -> Result<Vec<GuestEntry>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .guests
            .iter()
            .filter(|g| g.kind == GuestKind::Qemu && g.node == node)
            .map(|g| GuestEntry {
                vmid: g.vmid,
                name: Some(g.name.clone()),
                status: g.status.clone(),
                template: g.template,
                ..Default::default()
            })
            .collect())
    }

    async fn list_lxc(&self, node: &str) -> Result<Vec<GuestEntry>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .guests
            .iter()
            .filter(|g| g.kind == GuestKind::Lxc && g.node == node)
            .map(|g| GuestEntry {
                vmid: g.vmid,
                name: Some(g.name.clone()),
                status: g.status.clone(),
                template: g.template,
                ..Default::default()
            })
            .collect())
    }

    async fn guest_config(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
    ) -> Result<GuestConfig, Error> {
        let state = self.state.lock().unwrap();
        match state.guests.iter().find(|g| g.vmid == vmid) {
            Some(guest) => {
                let raw = serde_json::json!({
                    "name": guest.name,
                    "cores": 2,
                    "memory": 2048,
                });
                Ok(serde_json::from_value(raw).unwrap())
            }
            None => unsupported("no such guest"),
        }
    }

    async fn guest_status(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
    ) -> Result<GuestStatus, Error> {
        let state = self.state.lock().unwrap();
        match state.guests.iter().find(|g| g.vmid == vmid) {
            Some(guest) => Ok(GuestStatus {
                status: guest.status.clone(),
                ..Default::default()
            }),
            None => unsupported("no such guest"),
        }
    }

    async fn start_guest(&self, _node: &str, _kind: GuestKind, vmid: u32) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(guest) = state.guests.iter_mut().find(|g| g.vmid == vmid) {
            guest.status = "running".to_string();
        }
        Ok(format!("UPID:fake:start:{vmid}"))
    }

    async fn shutdown_guest(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(guest) = state.guests.iter_mut().find(|g| g.vmid == vmid) {
            guest.status = "stopped".to_string();
        }
        Ok(format!("UPID:fake:shutdown:{vmid}"))
    }

    async fn stop_guest(&self, _node: &str, _kind: GuestKind, vmid: u32) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(guest) = state.guests.iter_mut().find(|g| g.vmid == vmid) {
            guest.status = "stopped".to_string();
        }
        Ok(format!("UPID:fake:stop:{vmid}"))
    }

    async fn set_guest_options(
        &self,
        _node: &str,
        _kind: GuestKind,
        _vmid: u32,
        _options: serde_json::Value,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn destroy_guest(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.guests.retain(|g| g.vmid != vmid);
        Ok(format!("UPID:fake:destroy:{vmid}"))
    }

    async fn create_qemu(&self, node: &str, options: serde_json::Value) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        let vmid = options["vmid"].as_u64().unwrap_or(0) as u32;
        state.guests.push(FakeGuest {
            vmid,
            name: options["name"].as_str().unwrap_or("").to_string(),
            node: node.to_string(),
            status: "stopped".to_string(),
            kind: GuestKind::Qemu,
            template: false,
        });
        Ok(format!("UPID:fake:create:{vmid}"))
    }

    async fn clone_qemu(
        &self,
        _node: &str,
        _vmid: u32,
        newid: u32,
        name: &str,
        target: Option<&str>,
        _storage: Option<&str>,
        _full: bool,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        let node = target
            .map(str::to_string)
            .or_else(|| state.nodes.first().cloned())
            .unwrap_or_default();
        state.guests.push(FakeGuest {
            vmid: newid,
            name: name.to_string(),
            node,
            status: "stopped".to_string(),
            kind: GuestKind::Qemu,
            template: false,
        });
        Ok(format!("UPID:fake:clone:{newid}"))
    }

    async fn convert_to_template(&self, _node: &str, vmid: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(guest) = state.guests.iter_mut().find(|g| g.vmid == vmid) {
            guest.template = true;
        }
        Ok(())
    }

    async fn list_snapshots(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
    ) -> Result<Vec<SnapshotEntry>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .get(&vmid)
            .map(|names| {
                names
                    .iter()
                    .map(|name| SnapshotEntry {
                        name: name.clone(),
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_snapshot(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
        name: &str,
        _description: Option<&str>,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state
            .snapshots
            .entry(vmid)
            .or_default()
            .push(name.to_string());
        Ok(format!("UPID:fake:snapshot:{vmid}"))
    }

    async fn rollback_snapshot(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
        name: &str,
    ) -> Result<String, Error> {
        let state = self.state.lock().unwrap();
        match state.snapshots.get(&vmid) {
            Some(names) if names.iter().any(|n| n == name) => {
                Ok(format!("UPID:fake:rollback:{vmid}"))
            }
            _ => unsupported("no such snapshot"),
        }
    }

    async fn delete_snapshot(
        &self,
        _node: &str,
        _kind: GuestKind,
        vmid: u32,
        name: &str,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(names) = state.snapshots.get_mut(&vmid) {
            names.retain(|n| n != name);
        }
        Ok(format!("UPID:fake:delsnapshot:{vmid}"))
    }

    async fn vncproxy(
        &self,
        _node: &str,
        _kind: GuestKind,
        _vmid: u32,
    ) -> Result<VncProxyResponse, Error> {
        Ok(VncProxyResponse {
            ticket: "PVEVNC:fake".to_string(),
            port: 5900,
            user: None,
            cert: None,
        })
    }

    async fn agent_network_interfaces(
        &self,
        _node: &str,
        _vmid: u32,
    ) -> Result<AgentInterfacesResult, Error> {
        Ok(AgentInterfacesResult::default())
    }

    async fn lxc_interfaces(&self, _node: &str, _vmid: u32) -> Result<Vec<LxcInterface>, Error> {
        Ok(Vec::new())
    }

    async fn list_storages(&self, _node: &str) -> Result<Vec<StorageEntry>, Error> {
        Ok(Vec::new())
    }

    async fn storage_content(
        &self,
        _node: &str,
        _storage: &str,
        _content: Option<&str>,
    ) -> Result<Vec<StorageContentEntry>, Error> {
        Ok(Vec::new())
    }

    async fn group_info(&self, _group: &str) -> Result<GroupInfo, Error> {
        Ok(GroupInfo::default())
    }

    async fn list_users(&self) -> Result<Vec<PveUserEntry>, Error> {
        Ok(Vec::new())
    }

    async fn task_status(&self, _node: &str, upid: &str) -> Result<TaskStatus, Error> {
        Ok(TaskStatus {
            upid: upid.to_string(),
            status: "stopped".to_string(),
            exitstatus: Some("OK".to_string()),
        })
    }
}

fn kind_str(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Qemu => "qemu",
        GuestKind::Lxc => "lxc",
    }
}

/// Client factory wired to one shared fake state, regardless of cluster.
pub struct FakeClientFactory {
    pub state: Arc<Mutex<FakeClusterState>>,
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn make_client(&self, _cluster: &ClusterConfig) -> Result<Arc<PveClient>, anyhow::Error> {
        Ok(Arc::new(FakePveApi {
            state: Arc::clone(&self.state),
        }))
    }

    async fn make_client_uncached(
        &self,
        cluster: &ClusterConfig,
    ) -> Result<Arc<PveClient>, anyhow::Error> {
        self.make_client(cluster).await
    }

    async fn make_raw_client(
        &self,
        _cluster: &ClusterConfig,
    ) -> Result<Arc<proxmox_client::Client>, anyhow::Error> {
        anyhow::bail!("raw client not supported by the fake factory")
    }

    fn invalidate(&self, _cluster_id: &str) {}

    fn invalidate_all(&self) {}
}
