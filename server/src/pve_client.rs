//! Typed access to the subset of the Proxmox VE API used by PLM.
//!
//! The lab workflow needs endpoints (vncproxy, snapshots, storage content,
//! guest agent queries) beyond what generic client libraries cover, so the
//! request methods live here, built directly on [`proxmox_client::Client`].
//! Everything is reachable through the [`PveApi`] trait so the sync engine
//! and tests can substitute fakes.

use async_trait::async_trait;
use serde_json::json;

use proxmox_client::{Error, HttpApiClient};

use plm_api_types::pve::{
    AgentInterfacesResult, ClusterResource, GroupInfo, GuestConfig, GuestEntry, GuestStatus,
    LxcInterface, NodeIndexEntry, PveUserEntry, SnapshotEntry, StorageContentEntry, StorageEntry,
    TaskStatus, VersionResponse, VncProxyResponse,
};
use plm_api_types::GuestKind;

fn kind_path(kind: GuestKind) -> &'static str {
    match kind {
        GuestKind::Qemu => "qemu",
        GuestKind::Lxc => "lxc",
    }
}

/// The PVE API operations PLM depends on.
#[async_trait]
pub trait PveApi {
    async fn version(&self) -> Result<VersionResponse, Error>;

    async fn list_nodes(&self) -> Result<Vec<NodeIndexEntry>, Error>;

    /// `GET /cluster/resources?type=vm`
    async fn cluster_resources(&self, ty: Option<&str>) -> Result<Vec<ClusterResource>, Error>;

    async fn list_qemu(&self, node: &str) -> Result<Vec<GuestEntry>, Error>;

    async fn list_lxc(&self, node: &str) -> Result<Vec<GuestEntry>, Error>;

    async fn guest_config(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<GuestConfig, Error>;

    async fn guest_status(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<GuestStatus, Error>;

    async fn start_guest(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<String, Error>;

    async fn shutdown_guest(&self, node: &str, kind: GuestKind, vmid: u32)
        -> Result<String, Error>;

    async fn stop_guest(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<String, Error>;

    /// `PUT .../config` - apply a set of config options.
    async fn set_guest_options(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        options: serde_json::Value,
    ) -> Result<(), Error>;

    async fn destroy_guest(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<String, Error>;

    /// `POST /nodes/{node}/qemu` - create an empty VM shell.
    async fn create_qemu(&self, node: &str, options: serde_json::Value) -> Result<String, Error>;

    async fn clone_qemu(
        &self,
        node: &str,
        vmid: u32,
        newid: u32,
        name: &str,
        target: Option<&str>,
        storage: Option<&str>,
        full: bool,
    ) -> Result<String, Error>;

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<(), Error>;

    async fn list_snapshots(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Vec<SnapshotEntry>, Error>;

    async fn create_snapshot(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, Error>;

    async fn rollback_snapshot(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        name: &str,
    ) -> Result<String, Error>;

    async fn delete_snapshot(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        name: &str,
    ) -> Result<String, Error>;

    /// `POST .../vncproxy?websocket=1&generate-password=1`
    async fn vncproxy(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<VncProxyResponse, Error>;

    async fn agent_network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<AgentInterfacesResult, Error>;

    async fn lxc_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<LxcInterface>, Error>;

    async fn list_storages(&self, node: &str) -> Result<Vec<StorageEntry>, Error>;

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: Option<&str>,
    ) -> Result<Vec<StorageContentEntry>, Error>;

    async fn group_info(&self, group: &str) -> Result<GroupInfo, Error>;

    async fn list_users(&self) -> Result<Vec<PveUserEntry>, Error>;

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, Error>;
}

/// Production implementation over an authenticated [`proxmox_client::Client`].
pub struct PveHttpClient(pub proxmox_client::Client);

#[async_trait]
impl PveApi for PveHttpClient {
    async fn version(&self) -> Result<VersionResponse, Error> {
        let url = "/api2/extjs/version";
        Ok(self.0.get(url).await?.expect_json()?.data)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeIndexEntry>, Error> {
        let url = "/api2/extjs/nodes";
        Ok(self.0.get(url).await?.expect_json()?.data)
    }

    async fn cluster_resources(&self, ty: Option<&str>) -> Result<Vec<ClusterResource>, Error> {
        let url = match ty {
            Some(ty) => format!("/api2/extjs/cluster/resources?type={ty}"),
            None => "/api2/extjs/cluster/resources".to_string(),
        };
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn list_qemu(&self, node: &str) -> Result<Vec<GuestEntry>, Error> {
        let url = format!("/api2/extjs/nodes/{node}/qemu");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn list_lxc(&self, node: &str) -> Result<Vec<GuestEntry>, Error> {
        let url = format!("/api2/extjs/nodes/{node}/lxc");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn guest_config(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<GuestConfig, Error> {
        let url = format!("/api2/extjs/nodes/{node}/{}/{vmid}/config", kind_path(kind));
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn guest_status(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<GuestStatus, Error> {
        let url = format!(
            "/api2/extjs/nodes/{node}/{}/{vmid}/status/current",
            kind_path(kind)
        );
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn start_guest(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<String, Error> {
        let url = format!(
            "/api2/extjs/nodes/{node}/{}/{vmid}/status/start",
            kind_path(kind)
        );
        Ok(self.0.post(&url, &json!({})).await?.expect_json()?.data)
    }

    async fn shutdown_guest(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<String, Error> {
        let url = format!(
            "/api2/extjs/nodes/{node}/{}/{vmid}/status/shutdown",
            kind_path(kind)
        );
        Ok(self.0.post(&url, &json!({})).await?.expect_json()?.data)
    }

    async fn stop_guest(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<String, Error> {
        let url = format!(
            "/api2/extjs/nodes/{node}/{}/{vmid}/status/stop",
            kind_path(kind)
        );
        Ok(self.0.post(&url, &json!({})).await?.expect_json()?.data)
    }

    async fn set_guest_options(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        options: serde_json::Value,
    ) -> Result<(), Error> {
        let url = format!("/api2/extjs/nodes/{node}/{}/{vmid}/config", kind_path(kind));
        self.0.put(&url, &options).await?.nodata()?;
        Ok(())
    }

    async fn destroy_guest(&self, node: &str, kind: GuestKind, vmid: u32) -> Result<String, Error> {
        let url = format!("/api2/extjs/nodes/{node}/{}/{vmid}", kind_path(kind));
        Ok(self.0.delete(&url).await?.expect_json()?.data)
    }

    async fn create_qemu(&self, node: &str, options: serde_json::Value) -> Result<String, Error> {
        let url = format!("/api2/extjs/nodes/{node}/qemu");
        Ok(self.0.post(&url, &options).await?.expect_json()?.data)
    }

    async fn clone_qemu(
        &self,
        node: &str,
        vmid: u32,
        newid: u32,
        name: &str,
        target: Option<&str>,
        storage: Option<&str>,
        full: bool,
    ) -> Result<String, Error> {
        let url = format!("/api2/extjs/nodes/{node}/qemu/{vmid}/clone");
        let mut params = json!({
            "newid": newid,
            "name": name,
        });
        if full {
            params["full"] = json!(1);
        }
        if let Some(target) = target {
            params["target"] = json!(target);
        }
        if let Some(storage) = storage {
            params["storage"] = json!(storage);
        }
        Ok(self.0.post(&url, &params).await?.expect_json()?.data)
    }

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<(), Error> {
        let url = format!("/api2/extjs/nodes/{node}/qemu/{vmid}/template");
        self.0.post(&url, &json!({})).await?.nodata()?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<Vec<SnapshotEntry>, Error> {
        let url = format!("/api2/extjs/nodes/{node}/{}/{vmid}/snapshot", kind_path(kind));
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn create_snapshot(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, Error> {
        let url = format!("/api2/extjs/nodes/{node}/{}/{vmid}/snapshot", kind_path(kind));
        let mut params = json!({ "snapname": name });
        if let Some(description) = description {
            params["description"] = json!(description);
        }
        Ok(self.0.post(&url, &params).await?.expect_json()?.data)
    }

    async fn rollback_snapshot(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        name: &str,
    ) -> Result<String, Error> {
        let url = format!(
            "/api2/extjs/nodes/{node}/{}/{vmid}/snapshot/{name}/rollback",
            kind_path(kind)
        );
        Ok(self.0.post(&url, &json!({})).await?.expect_json()?.data)
    }

    async fn delete_snapshot(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
        name: &str,
    ) -> Result<String, Error> {
        let url = format!(
            "/api2/extjs/nodes/{node}/{}/{vmid}/snapshot/{name}",
            kind_path(kind)
        );
        Ok(self.0.delete(&url).await?.expect_json()?.data)
    }

    async fn vncproxy(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u32,
    ) -> Result<VncProxyResponse, Error> {
        let url = format!("/api2/extjs/nodes/{node}/{}/{vmid}/vncproxy", kind_path(kind));
        let params = json!({
            "websocket": 1,
            "generate-password": 1,
        });
        Ok(self.0.post(&url, &params).await?.expect_json()?.data)
    }

    async fn agent_network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<AgentInterfacesResult, Error> {
        let url = format!("/api2/extjs/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn lxc_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<LxcInterface>, Error> {
        let url = format!("/api2/extjs/nodes/{node}/lxc/{vmid}/interfaces");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn list_storages(&self, node: &str) -> Result<Vec<StorageEntry>, Error> {
        let url = format!("/api2/extjs/nodes/{node}/storage");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: Option<&str>,
    ) -> Result<Vec<StorageContentEntry>, Error> {
        let url = match content {
            Some(content) => {
                format!("/api2/extjs/nodes/{node}/storage/{storage}/content?content={content}")
            }
            None => format!("/api2/extjs/nodes/{node}/storage/{storage}/content"),
        };
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn group_info(&self, group: &str) -> Result<GroupInfo, Error> {
        let url = format!("/api2/extjs/access/groups/{group}");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }

    async fn list_users(&self) -> Result<Vec<PveUserEntry>, Error> {
        let url = "/api2/extjs/access/users";
        Ok(self.0.get(url).await?.expect_json()?.data)
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus, Error> {
        let url = format!("/api2/extjs/nodes/{node}/tasks/{upid}/status");
        Ok(self.0.get(&url).await?.expect_json()?.data)
    }
}
