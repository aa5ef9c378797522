//! Wire types for the subset of the Proxmox VE API used by PLM.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// PVE encodes some numbers as strings (notably the VNC port), accept both.
fn number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u16),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// PVE encodes booleans as 0/1 integers in most list endpoints.
fn int_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(<Option<u8>>::deserialize(deserializer)?.unwrap_or(0) != 0)
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// `GET /version`
pub struct VersionResponse {
    pub version: String,
    pub release: String,
    #[serde(default)]
    pub repoid: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /nodes`.
pub struct NodeIndexEntry {
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub maxcpu: Option<u32>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /cluster/resources?type=vm`.
pub struct ClusterResource {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub maxcpu: Option<u32>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default, deserialize_with = "int_bool")]
    pub template: bool,
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /nodes/{node}/qemu` or `GET /nodes/{node}/lxc`.
pub struct GuestEntry {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub maxdisk: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default, deserialize_with = "int_bool")]
    pub template: bool,
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// `GET /nodes/{node}/{qemu|lxc}/{vmid}/status/current`
pub struct GuestStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

/// A guest configuration as returned by `GET .../config`.
///
/// The key set is open ended (`net0..net31`, `scsi0..`, `unused0..`, ...), so
/// this stays a map with typed accessors instead of a fixed struct.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GuestConfig {
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl GuestConfig {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.fields.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// The first populated disk slot in controller preference order.
    pub fn primary_disk(&self) -> Option<(&str, &str)> {
        for key in [
            "scsi0", "scsi1", "virtio0", "ide0", "ide1", "ide2", "sata0",
        ] {
            if let Some(value) = self.get_str(key) {
                return Some((key, value));
            }
        }
        None
    }

    /// Storage of the primary disk (`tank:vm-9000-disk-0,size=32G` -> `tank`).
    pub fn primary_disk_storage(&self) -> Option<String> {
        let (_slot, value) = self.primary_disk()?;
        let first = value.split(',').next()?;
        let storage = first.split(':').next()?;
        if storage.is_empty() {
            None
        } else {
            Some(storage.to_string())
        }
    }

    /// Size of the primary disk in GiB, parsed from the `size=` option.
    pub fn primary_disk_size_gb(&self) -> Option<f64> {
        let (_slot, value) = self.primary_disk()?;
        for option in value.split(',') {
            if let Some(size) = option.strip_prefix("size=") {
                return parse_disk_size_gb(size);
            }
        }
        None
    }

    /// Bridge of the first populated network device.
    pub fn primary_net_bridge(&self) -> Option<String> {
        let value = self.first_net_value()?;
        for option in value.split(',') {
            if let Some(bridge) = option.strip_prefix("bridge=") {
                return Some(bridge.to_string());
            }
        }
        None
    }

    /// MAC of the first populated network device.
    ///
    /// QEMU encodes it as `virtio=AA:BB:..`/`e1000=..`, LXC as `hwaddr=..`.
    pub fn primary_mac(&self) -> Option<String> {
        let value = self.first_net_value()?;
        for option in value.split(',') {
            let candidate = match option.split_once('=') {
                Some((_key, value)) => value,
                None => continue,
            };
            if let Some(mac) = crate::normalize_mac(candidate) {
                return Some(mac);
            }
        }
        None
    }

    fn first_net_value(&self) -> Option<&str> {
        for i in 0..10 {
            if let Some(value) = self.get_str(&format!("net{i}")) {
                return Some(value);
            }
        }
        None
    }
}

/// Parse a PVE disk size string (`32G`, `512M`, `1048576K`) into GiB.
pub fn parse_disk_size_gb(size: &str) -> Option<f64> {
    let (number, factor) = match size.chars().last()? {
        'G' => (&size[..size.len() - 1], 1.0),
        'M' => (&size[..size.len() - 1], 1.0 / 1024.0),
        'K' => (&size[..size.len() - 1], 1.0 / (1024.0 * 1024.0)),
        'T' => (&size[..size.len() - 1], 1024.0),
        _ => (size, 1.0 / (1024.0 * 1024.0 * 1024.0)),
    };
    number.parse::<f64>().ok().map(|n| n * factor)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// `POST /nodes/{node}/{qemu|lxc}/{vmid}/vncproxy`
pub struct VncProxyResponse {
    pub ticket: String,
    #[serde(deserialize_with = "number_or_string")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /nodes/{node}/storage`.
pub struct StorageEntry {
    pub storage: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_enabled", deserialize_with = "int_bool_default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub shared: Option<u8>,
    #[serde(default)]
    pub avail: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn int_bool_default_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(<Option<u8>>::deserialize(deserializer)?.map(|v| v != 0).unwrap_or(true))
}

impl StorageEntry {
    /// Whether the storage declares the given content type.
    pub fn has_content(&self, ty: &str) -> bool {
        self.content.split(',').any(|c| c == ty)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /nodes/{node}/storage/{storage}/content`.
pub struct StorageContentEntry {
    pub volid: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One address of a guest-agent reported interface.
pub struct AgentIpAddress {
    #[serde(rename = "ip-address-type", default)]
    pub ip_address_type: String,
    #[serde(rename = "ip-address", default)]
    pub ip_address: String,
    #[serde(default)]
    pub prefix: Option<u8>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One interface from `guest-agent network-get-interfaces`.
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// `GET /nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`
pub struct AgentInterfacesResult {
    #[serde(default)]
    pub result: Vec<AgentInterface>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /nodes/{node}/lxc/{vmid}/interfaces`.
pub struct LxcInterface {
    pub name: String,
    #[serde(default)]
    pub hwaddr: Option<String>,
    #[serde(default)]
    pub inet: Option<String>,
    #[serde(default)]
    pub inet6: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /nodes/{node}/{qemu|lxc}/{vmid}/snapshot`.
pub struct SnapshotEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub snaptime: Option<i64>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// `GET /nodes/{node}/tasks/{upid}/status`
pub struct TaskStatus {
    pub upid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// `GET /access/groups/{group}`
pub struct GroupInfo {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
/// One entry of `GET /access/users`.
pub struct PveUserEntry {
    pub userid: String,
    #[serde(default = "default_enabled", deserialize_with = "int_bool_default_true")]
    pub enable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vncproxy_port_formats() {
        let with_string: VncProxyResponse =
            serde_json::from_str(r#"{"ticket":"PVEVNC:x","port":"5900"}"#).unwrap();
        assert_eq!(with_string.port, 5900);

        let with_number: VncProxyResponse =
            serde_json::from_str(r#"{"ticket":"PVEVNC:x","port":5901}"#).unwrap();
        assert_eq!(with_number.port, 5901);
    }

    #[test]
    fn test_cluster_resource_template_flag() {
        let raw = r#"{"id":"qemu/9000","type":"qemu","vmid":9000,"template":1}"#;
        let resource: ClusterResource = serde_json::from_str(raw).unwrap();
        assert!(resource.template);

        let raw = r#"{"id":"qemu/100","type":"qemu","vmid":100}"#;
        let resource: ClusterResource = serde_json::from_str(raw).unwrap();
        assert!(!resource.template);
    }

    #[test]
    fn test_storage_content_declaration() {
        let raw = r#"{"storage":"local","content":"iso,vztmpl,backup"}"#;
        let storage: StorageEntry = serde_json::from_str(raw).unwrap();
        assert!(storage.has_content("iso"));
        assert!(!storage.has_content("images"));
        assert!(storage.enabled);
    }

    #[test]
    fn test_guest_config_primary_disk() {
        let raw = r#"{"scsi0":"tank:vm-9000-disk-0,size=32G","net0":"virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0","cores":4}"#;
        let config: GuestConfig = serde_json::from_str(raw).unwrap();
        let (slot, value) = config.primary_disk().unwrap();
        assert_eq!(slot, "scsi0");
        assert!(value.starts_with("tank:"));
        assert_eq!(config.get_u64("cores"), Some(4));

        assert_eq!(config.primary_disk_storage().as_deref(), Some("tank"));
        assert_eq!(config.primary_disk_size_gb(), Some(32.0));
        assert_eq!(config.primary_net_bridge().as_deref(), Some("vmbr0"));
        assert_eq!(config.primary_mac().as_deref(), Some("aabbccddeeff"));
    }

    #[test]
    fn test_lxc_config_mac() {
        let raw = r#"{"net0":"name=eth0,bridge=vmbr0,hwaddr=02:00:0C:29:AB:CD,ip=dhcp"}"#;
        let config: GuestConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.primary_mac().as_deref(), Some("02000c29abcd"));
    }

    #[test]
    fn test_parse_disk_size() {
        assert_eq!(parse_disk_size_gb("32G"), Some(32.0));
        assert_eq!(parse_disk_size_gb("512M"), Some(0.5));
        assert_eq!(parse_disk_size_gb("1048576K"), Some(1.0));
        assert_eq!(parse_disk_size_gb("2T"), Some(2048.0));
        assert_eq!(parse_disk_size_gb("x"), None);
    }
}
