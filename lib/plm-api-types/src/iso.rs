use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// An ISO image discovered on a cluster storage.
///
/// Managed exclusively by the sync engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IsoImage {
    /// The volume ID, unique across all clusters.
    pub volid: String,

    /// File name without the storage path.
    pub name: String,

    /// File size in bytes.
    pub size: u64,

    /// The node the image was discovered on.
    pub node: String,

    /// The storage holding the image.
    pub storage: String,

    /// The cluster the image belongs to.
    pub cluster_id: String,

    /// First discovery time (epoch).
    pub discovered_at: i64,

    /// Last time the image was confirmed to exist (epoch).
    pub last_seen: i64,
}
