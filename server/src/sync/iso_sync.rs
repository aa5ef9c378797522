//! ISO image synchronization.

use std::collections::HashSet;

use anyhow::Error;

use crate::connection;
use crate::db::Database;
use crate::error::is_expected_offline_error;

/// Full sync: scan every enabled storage that declares ISO content,
/// dedupe by volid, upsert and delete entries that disappeared.
pub async fn full_sync(db: &Database) -> Result<usize, Error> {
    let mut found: HashSet<String> = HashSet::new();
    let mut count = 0;

    for cluster in super::active_clusters()? {
        if !cluster.allow_iso_sync {
            continue;
        }

        let client = match connection::make_pve_client(&cluster).await {
            Ok(client) => client,
            Err(err) => {
                log::warn!("ISO sync cannot reach '{}': {err}", cluster.id);
                continue;
            }
        };

        let nodes = match client.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                log::warn!("ISO sync: node listing on '{}' failed: {err}", cluster.id);
                continue;
            }
        };

        for node in nodes {
            let storages = match client.list_storages(&node.node).await {
                Ok(storages) => storages,
                Err(err) => {
                    let msg = err.to_string();
                    if is_expected_offline_error(&msg) {
                        log::debug!("node {} unreachable: {msg}", node.node);
                    } else {
                        log::warn!("storage listing on {} failed: {msg}", node.node);
                    }
                    continue;
                }
            };

            for storage in storages {
                if !storage.has_content("iso") || !storage.enabled {
                    continue;
                }

                let content = match client
                    .storage_content(&node.node, &storage.storage, Some("iso"))
                    .await
                {
                    Ok(content) => content,
                    Err(err) => {
                        log::warn!(
                            "scan of storage {}/{} failed: {err}",
                            node.node,
                            storage.storage
                        );
                        continue;
                    }
                };

                for item in content {
                    if !item.volid.to_lowercase().ends_with(".iso") {
                        continue;
                    }
                    // shared storages surface the same volid on every node
                    if !found.insert(item.volid.clone()) {
                        continue;
                    }

                    let name = item
                        .volid
                        .rsplit('/')
                        .next()
                        .unwrap_or(&item.volid)
                        .to_string();

                    db.upsert_iso(
                        &item.volid,
                        &name,
                        item.size.unwrap_or(0),
                        &node.node,
                        &storage.storage,
                        &cluster.id,
                    )?;
                    count += 1;
                }
            }
        }
    }

    let removed = db.delete_stale_isos(&found)?;
    if removed > 0 {
        log::info!("ISO sync removed {removed} stale images");
    }

    Ok(count)
}

/// Verify pass: confirm each cached ISO on its origin node, touching
/// `last_seen` or deleting the entry.
pub async fn verify(db: &Database) -> Result<usize, Error> {
    let clusters = super::active_clusters()?;
    let mut verified = 0;

    for iso in db.list_isos()? {
        let cluster = match clusters.iter().find(|c| c.id == iso.cluster_id) {
            Some(cluster) => cluster,
            None => continue,
        };
        let client = match connection::make_pve_client(cluster).await {
            Ok(client) => client,
            Err(err) => {
                log::debug!("ISO verify cannot reach '{}': {err}", cluster.id);
                continue;
            }
        };

        match client
            .storage_content(&iso.node, &iso.storage, Some("iso"))
            .await
        {
            Ok(content) => {
                if content.iter().any(|item| item.volid == iso.volid) {
                    db.touch_iso_seen(&iso.volid)?;
                    verified += 1;
                } else {
                    log::info!("ISO {} disappeared, removing", iso.volid);
                    db.delete_iso(&iso.volid)?;
                }
            }
            Err(err) => {
                log::debug!("could not verify ISO {}: {err}", iso.volid);
            }
        }
    }

    Ok(verified)
}
