//! Template synchronization.

use std::collections::HashSet;

use anyhow::Error;

use plm_api_types::CachedSpecs;

use crate::connection;
use crate::db::Database;
use crate::error::is_expected_offline_error;

/// Full sync: enumerate `template=1` guests on all clusters, cache their
/// specs and remove non-class templates that disappeared everywhere.
pub async fn full_sync(db: &Database) -> Result<usize, Error> {
    let mut found: HashSet<(String, String, u32)> = HashSet::new();
    let mut count = 0;

    for cluster in super::active_clusters()? {
        if !cluster.allow_template_sync {
            continue;
        }

        let client = match connection::make_pve_client(&cluster).await {
            Ok(client) => client,
            Err(err) => {
                log::warn!("template sync cannot reach '{}': {err}", cluster.id);
                continue;
            }
        };

        let nodes = match client.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                log::warn!("template sync: node listing on '{}' failed: {err}", cluster.id);
                continue;
            }
        };

        for node in nodes {
            let guests = match client.list_qemu(&node.node).await {
                Ok(guests) => guests,
                Err(err) => {
                    let msg = err.to_string();
                    if is_expected_offline_error(&msg) {
                        log::debug!("node {} unreachable: {msg}", node.node);
                    } else {
                        log::error!("template listing on {} failed: {msg}", node.node);
                    }
                    continue;
                }
            };

            for guest in guests {
                if !guest.template {
                    continue;
                }

                let name = guest
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("template-{}", guest.vmid));

                let specs = match client
                    .guest_config(&node.node, plm_api_types::GuestKind::Qemu, guest.vmid)
                    .await
                {
                    Ok(config) => Some(CachedSpecs {
                        cores: config.get_u64("cores").map(|v| v as u32),
                        sockets: config.get_u64("sockets").map(|v| v as u32),
                        memory_mb: config.get_u64("memory"),
                        os_type: config.get_str("ostype").map(str::to_string),
                        disk_storage: config.primary_disk_storage(),
                        disk_size_gb: config.primary_disk_size_gb(),
                        network_bridge: config.primary_net_bridge(),
                    }),
                    Err(err) => {
                        log::debug!("spec fetch for template {} failed: {err}", guest.vmid);
                        None
                    }
                };

                db.upsert_template(
                    &name,
                    guest.vmid,
                    &cluster.host,
                    &node.node,
                    specs.as_ref(),
                )?;
                found.insert((cluster.host.clone(), node.node.clone(), guest.vmid));
                count += 1;
            }
        }
    }

    let removed = db.delete_stale_templates(&found)?;
    if removed > 0 {
        log::info!("template sync removed {removed} stale templates");
    }

    Ok(count)
}

/// Verify pass: confirm known templates still exist and touch
/// `last_verified_at` without refetching specs.
pub async fn verify(db: &Database) -> Result<usize, Error> {
    let clusters = super::active_clusters()?;
    let mut verified = 0;

    for cluster in &clusters {
        if !cluster.allow_template_sync {
            continue;
        }

        let client = match connection::make_pve_client(cluster).await {
            Ok(client) => client,
            Err(err) => {
                log::debug!("template verify cannot reach '{}': {err}", cluster.id);
                continue;
            }
        };

        let resources = match client.cluster_resources(Some("vm")).await {
            Ok(resources) => resources,
            Err(err) => {
                log::debug!("template verify on '{}' failed: {err}", cluster.id);
                continue;
            }
        };

        for resource in resources {
            if !resource.template {
                continue;
            }
            if let (Some(vmid), Some(node)) = (resource.vmid, resource.node.as_deref()) {
                if db.touch_template_verified(&cluster.host, node, vmid)? {
                    verified += 1;
                }
            }
        }
    }

    Ok(verified)
}
