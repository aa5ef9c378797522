//! Pooled SSH sessions to cluster nodes.
//!
//! Privileged operations without an API equivalent (overlay disk creation,
//! cross-node clone details, config file cloning) run over these sessions.
//! One connection is kept per `(host, user)`; dead sessions reconnect
//! transparently, idle ones are reaped, and the pool is capped by evicting
//! the oldest idle connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use serde::Serialize;
use tokio::sync::Mutex;

use plm_api_types::clusters::ClusterConfig;

pub mod session;

pub use session::{hop_command, quote_arg, CommandOutput, SshSession, DEFAULT_COMMAND_TIMEOUT};

/// Hard cap on concurrently pooled sessions.
pub const SSH_POOL_MAX: usize = 50;

/// Sessions idle longer than this are closed by the next acquisition.
pub const SSH_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

static POOL: OnceLock<ShellPool> = OnceLock::new();

/// Access the process-wide shell pool.
pub fn pool() -> &'static ShellPool {
    POOL.get_or_init(ShellPool::default)
}

/// Acquire a pooled session to a node of the given cluster.
///
/// `host` may be the cluster entry point or a specific node address.
pub async fn acquire(cluster: &ClusterConfig, host: &str) -> Result<PooledSession, Error> {
    pool()
        .acquire(host, cluster.shell_user(), 22, &cluster.password)
        .await
}

/// Resolve a node name to its address by asking the cluster gateway.
///
/// Falls back from `getent hosts` to `nslookup`; returns `None` when the
/// gateway cannot resolve the name either (callers then try the bare
/// hostname).
pub async fn resolve_node_address(
    gateway: &PooledSession,
    node: &str,
) -> Result<Option<String>, Error> {
    let cmd = format!("getent hosts {} | awk '{{print $1}}'", quote_arg(node));
    let output = gateway.execute(&cmd, DEFAULT_COMMAND_TIMEOUT, false).await?;
    if output.exit_code == 0 {
        if let Some(ip) = output.stdout.split_whitespace().next() {
            return Ok(Some(ip.to_string()));
        }
    }

    let cmd = format!(
        "nslookup {} | grep 'Address:' | tail -n +2 | head -1 | awk '{{print $2}}'",
        quote_arg(node)
    );
    let output = gateway.execute(&cmd, DEFAULT_COMMAND_TIMEOUT, false).await?;
    if output.exit_code == 0 {
        let ip = output.stdout.trim();
        if !ip.is_empty() {
            return Ok(Some(ip.to_string()));
        }
    }

    Ok(None)
}

/// Pool statistics as exposed via the API.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub closed: u64,
    pub dropped: u64,
    pub active: usize,
    pub max_size: usize,
    pub utilization_percent: u8,
}

struct PoolEntry {
    session: Arc<Mutex<SshSession>>,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<(String, String), PoolEntry>,
    created: u64,
    reused: u64,
    closed: u64,
    dropped: u64,
}

/// A session checked out of the pool.
///
/// Commands take the inner lock for their duration, so no two commands ever
/// interleave on one connection.
#[derive(Clone)]
pub struct PooledSession {
    session: Arc<Mutex<SshSession>>,
}

impl PooledSession {
    /// Run a command on the pooled session.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        check: bool,
    ) -> Result<CommandOutput, Error> {
        let mut session = self.session.lock().await;
        session.execute(command, timeout, check).await
    }

    /// Run a command with the default timeout, failing on non-zero exit.
    pub async fn run_checked(&self, command: &str) -> Result<CommandOutput, Error> {
        self.execute(command, DEFAULT_COMMAND_TIMEOUT, true).await
    }
}

/// Thread-safe pool of SSH sessions, keyed by `(host, user)`.
#[derive(Default)]
pub struct ShellPool {
    state: StdMutex<PoolState>,
}

impl ShellPool {
    /// Get a live session, reconnecting or creating one as needed.
    pub async fn acquire(
        &self,
        host: &str,
        user: &str,
        port: u16,
        password: &str,
    ) -> Result<PooledSession, Error> {
        let key = (host.to_string(), user.to_string());

        self.reap_stale().await;

        let existing = {
            let mut state = self.state.lock().unwrap();
            match state.entries.get_mut(&key) {
                Some(entry) => {
                    entry.last_used = Instant::now();
                    Some(Arc::clone(&entry.session))
                }
                None => None,
            }
        };

        if let Some(session) = existing {
            let alive = session.lock().await.is_alive();
            if alive {
                self.state.lock().unwrap().reused += 1;
                log::debug!("reusing SSH connection to {user}@{host}");
                return Ok(PooledSession { session });
            }

            log::info!("SSH connection to {user}@{host} dropped, reconnecting");
            match SshSession::connect(host, port, user, password).await {
                Ok(fresh) => {
                    *session.lock().await = fresh;
                    return Ok(PooledSession { session });
                }
                Err(err) => {
                    log::warn!("failed to reconnect SSH to {user}@{host}: {err}");
                    self.state.lock().unwrap().entries.remove(&key);
                }
            }
        }

        self.make_room().await?;

        log::info!("creating new pooled SSH connection to {user}@{host}");
        let session = Arc::new(Mutex::new(
            SshSession::connect(host, port, user, password).await?,
        ));

        let mut state = self.state.lock().unwrap();
        state.created += 1;
        state.entries.insert(
            key,
            PoolEntry {
                session: Arc::clone(&session),
                last_used: Instant::now(),
            },
        );

        Ok(PooledSession { session })
    }

    /// Close sessions that have been idle too long.
    async fn reap_stale(&self) {
        let stale: Vec<Arc<Mutex<SshSession>>> = {
            let mut state = self.state.lock().unwrap();
            let cutoff = Instant::now() - SSH_IDLE_TIMEOUT;
            let keys: Vec<_> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.last_used < cutoff)
                .map(|(key, _)| key.clone())
                .collect();

            let mut sessions = Vec::new();
            for key in keys {
                if let Some(entry) = state.entries.remove(&key) {
                    log::info!("closing stale SSH connection to {}@{}", key.1, key.0);
                    state.closed += 1;
                    sessions.push(entry.session);
                }
            }
            sessions
        };

        for session in stale {
            session.lock().await.close().await;
        }
    }

    /// Evict the oldest idle session when the pool is at capacity.
    async fn make_room(&self) -> Result<(), Error> {
        let victim = {
            let mut state = self.state.lock().unwrap();
            if state.entries.len() < SSH_POOL_MAX {
                return Ok(());
            }

            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());

            match oldest {
                Some(key) => {
                    log::warn!(
                        "SSH pool at max capacity ({SSH_POOL_MAX}), closing oldest idle connection {}@{}",
                        key.1,
                        key.0
                    );
                    state.dropped += 1;
                    state.entries.remove(&key).map(|entry| entry.session)
                }
                None => {
                    return Err(format_err!(
                        "SSH connection pool at max capacity ({SSH_POOL_MAX}) with no idle connections"
                    ))
                }
            }
        };

        if let Some(session) = victim {
            session.lock().await.close().await;
        }
        Ok(())
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            created: state.created,
            reused: state.reused,
            closed: state.closed,
            dropped: state.dropped,
            active: state.entries.len(),
            max_size: SSH_POOL_MAX,
            utilization_percent: ((state.entries.len() * 100) / SSH_POOL_MAX) as u8,
        }
    }

    /// Close all pooled sessions.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            let sessions: Vec<_> = state
                .entries
                .drain()
                .map(|(_, entry)| entry.session)
                .collect();
            state.closed += sessions.len() as u64;
            sessions
        };

        for session in sessions {
            session.lock().await.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_empty() {
        let pool = ShellPool::default();
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.max_size, SSH_POOL_MAX);
        assert_eq!(stats.utilization_percent, 0);
    }
}
