//! A single authenticated SSH session to a cluster node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use russh::client::{self, AuthResult};
use russh::ChannelMsg;

use crate::error::LabError;

/// Connect timeout for new sessions.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a remote command.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

// Cluster nodes present self-managed host keys, accept them like the API
// layer accepts self-signed certificates.
struct SshHandler;

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One authenticated shell connection to `user@host`.
pub struct SshSession {
    pub host: String,
    pub user: String,
    pub port: u16,
    handle: client::Handle<SshHandler>,
    dead: bool,
}

impl SshSession {
    /// Open a connection and authenticate with the given password.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> Result<Self, Error> {
        let config = Arc::new(client::Config::default());

        let handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, (host, port), SshHandler),
        )
        .await
        .map_err(|_| format_err!("SSH connection to {user}@{host}:{port} timed out"))?
        .map_err(|err| format_err!("SSH connection to {user}@{host}:{port} failed: {err}"))?;

        let mut this = Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            handle,
            dead: false,
        };

        let result = this
            .handle
            .authenticate_password(user, password)
            .await
            .map_err(|err| format_err!("SSH authentication for {user}@{host} failed: {err}"))?;

        if !matches!(result, AuthResult::Success) {
            this.dead = true;
            return Err(format_err!("SSH authentication for {user}@{host} rejected"));
        }

        Ok(this)
    }

    /// Whether the underlying transport is still usable.
    pub fn is_alive(&self) -> bool {
        !self.dead && !self.handle.is_closed()
    }

    /// Run a command, collecting stdout, stderr and the exit code.
    ///
    /// On `check`, a non-zero exit surfaces [`LabError::CommandFailed`].
    /// A timeout marks the session dead - the remote command state is
    /// unknown at that point, so the connection is not reused.
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        check: bool,
    ) -> Result<CommandOutput, Error> {
        if !self.is_alive() {
            return Err(format_err!(
                "SSH session to {}@{} is no longer alive",
                self.user,
                self.host
            ));
        }

        log::debug!("executing on {}@{}: {command}", self.user, self.host);

        let run = async {
            let mut channel = self.handle.channel_open_session().await?;
            channel.exec(true, command.as_bytes()).await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code: Option<u32> = None;

            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { ref data }) => {
                        stdout.extend_from_slice(data);
                    }
                    Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        stderr.extend_from_slice(data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {}
                    None => break,
                    _ => {}
                }
            }

            Ok::<_, Error>(CommandOutput {
                exit_code: exit_code.unwrap_or(0) as i32,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                self.dead = true;
                return Err(LabError::CommandFailed {
                    command: command.to_string(),
                    exit_code: -1,
                    stderr: format!("timed out after {}s", timeout.as_secs()),
                }
                .into());
            }
        };

        if check && output.exit_code != 0 {
            return Err(LabError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            }
            .into());
        }

        Ok(output)
    }

    /// Close the connection.
    pub async fn close(&mut self) {
        self.dead = true;
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Quote an argument for a POSIX shell.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c)) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'\''"#))
}

/// Wrap a command for execution on another node of the same cluster.
///
/// Proxmox nodes trust each other's root keys, so a plain hop suffices when
/// the pool only holds a session to a different node.
pub fn hop_command(target_node: &str, command: &str) -> String {
    format!("ssh -o BatchMode=yes {} {}", target_node, quote_arg(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("qm"), "qm");
        assert_eq!(quote_arg("/etc/pve/qemu-server/100.conf"), "/etc/pve/qemu-server/100.conf");
        assert_eq!(quote_arg("name with space"), "'name with space'");
        assert_eq!(quote_arg("it's"), r#"'it'\''s'"#);
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn test_hop_command() {
        assert_eq!(
            hop_command("netlab2", "qm clone 9000 12300"),
            "ssh -o BatchMode=yes netlab2 'qm clone 9000 12300'"
        );
    }
}
