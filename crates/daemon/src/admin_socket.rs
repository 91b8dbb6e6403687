// Local Admin Socket — a per-workspace filesystem socket accepting two
// line-delimited text commands from co-resident processes. Spoken
// directly with `AsyncBufReadExt`/`AsyncWriteExt` rather than handed to
// an HTTP router: the surface is two bare commands, not a REST API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control_channel::ControlChannel;
use crate::permissions;

/// Filesystem-bound line protocol server at
/// `~/.rerobots/hardshare.<workspace_id>.sock`.
pub struct AdminSocket {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl AdminSocket {
    /// Bind the socket, removing any stale file left behind by a
    /// previous run first (the `PidFileGuard` already refused to start
    /// a second daemon for this workspace, so a leftover socket file
    /// here can only be stale).
    pub fn bind(socket_path: PathBuf, group_access: bool) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            permissions::ensure_directory_with_permissions(parent, group_access)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("failed to remove stale admin socket at {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind admin socket at {}", socket_path.display()))?;
        permissions::set_socket_permissions(&socket_path, group_access)?;

        info!("admin socket listening at {}", socket_path.display());
        Ok(Self { socket_path, listener })
    }

    /// Accept connections until `cancel` fires or a `TERMINATE` request
    /// is handled. `cancel` is the daemon-wide shutdown token shared with
    /// the control channel: a `TERMINATE` request cancels it, and the
    /// supervisor tears down the current Instance once both tasks join.
    pub async fn run(self, control: Arc<ControlChannel>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let control = control.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, control, cancel).await {
                                    debug!("admin socket connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => warn!("admin socket accept failed: {}", e),
                    }
                }
            }
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("failed to unlink admin socket {}: {}", self.socket_path.display(), e);
            } else {
                debug!("unlinked admin socket {}", self.socket_path.display());
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, control: Arc<ControlChannel>, cancel: CancellationToken) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        match line.as_str() {
            "STATUS" => {
                let reply = match control.status_report().await {
                    Some(name) => format!("ACTIVE:{}\n", name),
                    None => "READY\n".to_string(),
                };
                writer.write_all(reply.as_bytes()).await?;
            }
            "TERMINATE" => {
                info!("admin socket received TERMINATE; shutting down");
                cancel.cancel();
                break;
            }
            other => {
                debug!("admin socket closing connection on unrecognized input: {:?}", other);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::subprocess::{FakeScript, FakeSubprocessAdapter};
    use hardshare_common::{ConnType, Provider, WorkspaceDescriptor};
    use tokio::io::AsyncReadExt;

    fn test_config(id: &str) -> Arc<DaemonConfig> {
        Arc::new(DaemonConfig {
            workspace: WorkspaceDescriptor {
                id: id.to_string(),
                owner: "alice".into(),
                provider: Provider::ProviderA,
                image: None,
                extra_args: vec![],
                init_inside: vec![],
                post_termination: vec![],
            },
            coordinator_url: "wss://hs.example".into(),
            auth_token: "tok".into(),
            tunnelkey_path: None,
            receive_timeout_secs: 45,
            reconnect_window_secs: 1200,
            group_access: false,
        })
    }

    #[tokio::test]
    async fn status_reports_ready_with_no_instance() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hardshare.ws-admin-1.sock");
        let subprocess: Arc<dyn crate::subprocess::SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let control = Arc::new(ControlChannel::new(test_config("ws-admin-1"), subprocess));
        let cancel = CancellationToken::new();

        let admin = AdminSocket::bind(socket_path.clone(), false).unwrap();
        let run_control = control.clone();
        let run_cancel = cancel.clone();
        let server = tokio::spawn(admin.run(run_control, run_cancel));

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"STATUS\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"READY\n");

        cancel.cancel();
        server.await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn status_reports_active_with_current_instance() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hardshare.ws-admin-2.sock");
        let subprocess: Arc<dyn crate::subprocess::SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let control = Arc::new(ControlChannel::new(test_config("ws-admin-2"), subprocess));
        control.handle_launch_for_test("i1".into(), ConnType::Vpn, "pubkey".into(), "m1".into()).await;

        let cancel = CancellationToken::new();
        let admin = AdminSocket::bind(socket_path.clone(), false).unwrap();
        let server = tokio::spawn(admin.run(control.clone(), cancel.clone()));

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"STATUS\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ACTIVE:ws-admin-2\n");

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn terminate_cancels_the_shared_token() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("hardshare.ws-admin-3.sock");
        let subprocess: Arc<dyn crate::subprocess::SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let control = Arc::new(ControlChannel::new(test_config("ws-admin-3"), subprocess));
        let cancel = CancellationToken::new();

        let admin = AdminSocket::bind(socket_path.clone(), false).unwrap();
        let server = tokio::spawn(admin.run(control, cancel.clone()));

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"TERMINATE\n").await.unwrap();

        server.await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(!socket_path.exists());
    }
}
