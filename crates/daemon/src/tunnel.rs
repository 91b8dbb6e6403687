// Tunnel Controllers — Reverse-Tunnel and VPN. Both consume the
// per-instance reply queue the Control Channel routes `TH_ACCEPT` and
// VPN replies into, and both respawn their child process on an
// unexpected exit, over a subprocess rather than an in-process SSH
// client.

use std::sync::Arc;
use std::time::Duration;

use hardshare_common::wire::Command;
use hardshare_common::{ConnType, InstanceStatus, TunnelHubAssociation};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::control_channel::ControlHandle;
use crate::subprocess::SubprocessAdapter;

/// Grace period the child gets to exit on cancellation before the
/// controller gives up waiting and moves on anyway.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(2);

fn fresh_mi() -> String {
    Uuid::new_v4().to_string()
}

async fn await_hub_association(
    instance_id: &str,
    mode: ConnType,
    key: Option<String>,
    control: &ControlHandle,
    replies: &mut mpsc::Receiver<Command>,
    cancel: &CancellationToken,
) -> Option<TunnelHubAssociation> {
    let mi = fresh_mi();
    control.th_search(instance_id, mode, key, mi);

    loop {
        tokio::select! {
            reply = replies.recv() => {
                match reply {
                    Some(Command::ThAccept {
                        hub_id, address, host_key, listen_port, connect_port, connect_user, mi, ..
                    }) => {
                        control.ack(mi);
                        return Some(TunnelHubAssociation {
                            hub_id,
                            address,
                            host_key,
                            listen_port,
                            connect_port,
                            connect_user,
                        });
                    }
                    Some(_) => continue,
                    None => return None,
                }
            }
            _ = cancel.cancelled() => return None,
        }
    }
}

/// Keeps a persistent outbound secure-shell connection alive from the
/// device to the rendezvous hub.
pub struct ReverseTunnelController {
    instance_id: String,
    sandbox_name: String,
    sandbox_address: String,
    sandbox_ssh_port: u16,
    identity_pubkey: Option<String>,
    tunnelkey_path: Option<std::path::PathBuf>,
    subprocess: Arc<dyn SubprocessAdapter>,
    control: ControlHandle,
    status: Arc<Mutex<InstanceStatus>>,
    hub_id: Arc<Mutex<Option<String>>>,
}

impl ReverseTunnelController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: String,
        sandbox_name: String,
        sandbox_address: String,
        sandbox_ssh_port: u16,
        identity_pubkey: Option<String>,
        tunnelkey_path: Option<std::path::PathBuf>,
        subprocess: Arc<dyn SubprocessAdapter>,
        control: ControlHandle,
        status: Arc<Mutex<InstanceStatus>>,
        hub_id: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            instance_id,
            sandbox_name,
            sandbox_address,
            sandbox_ssh_port,
            identity_pubkey,
            tunnelkey_path,
            subprocess,
            control,
            status,
            hub_id,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut replies = self.control.register_reply_waiter(&self.instance_id).await;

        let association = await_hub_association(
            &self.instance_id,
            ConnType::ReverseTunnel,
            self.identity_pubkey.clone(),
            &self.control,
            &mut replies,
            &cancel,
        )
        .await;
        self.control.unregister_reply_waiter(&self.instance_id).await;

        let Some(association) = association else {
            info!("reverse tunnel for {} cancelled before hub association", self.instance_id);
            return;
        };
        *self.hub_id.lock().await = Some(association.hub_id.clone());

        let Some(key_path) = &self.tunnelkey_path else {
            warn!("no tunnel key configured for {}; cannot start ssh", self.instance_id);
            return;
        };

        let argv = vec![
            "ssh".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=10".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-T".to_string(),
            "-N".to_string(),
            "-R".to_string(),
            format!(
                ":{}:{}:{}",
                association.listen_port, self.sandbox_address, self.sandbox_ssh_port
            ),
            "-i".to_string(),
            key_path.to_string_lossy().into_owned(),
            "-p".to_string(),
            association.connect_port.to_string(),
            format!("{}@{}", association.connect_user, association.address),
        ];

        let mut first_startup = true;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            info!(
                "starting reverse tunnel subprocess for {} (sandbox {} at {})",
                self.instance_id,
                self.sandbox_name,
                hardshare_common::format_host_port(&self.sandbox_address, self.sandbox_ssh_port)
            );
            let child = match self.subprocess.spawn_supervised(&argv).await {
                Ok(child) => child,
                Err(e) => {
                    warn!("failed to spawn ssh subprocess for {}: {}", self.instance_id, e);
                    tokio::select! {
                        _ = tokio::time::sleep(RESPAWN_BACKOFF) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            if first_startup {
                *self.status.lock().await = InstanceStatus::Ready;
                self.control.instance_status(InstanceStatus::Ready, None);
                first_startup = false;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    child.terminate().await;
                    break;
                }
                exit_code = wait_for_exit(&child) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("reverse tunnel subprocess for {} exited with {:?}; respawning", self.instance_id, exit_code);
                    tokio::time::sleep(RESPAWN_BACKOFF).await;
                }
            }
        }

        self.control.sshtun_delete();
        info!("reverse tunnel controller for {} stopped", self.instance_id);
    }
}

/// Runs a VPN client inside the sandbox using a configuration negotiated
/// over two correlated request/response rounds with the coordinator.
pub struct VpnController {
    instance_id: String,
    sandbox_name: String,
    subprocess: Arc<dyn SubprocessAdapter>,
    control: ControlHandle,
    status: Arc<Mutex<InstanceStatus>>,
    hub_id: Arc<Mutex<Option<String>>>,
}

impl VpnController {
    pub fn new(
        instance_id: String,
        sandbox_name: String,
        subprocess: Arc<dyn SubprocessAdapter>,
        control: ControlHandle,
        status: Arc<Mutex<InstanceStatus>>,
        hub_id: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            instance_id,
            sandbox_name,
            subprocess,
            control,
            status,
            hub_id,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut replies = self.control.register_reply_waiter(&self.instance_id).await;

        let association = await_hub_association(&self.instance_id, ConnType::Vpn, None, &self.control, &mut replies, &cancel).await;
        let Some(association) = association else {
            self.control.unregister_reply_waiter(&self.instance_id).await;
            info!("vpn setup for {} cancelled before hub association", self.instance_id);
            return;
        };
        *self.hub_id.lock().await = Some(association.hub_id.clone());

        let create_mi = fresh_mi();
        self.control.vpn_create(&self.instance_id, create_mi.clone());
        if !Self::await_reply_with_mi(&mut replies, &create_mi, &cancel).await {
            self.control.unregister_reply_waiter(&self.instance_id).await;
            return;
        }

        let newclient_mi = fresh_mi();
        self.control.vpn_new_client(&self.instance_id, newclient_mi.clone());
        let client_config = match Self::await_config_reply(&mut replies, &newclient_mi, &cancel).await {
            Some(config) => config,
            None => {
                self.control.unregister_reply_waiter(&self.instance_id).await;
                return;
            }
        };
        self.control.unregister_reply_waiter(&self.instance_id).await;

        let local_config_path = std::env::temp_dir().join(format!("{}.ovpn", self.instance_id));
        if let Err(e) = tokio::fs::write(&local_config_path, &client_config).await {
            warn!("failed to stage vpn config for {}: {}", self.instance_id, e);
            return;
        }
        if let Err(e) = self
            .subprocess
            .copy_in(&self.sandbox_name, &local_config_path, "/etc/openvpn/client.conf")
            .await
        {
            warn!("failed to copy vpn config into sandbox for {}: {}", self.instance_id, e);
            return;
        }
        let _ = tokio::fs::remove_file(&local_config_path).await;

        for pre_command in [
            vec!["service".to_string(), "dbus".to_string(), "start".to_string()],
            vec!["service".to_string(), "systemd-resolved".to_string(), "start".to_string()],
        ] {
            if let Err(e) = self.subprocess.exec_inside(&self.sandbox_name, &pre_command).await {
                warn!("vpn pre-command {:?} failed for {}: {}", pre_command, self.instance_id, e);
            }
        }

        let argv = vec![
            "docker".to_string(),
            "exec".to_string(),
            self.sandbox_name.clone(),
            "openvpn".to_string(),
            "--config".to_string(),
            "/etc/openvpn/client.conf".to_string(),
        ];

        let mut first_startup = true;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let child = match self.subprocess.spawn_supervised(&argv).await {
                Ok(child) => child,
                Err(e) => {
                    warn!("failed to spawn vpn client for {}: {}", self.instance_id, e);
                    tokio::select! {
                        _ = tokio::time::sleep(RESPAWN_BACKOFF) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            if first_startup {
                *self.status.lock().await = InstanceStatus::Ready;
                self.control.instance_status(InstanceStatus::Ready, None);
                first_startup = false;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    child.terminate().await;
                    break;
                }
                exit_code = wait_for_exit(&child) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("vpn client for {} exited with {:?}; respawning", self.instance_id, exit_code);
                    tokio::time::sleep(RESPAWN_BACKOFF).await;
                }
            }
        }

        self.control.vpn_delete(&self.instance_id);
        info!("vpn controller for {} stopped", self.instance_id);
    }

    async fn await_reply_with_mi(replies: &mut mpsc::Receiver<Command>, mi: &str, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                reply = replies.recv() => {
                    match reply {
                        Some(cmd) if cmd.correlation_id() == Some(mi) => return true,
                        Some(_) => continue,
                        None => return false,
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }

    async fn await_config_reply(replies: &mut mpsc::Receiver<Command>, mi: &str, cancel: &CancellationToken) -> Option<String> {
        loop {
            tokio::select! {
                reply = replies.recv() => {
                    match reply {
                        Some(Command::VpnNewClient { config: Some(config), mi: reply_mi, .. }) if reply_mi == mi => {
                            return Some(config);
                        }
                        Some(_) => continue,
                        None => return None,
                    }
                }
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

async fn wait_for_exit(child: &crate::subprocess::SupervisedChild) -> Option<i32> {
    loop {
        if let Some(code) = child.exit_code().await {
            return Some(code);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
