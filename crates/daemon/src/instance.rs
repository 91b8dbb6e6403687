// Instance State Machine — the lifecycle of one sandbox.
//
// `launch` returns immediately with an Instance already in INIT, ACKed
// over the control channel by the caller; the actual provisioning
// (sandbox creation, address/port/host-key resolution, init_inside) runs
// in a spawned background task so a slow or stuck sandbox never blocks
// the control channel's read loop. Any failure during provisioning is
// folded into INIT_FAIL and reported both over the control channel and
// back into the control handle's current-instance slot. Owns the Tunnel
// Controller task, the sandbox handle (by name), and the per-instance
// reply queue registered with the control channel.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hardshare_common::{ConnType, InstanceStatus, Provider, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::control_channel::ControlHandle;
use crate::subprocess::SubprocessAdapter;
use crate::tunnel::{ReverseTunnelController, VpnController};

const HOST_KEY_TIMEOUT: Duration = Duration::from_secs(45);
const FORWARDED_PORT_TIMEOUT: Duration = Duration::from_secs(10);

/// One remote user's live session against the workspace. At most one of
/// these exists at a time; see `Daemon::current`.
pub struct Instance {
    pub instance_id: String,
    pub conntype: ConnType,
    pub status: Arc<Mutex<InstanceStatus>>,
    /// Hub identifier from the `TH_ACCEPT` this Instance's Tunnel
    /// Controller associated with, if one has completed yet. Checked by
    /// the control channel against incoming `TH_PING`'s `thid`.
    pub hub_id: Arc<Mutex<Option<String>>>,
    controller_cancel: CancellationToken,
    controller_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Instance {
    /// Name under which the sandbox itself is created. Exactly one
    /// Instance exists per workspace at a time, so the workspace id
    /// doubles as the container name.
    pub fn sandbox_name(workspace_id: &str) -> String {
        workspace_id.to_string()
    }

    pub async fn current_status(&self) -> InstanceStatus {
        *self.status.lock().await
    }

    /// Register a new Instance in INIT and hand it back immediately;
    /// provisioning runs in a background task. Preconditions (no current
    /// Instance, tunnel key configured when `conntype == ReverseTunnel`)
    /// are checked by the caller before this is invoked, because a
    /// failing precondition is answered with `NACK` and never reaches
    /// the state machine.
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        workspace_id: String,
        provider: Provider,
        image: Option<String>,
        extra_args: Vec<String>,
        instance_id: String,
        conntype: ConnType,
        initial_publickey: String,
        init_inside: Vec<String>,
        tunnelkey_path: Option<PathBuf>,
        subprocess: Arc<dyn SubprocessAdapter>,
        control: ControlHandle,
    ) -> Arc<Instance> {
        let status = Arc::new(Mutex::new(InstanceStatus::Init));
        let hub_id = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let instance = Arc::new(Instance {
            instance_id: instance_id.clone(),
            conntype,
            status,
            hub_id,
            controller_cancel: cancel.clone(),
            controller_task: Mutex::new(None),
        });

        let provisioning = instance.clone();
        tokio::spawn(async move {
            provisioning
                .provision(
                    workspace_id,
                    provider,
                    image,
                    extra_args,
                    conntype,
                    initial_publickey,
                    init_inside,
                    tunnelkey_path,
                    subprocess,
                    control,
                    cancel,
                )
                .await;
        });

        info!("instance {} registered, provisioning in background", instance_id);
        instance
    }

    /// Mark this Instance INIT_FAIL, report it over the control channel,
    /// and clear it from the handle's current-instance slot so the next
    /// `INSTANCE_LAUNCH` is accepted without an explicit destroy.
    async fn fail_init(&self, control: &ControlHandle, context: &str, err: impl Display) {
        warn!("{} for {}: {}", context, self.instance_id, err);
        *self.status.lock().await = InstanceStatus::InitFail;
        control.instance_status(InstanceStatus::InitFail, None);
        control.clear_current_if_matches(&self.instance_id).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision(
        self: Arc<Self>,
        workspace_id: String,
        provider: Provider,
        image: Option<String>,
        extra_args: Vec<String>,
        conntype: ConnType,
        initial_publickey: String,
        init_inside: Vec<String>,
        tunnelkey_path: Option<PathBuf>,
        subprocess: Arc<dyn SubprocessAdapter>,
        control: ControlHandle,
        cancel: CancellationToken,
    ) {
        let name = Self::sandbox_name(&workspace_id);
        let instance_id = self.instance_id.clone();

        // Tunnel key material, read once up front. A reverse tunnel
        // launch with a configured-but-missing key file logs a warning
        // and still proceeds to INIT_FAIL below (the precondition check
        // upstream only confirms the path is configured, not that the
        // file exists at the time of this call).
        let tunnel_pubkey = match (&conntype, &tunnelkey_path) {
            (ConnType::ReverseTunnel, Some(path)) => {
                let pub_path = path.with_extension("pub");
                match tokio::fs::read_to_string(&pub_path).await {
                    Ok(contents) => Some(contents.trim().to_string()),
                    Err(e) => {
                        warn!("tunnel public key {} unreadable: {}", pub_path.display(), e);
                        None
                    }
                }
            }
            _ => None,
        };

        if let Err(e) = subprocess
            .create(&name, provider, image.as_deref(), &extra_args)
            .await
        {
            self.fail_init(&control, "sandbox creation failed", e).await;
            return;
        }

        let address = match subprocess.address(&name, provider).await {
            Ok(addr) => addr,
            Err(e) => {
                self.fail_init(&control, "could not resolve sandbox address", e).await;
                return;
            }
        };

        let ssh_port: u16 = if provider == Provider::ProviderB {
            match subprocess.forwarded_ssh_port(&name, FORWARDED_PORT_TIMEOUT).await {
                Ok(port) => port,
                Err(e) => {
                    self.fail_init(&control, "forwarded ssh port never appeared", e).await;
                    return;
                }
            }
        } else {
            22
        };

        if let Err(e) = subprocess.host_key(&name, HOST_KEY_TIMEOUT).await {
            self.fail_init(&control, "host key never appeared", e).await;
            return;
        }

        if let Err(e) = subprocess.regenerate_host_keys(&name).await {
            self.fail_init(&control, "host key regeneration failed", e).await;
            return;
        }

        if let Err(e) = subprocess.install_authorized_key(&name, &initial_publickey).await {
            self.fail_init(&control, "installing authorized key failed", e).await;
            return;
        }

        for cmd in &init_inside {
            let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                continue;
            }
            if let Err(e) = subprocess.exec_inside(&name, &argv).await {
                self.fail_init(&control, &format!("init_inside command `{cmd}` failed"), e).await;
                return;
            }
        }

        // Still INIT at this point; report it before spawning the
        // tunnel controller that will eventually flip us to READY.
        control.instance_status(InstanceStatus::Init, None);

        let task = match conntype {
            ConnType::ReverseTunnel => {
                let controller = ReverseTunnelController::new(
                    instance_id.clone(),
                    name.clone(),
                    address,
                    ssh_port,
                    tunnel_pubkey,
                    tunnelkey_path,
                    subprocess.clone(),
                    control.clone(),
                    self.status.clone(),
                    self.hub_id.clone(),
                );
                tokio::spawn(controller.run(cancel.clone()))
            }
            ConnType::Vpn => {
                let controller = VpnController::new(
                    instance_id.clone(),
                    name.clone(),
                    subprocess.clone(),
                    control.clone(),
                    self.status.clone(),
                    self.hub_id.clone(),
                );
                tokio::spawn(controller.run(cancel.clone()))
            }
        };

        *self.controller_task.lock().await = Some(task);
        info!("instance {} entering tunnel setup ({:?})", instance_id, conntype);
    }

    /// Cancel the Tunnel Controller, wait for it to finish, then destroy
    /// the sandbox. Idempotent: a second call with the controller already
    /// gone simply destroys the sandbox again (the adapter's `destroy` is
    /// itself idempotent). `post_termination` commands run on the host
    /// afterward, best-effort: a failing command is logged and does not
    /// fail the destroy.
    pub async fn destroy(
        &self,
        workspace_id: &str,
        subprocess: &dyn SubprocessAdapter,
        post_termination: &[String],
    ) -> Result<()> {
        self.controller_cancel.cancel();

        if let Some(task) = self.controller_task.lock().await.take() {
            let _ = task.await;
        }

        let name = Self::sandbox_name(workspace_id);
        subprocess.destroy(&name).await?;
        *self.status.lock().await = InstanceStatus::Terminated;

        for cmd in post_termination {
            let mut parts = cmd.split_whitespace();
            let Some(program) = parts.next() else { continue };
            let args: Vec<&str> = parts.collect();
            match tokio::process::Command::new(program).args(&args).status().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!("post-termination command `{}` exited with {}", cmd, status),
                Err(e) => warn!("post-termination command `{}` failed to start: {}", cmd, e),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::{FakeScript, FakeSubprocessAdapter};
    use hardshare_common::wire::Command;
    use tokio::sync::mpsc;

    fn test_control_handle() -> (ControlHandle, mpsc::UnboundedReceiver<Command>) {
        ControlHandle::new_for_test()
    }

    #[tokio::test]
    async fn successful_launch_reports_init_then_spawns_controller() {
        let subprocess: Arc<dyn SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let (control, mut outbound) = test_control_handle();

        let instance = Instance::launch(
            "ws-1".into(),
            Provider::ProviderA,
            None,
            vec![],
            "i1".into(),
            ConnType::ReverseTunnel,
            "ssh-ed25519 AAAAuser".into(),
            vec![],
            None,
            subprocess,
            control,
        );

        // `launch` itself never emits anything; the background task does,
        // so waiting on the outbound queue also synchronizes with it.
        let first = outbound.recv().await.unwrap();
        match first {
            Command::InstanceStatus { s, mi } => {
                assert_eq!(s, Some(InstanceStatus::Init));
                assert_eq!(mi, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert_eq!(instance.current_status().await, InstanceStatus::Init);
    }

    #[tokio::test]
    async fn sandbox_creation_failure_yields_init_fail() {
        let subprocess: Arc<dyn SubprocessAdapter> = Arc::new(FakeSubprocessAdapter::new(FakeScript {
            create_fails: true,
            ..Default::default()
        }));
        let (control, mut outbound) = test_control_handle();

        let instance = Instance::launch(
            "ws-1".into(),
            Provider::ProviderA,
            None,
            vec![],
            "i1".into(),
            ConnType::ReverseTunnel,
            "ssh-ed25519 AAAAuser".into(),
            vec![],
            None,
            subprocess,
            control,
        );

        let first = outbound.recv().await.unwrap();
        assert!(matches!(
            first,
            Command::InstanceStatus {
                s: Some(InstanceStatus::InitFail),
                mi: None
            }
        ));
        assert_eq!(instance.current_status().await, InstanceStatus::InitFail);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let subprocess = Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let (control, mut outbound) = test_control_handle();

        let instance = Instance::launch(
            "ws-1".into(),
            Provider::ProviderA,
            None,
            vec![],
            "i1".into(),
            ConnType::ReverseTunnel,
            "ssh-ed25519 AAAAuser".into(),
            vec![],
            None,
            subprocess.clone() as Arc<dyn SubprocessAdapter>,
            control,
        );
        outbound.recv().await.unwrap(); // wait for provisioning to finish (INIT report)

        instance.destroy("ws-1", subprocess.as_ref(), &[]).await.unwrap();
        instance.destroy("ws-1", subprocess.as_ref(), &[]).await.unwrap();
        assert_eq!(instance.current_status().await, InstanceStatus::Terminated);
    }

    #[tokio::test]
    async fn destroy_runs_post_termination_commands_on_the_host() {
        let subprocess = Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let (control, mut outbound) = test_control_handle();

        let instance = Instance::launch(
            "ws-1".into(),
            Provider::ProviderA,
            None,
            vec![],
            "i1".into(),
            ConnType::ReverseTunnel,
            "ssh-ed25519 AAAAuser".into(),
            vec![],
            None,
            subprocess.clone() as Arc<dyn SubprocessAdapter>,
            control,
        );
        outbound.recv().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("post-termination-ran");
        let cmd = format!("touch {}", marker.display());

        instance
            .destroy("ws-1", subprocess.as_ref(), &[cmd])
            .await
            .unwrap();

        assert!(marker.exists());
    }

    #[tokio::test]
    async fn destroy_survives_a_failing_post_termination_command() {
        let subprocess = Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let (control, mut outbound) = test_control_handle();

        let instance = Instance::launch(
            "ws-1".into(),
            Provider::ProviderA,
            None,
            vec![],
            "i1".into(),
            ConnType::ReverseTunnel,
            "ssh-ed25519 AAAAuser".into(),
            vec![],
            None,
            subprocess.clone() as Arc<dyn SubprocessAdapter>,
            control,
        );
        outbound.recv().await.unwrap();

        let result = instance
            .destroy("ws-1", subprocess.as_ref(), &["false".to_string()])
            .await;

        assert!(result.is_ok());
        assert_eq!(instance.current_status().await, InstanceStatus::Terminated);
    }
}
