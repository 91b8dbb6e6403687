// Subprocess Adapter — the only module that touches the outside world.
//
// Everything above this layer (Instance, Tunnel Controllers) depends on
// the `SubprocessAdapter` trait, never on `ProcessSubprocessAdapter`
// directly, so tests can inject `FakeSubprocessAdapter` and script every
// seed scenario without a real container runtime or `ssh` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hardshare_common::{Error, Provider, Result};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Handle to a long-running supervised child process.
///
/// `exit_code()` is `None` while the process is still running and
/// `Some(code)` once it has exited; a background task drives the wait
/// so callers never need to poll the OS themselves.
pub struct SupervisedChild {
    exit_code: Arc<Mutex<Option<i32>>>,
    kill_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl SupervisedChild {
    pub async fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().await
    }

    /// Request termination of the child and wait for it to exit.
    pub async fn terminate(mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        for _ in 0..20 {
            if self.exit_code().await.is_some() {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        warn!("supervised child did not exit within grace period");
    }
}

/// Result of `inspect_instance`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InspectionReport {
    pub daemon_found: bool,
    pub provider: Provider,
    pub has_instance: bool,
    pub container: Option<ContainerInfo>,
}

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub id: String,
    pub created: String,
    pub image_id: String,
    pub image_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DockerInspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Created")]
    created: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "NetworkSettings")]
    network_settings: DockerNetworkSettings,
}

#[derive(Debug, Deserialize)]
struct DockerNetworkSettings {
    #[serde(rename = "IPAddress")]
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct DockerImageInspectEntry {
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
}

#[async_trait]
pub trait SubprocessAdapter: Send + Sync {
    async fn create(&self, name: &str, provider: Provider, image: Option<&str>, extra_args: &[String]) -> Result<()>;
    async fn address(&self, name: &str, provider: Provider) -> Result<String>;
    async fn forwarded_ssh_port(&self, name: &str, timeout: Duration) -> Result<u16>;
    async fn host_key(&self, name: &str, timeout: Duration) -> Result<String>;
    async fn install_authorized_key(&self, name: &str, public_key_material: &str) -> Result<()>;
    async fn regenerate_host_keys(&self, name: &str) -> Result<()>;
    async fn exec_inside(&self, name: &str, argv: &[String]) -> Result<()>;
    async fn copy_in(&self, name: &str, local_path: &Path, remote_path: &str) -> Result<()>;
    async fn destroy(&self, name: &str) -> Result<()>;
    async fn spawn_supervised(&self, argv: &[String]) -> Result<SupervisedChild>;
    async fn inspect_instance(&self, name: &str, provider: Provider, admin_socket_live: bool) -> Result<InspectionReport>;
}

/// Production adapter: shells out to the container runtime binary and to
/// `ssh`/`docker cp`, exactly the way a real daemon has no choice but to.
pub struct ProcessSubprocessAdapter {
    /// Name of the container runtime binary (e.g. `docker`, `podman`).
    runtime_bin: String,
    /// Directory host-side files (host keys, temp key material) land in.
    work_dir: PathBuf,
}

impl ProcessSubprocessAdapter {
    pub fn new(runtime_bin: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
            work_dir,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("{} {}", self.runtime_bin, args.join(" "));
        Command::new(&self.runtime_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::SubprocessFailure(format!("{} {}: {e}", self.runtime_bin, args.join(" "))))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(Error::SubprocessFailure(format!(
                "{} {} exited with {}: {}",
                self.runtime_bin,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl SubprocessAdapter for ProcessSubprocessAdapter {
    async fn create(&self, name: &str, provider: Provider, image: Option<&str>, extra_args: &[String]) -> Result<()> {
        match provider {
            Provider::Proxy => {
                debug!("provider is Proxy; skipping sandbox creation for {}", name);
                return Ok(());
            }
            Provider::ProviderA | Provider::ProviderB => {}
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--hostname".into(),
            name.into(),
            "--name".into(),
            name.into(),
            "--device=/dev/net/tun:/dev/net/tun".into(),
            "--cap-add=NET_ADMIN".into(),
        ];
        if provider == Provider::ProviderB {
            args.push("-p".into());
            args.push("127.0.0.1::22".into());
        }
        args.extend(extra_args.iter().cloned());
        if let Some(image) = image {
            args.push(image.to_string());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs).await?;
        info!("created sandbox {} (provider {:?})", name, provider);
        Ok(())
    }

    async fn address(&self, name: &str, provider: Provider) -> Result<String> {
        if provider == Provider::ProviderB {
            return Ok("127.0.0.1".to_string());
        }
        let output = self.run_checked(&["inspect", name]).await?;
        let entries: Vec<DockerInspectEntry> = serde_json::from_slice(&output.stdout)?;
        let entry = entries
            .first()
            .ok_or_else(|| Error::SubprocessFailure(format!("inspect {name} returned no entries")))?;
        let ip = entry.network_settings.ip_address.clone();
        if hardshare_common::is_loopback(&ip) {
            warn!(
                "sandbox {} reported loopback address {} from provider_a; reverse tunnel forwarding needs a routable address",
                name, ip
            );
        }
        Ok(ip)
    }

    async fn forwarded_ssh_port(&self, name: &str, timeout: Duration) -> Result<u16> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let output = self.run(&["port", name, "22"]).await?;
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Some(port_str) = text.trim().rsplit(':').next() {
                    if let Ok(port) = port_str.trim().parse::<u16>() {
                        return Ok(port);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("forwarded ssh port for {name}")));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn host_key(&self, name: &str, timeout: Duration) -> Result<String> {
        let dest = self.work_dir.join(format!("{name}.ssh_host_ecdsa_key.pub"));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let output = self
                .run(&[
                    "cp",
                    &format!("{name}:/etc/ssh/ssh_host_ecdsa_key.pub"),
                    &dest.to_string_lossy(),
                ])
                .await?;
            if output.status.success() && dest.exists() {
                return tokio::fs::read_to_string(&dest).await.map_err(Error::Io);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("host key for {name}")));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn install_authorized_key(&self, name: &str, public_key_material: &str) -> Result<()> {
        self.exec_inside(name, &["mkdir".into(), "-p".into(), "/root/.ssh".into()])
            .await?;

        let local_path = self.work_dir.join(format!("{name}.authorized_keys"));
        tokio::fs::write(&local_path, public_key_material).await?;
        self.copy_in(name, &local_path, "/root/.ssh/authorized_keys").await?;
        let _ = tokio::fs::remove_file(&local_path).await;

        self.exec_inside(
            name,
            &[
                "chown".into(),
                "-R".into(),
                "root:root".into(),
                "/root/.ssh".into(),
            ],
        )
        .await
    }

    async fn regenerate_host_keys(&self, name: &str) -> Result<()> {
        self.exec_inside(
            name,
            &[
                "sh".into(),
                "-c".into(),
                "rm -f /etc/ssh/ssh_host_*".into(),
            ],
        )
        .await?;
        self.exec_inside(name, &["ssh-keygen".into(), "-A".into()]).await
    }

    async fn exec_inside(&self, name: &str, argv: &[String]) -> Result<()> {
        let mut args: Vec<String> = vec!["exec".into(), name.into()];
        args.extend(argv.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs).await?;
        Ok(())
    }

    async fn copy_in(&self, name: &str, local_path: &Path, remote_path: &str) -> Result<()> {
        self.run_checked(&[
            "cp",
            &local_path.to_string_lossy(),
            &format!("{name}:{remote_path}"),
        ])
        .await?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let output = self.run(&["rm", "-f", name]).await?;
        if !output.status.success() {
            debug!(
                "rm -f {} reported non-zero (already gone?): {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn spawn_supervised(&self, argv: &[String]) -> Result<SupervisedChild> {
        if argv.is_empty() {
            return Err(Error::SubprocessFailure("empty argv for spawn_supervised".into()));
        }
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).stdin(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| Error::SubprocessFailure(format!("spawn {}: {e}", argv.join(" "))))?;

        let exit_code = Arc::new(Mutex::new(None));
        let exit_code_task = exit_code.clone();
        let (kill_tx, mut kill_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                    *exit_code_task.lock().await = Some(code);
                }
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    let status = child.wait().await;
                    let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                    *exit_code_task.lock().await = Some(code);
                }
            }
        });

        Ok(SupervisedChild {
            exit_code,
            kill_tx: Some(kill_tx),
        })
    }

    async fn inspect_instance(&self, name: &str, provider: Provider, admin_socket_live: bool) -> Result<InspectionReport> {
        let inspect = self.run(&["inspect", name]).await?;
        if !inspect.status.success() {
            return Ok(InspectionReport {
                daemon_found: admin_socket_live,
                provider,
                has_instance: false,
                container: None,
            });
        }

        let entries: Vec<DockerInspectEntry> = serde_json::from_slice(&inspect.stdout)?;
        let entry = entries
            .first()
            .ok_or_else(|| Error::SubprocessFailure(format!("inspect {name} returned no entries")))?;

        let image_tags = match self.run(&["image", "inspect", &entry.image]).await {
            Ok(out) if out.status.success() => serde_json::from_slice::<Vec<DockerImageInspectEntry>>(&out.stdout)
                .ok()
                .and_then(|v| v.into_iter().next())
                .map(|e| e.repo_tags)
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        Ok(InspectionReport {
            daemon_found: admin_socket_live,
            provider,
            has_instance: true,
            container: Some(ContainerInfo {
                name: name.to_string(),
                id: entry.id.clone(),
                created: entry.created.clone(),
                image_id: entry.image.clone(),
                image_tags,
            }),
        })
    }
}

/// Script of responses for a `FakeSubprocessAdapter`, scoped to one test.
#[derive(Default)]
pub struct FakeScript {
    pub address: Option<String>,
    pub forwarded_ssh_port: Option<u16>,
    pub host_key: Option<String>,
    pub create_fails: bool,
    pub host_key_times_out: bool,
}

/// Records every call made through it; used by instance/tunnel tests to
/// assert on what the state machine actually did without touching a
/// real container runtime.
pub struct FakeSubprocessAdapter {
    script: Mutex<FakeScript>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSubprocessAdapter {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn record(&self, call: impl Into<String>) {
        self.calls.lock().await.push(call.into());
    }
}

#[async_trait]
impl SubprocessAdapter for FakeSubprocessAdapter {
    async fn create(&self, name: &str, _provider: Provider, _image: Option<&str>, _extra_args: &[String]) -> Result<()> {
        self.record(format!("create {name}")).await;
        if self.script.lock().await.create_fails {
            return Err(Error::SubprocessFailure("fake create failure".into()));
        }
        Ok(())
    }

    async fn address(&self, name: &str, _provider: Provider) -> Result<String> {
        self.record(format!("address {name}")).await;
        Ok(self
            .script
            .lock()
            .await
            .address
            .clone()
            .unwrap_or_else(|| "10.0.0.5".to_string()))
    }

    async fn forwarded_ssh_port(&self, name: &str, _timeout: Duration) -> Result<u16> {
        self.record(format!("forwarded_ssh_port {name}")).await;
        Ok(self.script.lock().await.forwarded_ssh_port.unwrap_or(32768))
    }

    async fn host_key(&self, name: &str, _timeout: Duration) -> Result<String> {
        self.record(format!("host_key {name}")).await;
        if self.script.lock().await.host_key_times_out {
            return Err(Error::Timeout(format!("host key for {name}")));
        }
        Ok(self
            .script
            .lock()
            .await
            .host_key
            .clone()
            .unwrap_or_else(|| "ssh-ecdsa AAAAfake".to_string()))
    }

    async fn install_authorized_key(&self, name: &str, _public_key_material: &str) -> Result<()> {
        self.record(format!("install_authorized_key {name}")).await;
        Ok(())
    }

    async fn regenerate_host_keys(&self, name: &str) -> Result<()> {
        self.record(format!("regenerate_host_keys {name}")).await;
        Ok(())
    }

    async fn exec_inside(&self, name: &str, argv: &[String]) -> Result<()> {
        self.record(format!("exec_inside {name} {}", argv.join(" "))).await;
        Ok(())
    }

    async fn copy_in(&self, name: &str, _local_path: &Path, remote_path: &str) -> Result<()> {
        self.record(format!("copy_in {name} {remote_path}")).await;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.record(format!("destroy {name}")).await;
        Ok(())
    }

    async fn spawn_supervised(&self, argv: &[String]) -> Result<SupervisedChild> {
        self.record(format!("spawn_supervised {}", argv.join(" "))).await;
        let exit_code = Arc::new(Mutex::new(None));
        let (kill_tx, mut kill_rx) = tokio::sync::oneshot::channel();
        let exit_code_task = exit_code.clone();
        tokio::spawn(async move {
            let _ = (&mut kill_rx).await;
            *exit_code_task.lock().await = Some(0);
        });
        Ok(SupervisedChild {
            exit_code,
            kill_tx: Some(kill_tx),
        })
    }

    async fn inspect_instance(&self, name: &str, provider: Provider, admin_socket_live: bool) -> Result<InspectionReport> {
        self.record(format!("inspect_instance {name}")).await;
        Ok(InspectionReport {
            daemon_found: admin_socket_live,
            provider,
            has_instance: true,
            container: Some(ContainerInfo {
                name: name.to_string(),
                id: "fake-id".to_string(),
                created: "2026-01-01T00:00:00Z".to_string(),
                image_id: "fake-image".to_string(),
                image_tags: vec!["fake:latest".to_string()],
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_adapter_records_create_and_destroy() {
        let adapter = FakeSubprocessAdapter::new(FakeScript::default());
        adapter.create("ws-1", Provider::ProviderA, None, &[]).await.unwrap();
        adapter.destroy("ws-1").await.unwrap();

        let calls = adapter.calls.lock().await;
        assert_eq!(calls.as_slice(), ["create ws-1", "destroy ws-1"]);
    }

    #[tokio::test]
    async fn fake_adapter_honors_scripted_failure() {
        let adapter = FakeSubprocessAdapter::new(FakeScript {
            create_fails: true,
            ..Default::default()
        });
        let result = adapter.create("ws-1", Provider::ProviderA, None, &[]).await;
        assert!(matches!(result, Err(Error::SubprocessFailure(_))));
    }

    #[tokio::test]
    async fn fake_adapter_honors_scripted_timeout() {
        let adapter = FakeSubprocessAdapter::new(FakeScript {
            host_key_times_out: true,
            ..Default::default()
        });
        let result = adapter.host_key("ws-1", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn spawn_supervised_reports_exit_after_terminate() {
        let adapter = FakeSubprocessAdapter::new(FakeScript::default());
        let child = adapter.spawn_supervised(&["fake".into()]).await.unwrap();
        assert_eq!(child.exit_code().await, None);
        child.terminate().await;
    }
}
