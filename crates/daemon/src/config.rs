// hardshare daemon - configuration
//
// Loads the immutable, per-run daemon configuration: the Workspace
// Descriptor plus the handful of daemon-only settings (coordinator
// endpoint, bearer token, tunnel key path, timeouts). The layout and
// contents of the file the configuration tool produces are outside this
// crate's scope; this module only deserializes what's already there.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use hardshare_common::WorkspaceDescriptor;

fn default_coordinator_url() -> String {
    "wss://hs.rerobots.net".to_string()
}

fn default_receive_timeout_secs() -> u64 {
    45
}

fn default_reconnect_window_secs() -> u64 {
    20 * 60
}

fn default_group_access() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub workspace: WorkspaceDescriptor,

    /// Base URL of the coordinator's control-channel endpoint, e.g.
    /// `wss://hs.rerobots.net`. The daemon appends `/ad/<workspace_id>`.
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,

    /// Bearer token identifying the device owner to the coordinator.
    pub auth_token: String,

    /// Path to the SSH private key used for the reverse-tunnel
    /// controller's outbound connection to the hub. The adjacent
    /// `<path>.pub` is read as the tunnel's public key.
    #[serde(default)]
    pub tunnelkey_path: Option<PathBuf>,

    /// Control-channel receive timeout, in seconds (spec default 45s).
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,

    /// How long continuous reconnection failure is tolerated before the
    /// daemon gives up, in seconds (spec default 20 minutes).
    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,

    /// Group-readable admin socket and runtime directory permissions.
    #[serde(default = "default_group_access")]
    pub group_access: bool,
}

impl DaemonConfig {
    /// Load daemon configuration from a TOML file at `path`.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read daemon configuration at {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("failed to parse daemon configuration")?;
        info!("loaded daemon configuration for workspace {} from {}", config.workspace.id, path.display());
        Ok(config)
    }
}

/// `~/.rerobots` — the runtime directory shared by the admin socket and
/// any daemon-written state.
pub fn runtime_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
    Ok(home.join(".rerobots"))
}

/// Filesystem path of the per-workspace admin socket.
pub fn admin_socket_path(workspace_id: &str) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("hardshare.{}.sock", workspace_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardshare_common::Provider;

    fn sample_toml() -> &'static str {
        r#"
            id = "ws-1"
            owner = "alice"
            provider = "provider_a"
            auth_token = "tok-123"
        "#
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, sample_toml()).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.workspace.id, "ws-1");
        assert_eq!(config.workspace.provider, Provider::ProviderA);
        assert_eq!(config.coordinator_url, "wss://hs.rerobots.net");
        assert_eq!(config.receive_timeout_secs, 45);
        assert_eq!(config.reconnect_window_secs, 1200);
        assert!(!config.group_access);
        assert!(config.tunnelkey_path.is_none());
    }

    #[test]
    fn admin_socket_path_is_scoped_to_workspace() {
        let path = admin_socket_path("ws-1").unwrap();
        assert!(path.to_string_lossy().ends_with("hardshare.ws-1.sock"));
    }
}
