//! Persistent identity of what is shared: the Workspace Descriptor.
//!
//! Mutated only by the external configuration tool; the daemon reads it
//! once at startup and treats it as immutable for the run.

use serde::{Deserialize, Serialize};

/// Container provider backing a sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    ProviderA,
    ProviderB,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    /// Opaque identifier, globally unique.
    pub id: String,
    pub owner: String,
    pub provider: Provider,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub init_inside: Vec<String>,
    /// Commands run on the host, not inside the sandbox, after the
    /// Instance has been destroyed (e.g. releasing a loopback port
    /// reservation, tearing down a host-side bridge).
    #[serde(default)]
    pub post_termination: Vec<String>,
}

/// Connection strategy requested for an Instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    #[serde(rename = "sshtun")]
    ReverseTunnel,
    Vpn,
}

/// Lifecycle status of an Instance. Monotone: INIT -> READY,
/// INIT -> INIT_FAIL; TERMINATED is an absorbing successor of any state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Init,
    Ready,
    InitFail,
    Terminated,
}

/// Record returned by the coordinator identifying a rendezvous hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHubAssociation {
    pub hub_id: String,
    pub address: String,
    pub host_key: String,
    pub listen_port: u16,
    pub connect_port: u16,
    pub connect_user: String,
}
