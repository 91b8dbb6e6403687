//! The coordinator wire format: every frame is a text object with an
//! integer `v` (must equal 0), a string `cmd`, and (for most commands) a
//! correlation field `mi`. Unknown `cmd` or wrong `v` is a protocol
//! violation and closes the connection.

use serde::{Deserialize, Serialize};

use crate::workspace::{ConnType, InstanceStatus};

pub const PROTOCOL_VERSION: u8 = 0;

/// One frame on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub v: u8,
    #[serde(flatten)]
    pub command: Command,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    #[serde(rename = "INSTANCE_LAUNCH")]
    InstanceLaunch {
        id: String,
        ct: ConnType,
        pr: String,
        mi: String,
    },

    #[serde(rename = "INSTANCE_DESTROY")]
    InstanceDestroy { mi: String },

    #[serde(rename = "INSTANCE_STATUS")]
    InstanceStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        s: Option<InstanceStatus>,
        /// Present when this status report answers a specific
        /// `INSTANCE_STATUS` query; absent for the daemon's own
        /// unsolicited transition reports (e.g. the READY announcement).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mi: Option<String>,
    },

    #[serde(rename = "TH_SEARCH")]
    ThSearch {
        id: String,
        mo: ConnType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        mi: String,
    },

    #[serde(rename = "TH_ACCEPT")]
    ThAccept {
        id: String,
        hub_id: String,
        address: String,
        host_key: String,
        listen_port: u16,
        connect_port: u16,
        connect_user: String,
        mi: String,
    },

    #[serde(rename = "TH_PING")]
    ThPing { id: String, thid: String, mi: String },

    #[serde(rename = "ACK")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        s: Option<InstanceStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        mi: String,
    },

    #[serde(rename = "NACK")]
    Nack { mi: String },

    #[serde(rename = "SSHTUN_DELETE")]
    SshtunDelete {},

    #[serde(rename = "VPN_CREATE")]
    VpnCreate {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<String>,
        mi: String,
    },

    #[serde(rename = "VPN_NEWCLIENT")]
    VpnNewClient {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<String>,
        mi: String,
    },

    #[serde(rename = "VPN_DELETE")]
    VpnDelete { id: String },
}

impl Command {
    /// The correlation identifier carried by this command, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Command::InstanceLaunch { mi, .. }
            | Command::InstanceDestroy { mi }
            | Command::ThSearch { mi, .. }
            | Command::ThAccept { mi, .. }
            | Command::ThPing { mi, .. }
            | Command::Ack { mi, .. }
            | Command::Nack { mi }
            | Command::VpnCreate { mi, .. }
            | Command::VpnNewClient { mi, .. } => Some(mi),
            Command::InstanceStatus { mi, .. } => mi.as_deref(),
            Command::SshtunDelete {} | Command::VpnDelete { .. } => None,
        }
    }

    /// The instance identifier this command targets, if any.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Command::ThSearch { id, .. }
            | Command::ThAccept { id, .. }
            | Command::ThPing { id, .. }
            | Command::VpnCreate { id, .. }
            | Command::VpnNewClient { id, .. }
            | Command::VpnDelete { id } => Some(id),
            Command::Ack { id, .. } => id.as_deref(),
            _ => None,
        }
    }

    pub fn instance_status(s: InstanceStatus, mi: Option<String>) -> Self {
        Command::InstanceStatus { s: Some(s), mi }
    }

    pub fn ack(mi: impl Into<String>) -> Self {
        Command::Ack {
            s: None,
            thid: None,
            id: None,
            mi: mi.into(),
        }
    }

    pub fn nack(mi: impl Into<String>) -> Self {
        Command::Nack { mi: mi.into() }
    }

    /// `ACK` carrying the current status, for replies to `INSTANCE_STATUS`.
    pub fn ack_status(s: InstanceStatus, mi: impl Into<String>) -> Self {
        Command::Ack {
            s: Some(s),
            thid: None,
            id: None,
            mi: mi.into(),
        }
    }

    /// `ACK` carrying `thid`/`id`, for replies to `TH_PING`.
    pub fn ack_ping(id: impl Into<String>, thid: impl Into<String>, mi: impl Into<String>) -> Self {
        Command::Ack {
            s: None,
            thid: Some(thid.into()),
            id: Some(id.into()),
            mi: mi.into(),
        }
    }
}
