// Control Channel — the single persistent bidirectional stream to the
// coordinator. Owns the pending-request table (per-instance reply
// queues) and is the only writer of outbound frames: Tunnel Controllers
// never touch the websocket directly, they call methods on a
// `ControlHandle` that enqueue a frame for the writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use hardshare_common::wire::{Command, Frame};
use hardshare_common::{ConnType, Error, InstanceStatus, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::instance::Instance;
use crate::subprocess::SubprocessAdapter;

/// Fixed sleep between reconnection attempts while the coordinator is
/// unreachable. `config.reconnect_window_secs` bounds the total time
/// this is tolerated before the daemon gives up and propagates an error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

type ReplyQueue = mpsc::Sender<Command>;

/// Cheaply cloneable handle used by the Instance state machine and
/// Tunnel Controllers to emit frames and register for routed replies.
/// The control channel is the only actual writer of the websocket; this
/// handle just enqueues.
#[derive(Clone)]
pub struct ControlHandle {
    outbound: mpsc::UnboundedSender<Command>,
    pending: Arc<Mutex<HashMap<String, ReplyQueue>>>,
    /// Shared with `ControlChannel::current`. A backgrounded `Instance`
    /// provisioning task reaches INIT_FAIL long after `handle_launch`
    /// returned, so it clears itself out of this slot directly rather
    /// than relying on the control channel to notice.
    current: Arc<Mutex<Option<Arc<Instance>>>>,
}

impl ControlHandle {
    fn new(outbound: mpsc::UnboundedSender<Command>, current: Arc<Mutex<Option<Arc<Instance>>>>) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            current,
        }
    }

    /// Build a handle with no attached writer task, for unit tests that
    /// only need to observe what gets sent.
    #[cfg(test)]
    pub fn new_for_test() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, Arc::new(Mutex::new(None))), rx)
    }

    /// Clear the current-instance slot if it still holds `instance_id`.
    /// Called by a provisioning task that has just failed, so the
    /// workspace becomes eligible for another launch immediately instead
    /// of staying blocked behind a dead Instance until an explicit
    /// `INSTANCE_DESTROY`.
    pub async fn clear_current_if_matches(&self, instance_id: &str) {
        let mut current = self.current.lock().await;
        if matches!(current.as_ref(), Some(instance) if instance.instance_id == instance_id) {
            *current = None;
        }
    }

    pub fn send(&self, cmd: Command) {
        if self.outbound.send(cmd).is_err() {
            debug!("control channel writer gone; dropping outbound frame");
        }
    }

    pub fn ack(&self, mi: impl Into<String>) {
        self.send(Command::ack(mi));
    }

    pub fn nack(&self, mi: impl Into<String>) {
        self.send(Command::nack(mi));
    }

    pub fn ack_status(&self, s: InstanceStatus, mi: impl Into<String>) {
        self.send(Command::ack_status(s, mi));
    }

    pub fn ack_ping(&self, id: impl Into<String>, thid: impl Into<String>, mi: impl Into<String>) {
        self.send(Command::ack_ping(id, thid, mi));
    }

    pub fn instance_status(&self, s: InstanceStatus, mi: Option<String>) {
        self.send(Command::instance_status(s, mi));
    }

    pub fn th_search(&self, id: impl Into<String>, mode: ConnType, key: Option<String>, mi: impl Into<String>) {
        self.send(Command::ThSearch {
            id: id.into(),
            mo: mode,
            key,
            mi: mi.into(),
        });
    }

    pub fn vpn_create(&self, id: impl Into<String>, mi: impl Into<String>) {
        self.send(Command::VpnCreate {
            id: id.into(),
            config: None,
            mi: mi.into(),
        });
    }

    pub fn vpn_new_client(&self, id: impl Into<String>, mi: impl Into<String>) {
        self.send(Command::VpnNewClient {
            id: id.into(),
            config: None,
            mi: mi.into(),
        });
    }

    pub fn sshtun_delete(&self) {
        self.send(Command::SshtunDelete {});
    }

    pub fn vpn_delete(&self, id: impl Into<String>) {
        self.send(Command::VpnDelete { id: id.into() });
    }

    /// Register this instance to receive the next routed replies
    /// (`TH_ACCEPT`, `VPN_CREATE`/`VPN_NEWCLIENT` responses).
    pub async fn register_reply_waiter(&self, instance_id: &str) -> mpsc::Receiver<Command> {
        let (tx, rx) = mpsc::channel(4);
        self.pending.lock().await.insert(instance_id.to_string(), tx);
        rx
    }

    pub async fn unregister_reply_waiter(&self, instance_id: &str) {
        self.pending.lock().await.remove(instance_id);
    }

    /// Route a coordinator reply to the waiting instance's queue, if any
    /// is registered. Returns `true` if a queue accepted the message.
    async fn route_reply(&self, instance_id: &str, cmd: Command) -> bool {
        let pending = self.pending.lock().await;
        if let Some(queue) = pending.get(instance_id) {
            if queue.send(cmd).await.is_ok() {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub async fn route_reply_for_test(&self, instance_id: &str, cmd: Command) -> bool {
        self.route_reply(instance_id, cmd).await
    }
}

/// The live Instance, if any, plus the tunnel-key-on-disk precondition
/// check and the subprocess adapter shared across launches.
pub struct ControlChannel {
    config: Arc<DaemonConfig>,
    subprocess: Arc<dyn SubprocessAdapter>,
    current: Arc<Mutex<Option<Arc<Instance>>>>,
    handle: ControlHandle,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Set when a connection attempt begins failing, cleared the moment a
    /// new websocket connection is established. `run` reads this to decide
    /// whether the 20-minute reconnection window has been exceeded.
    first_loss: std::sync::Mutex<Option<Instant>>,
}

impl ControlChannel {
    pub fn new(config: Arc<DaemonConfig>, subprocess: Arc<dyn SubprocessAdapter>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));
        Self {
            config,
            subprocess,
            current: current.clone(),
            handle: ControlHandle::new(tx, current),
            outbound_rx: Mutex::new(Some(rx)),
            first_loss: std::sync::Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// Run the reconnect loop until `cancel` fires or 20 minutes of
    /// continuous reconnection failure elapse.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let reconnect_window = Duration::from_secs(self.config.reconnect_window_secs);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.run_once(&cancel).await {
                Ok(()) => return Ok(()),
                Err(Error::OperatorTermination(_)) => return Ok(()),
                Err(e) => {
                    let now = Instant::now();
                    let started_losing = *self.first_loss.lock().unwrap().get_or_insert(now);
                    warn!("control channel connection lost: {} (losing since {:?} ago)", e, started_losing.elapsed());

                    if now.duration_since(started_losing) >= reconnect_window {
                        error!("control channel reconnection abandoned after {:?}", reconnect_window);
                        return Err(Error::TransientConnectivityLoss(format!(
                            "gave up reconnecting after {:?}",
                            reconnect_window
                        )));
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let receive_timeout = Duration::from_secs(self.config.receive_timeout_secs);
        let url = format!(
            "{}/ad/{}",
            self.config.coordinator_url.trim_end_matches('/'),
            self.config.workspace.id
        );
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| Error::Other(format!("invalid coordinator url {url}: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.auth_token)
                .parse()
                .map_err(|e| Error::Other(format!("invalid auth token: {e}")))?,
        );

        info!("connecting control channel to {}", url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::TransientConnectivityLoss(e.to_string()))?;
        info!("control channel connected");
        *self.first_loss.lock().unwrap() = None;

        let (mut writer, mut reader) = ws_stream.split();

        // The outbound queue must survive across reconnects: Instances
        // and Tunnel Controllers hold clones of `self.handle` whose
        // sender end never changes, so only the receiver is borrowed for
        // the lifetime of this connection and handed back afterwards.
        let mut outbound_guard = self.outbound_rx.lock().await;
        let mut outbound_rx = outbound_guard
            .take()
            .ok_or_else(|| Error::Other("control channel writer already running".into()))?;
        drop(outbound_guard);

        let write_task = async {
            while let Some(cmd) = outbound_rx.recv().await {
                let frame = Frame::new(cmd);
                let text = serde_json::to_string(&frame)?;
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Ok::<_, Error>(())
        };

        let read_task = async {
            loop {
                let next = tokio::time::timeout(receive_timeout, reader.next()).await;
                match next {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        self.dispatch(&text).await?;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        info!("control channel closed by coordinator");
                        // A clean close is still an interruption of the
                        // session from the daemon's perspective: it is
                        // folded into the same reconnect-with-backoff path
                        // as a transient error rather than ending `run()`.
                        return Err::<(), Error>(Error::TransientConnectivityLoss(
                            "closed by coordinator".into(),
                        ));
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => return Err(Error::TransientConnectivityLoss(e.to_string())),
                    Err(_) => return Err(Error::TransientConnectivityLoss("receive timeout".into())),
                }
            }
        };

        let result = tokio::select! {
            r = read_task => r,
            r = write_task => r,
            _ = cancel.cancelled() => Err(Error::OperatorTermination("cancelled".into())),
        };

        *self.outbound_rx.lock().await = Some(outbound_rx);
        result
    }

    /// Any malformed frame or unexpected protocol version is a protocol
    /// violation: the caller tears down this connection and reconnects
    /// rather than continuing to read from a stream whose framing can no
    /// longer be trusted.
    async fn dispatch(&self, text: &str) -> Result<()> {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| Error::ProtocolViolation(format!("malformed frame: {e}")))?;
        if frame.v != hardshare_common::PROTOCOL_VERSION {
            return Err(Error::ProtocolViolation(format!(
                "unexpected version {}",
                frame.v
            )));
        }

        match &frame.command {
            Command::ThAccept { id, mi, .. } => {
                let (id, mi) = (id.clone(), mi.clone());
                self.route_to_current(&id, mi, frame.command.clone()).await;
            }
            Command::VpnCreate { id, mi, .. } | Command::VpnNewClient { id, mi, .. } => {
                let (id, mi) = (id.clone(), mi.clone());
                self.route_to_current(&id, mi, frame.command.clone()).await;
            }
            _ => match frame.command {
                Command::InstanceLaunch { id, ct, pr, mi } => self.handle_launch(id, ct, pr, mi).await,
                Command::InstanceDestroy { mi } => self.handle_destroy(mi).await,
                Command::InstanceStatus { mi, .. } => self.handle_status_query(mi).await,
                Command::ThPing { id, thid, mi } => self.handle_ping(id, thid, mi).await,
                other => debug!("ignoring device-originated echo or unsolicited frame: {:?}", other),
            },
        }

        Ok(())
    }

    async fn handle_launch(&self, id: String, ct: ConnType, pr: String, mi: String) {
        let mut current = self.current.lock().await;
        if current.is_some() {
            self.handle.nack(mi);
            return;
        }

        if ct == ConnType::ReverseTunnel {
            match &self.config.tunnelkey_path {
                None => {
                    self.handle.nack(mi);
                    return;
                }
                Some(path) if !path.exists() => {
                    warn!("configured tunnel key {} does not exist", path.display());
                    self.handle.nack(mi);
                    return;
                }
                Some(_) => {}
            }
        }

        self.handle.ack(mi);

        // `launch` returns as soon as the Instance is registered in
        // INIT; provisioning runs in the background so a slow or stuck
        // sandbox never blocks this read loop. If provisioning reaches
        // INIT_FAIL, the background task clears this slot itself via
        // `ControlHandle::clear_current_if_matches`.
        let instance = Instance::launch(
            self.config.workspace.id.clone(),
            self.config.workspace.provider,
            self.config.workspace.image.clone(),
            self.config.workspace.extra_args.clone(),
            id,
            ct,
            pr,
            self.config.workspace.init_inside.clone(),
            self.config.tunnelkey_path.clone(),
            self.subprocess.clone(),
            self.handle.clone(),
        );

        *current = Some(instance);
    }

    async fn handle_destroy(&self, mi: String) {
        let instance = self.current.lock().await.take();
        match instance {
            Some(instance) => {
                if let Err(e) = instance
                    .destroy(&self.config.workspace.id, self.subprocess.as_ref(), &self.config.workspace.post_termination)
                    .await
                {
                    warn!("destroy failed: {}", e);
                }
                self.handle.ack(mi);
            }
            None => self.handle.nack(mi),
        }
    }

    async fn handle_status_query(&self, mi: Option<String>) {
        let mi = mi.unwrap_or_default();
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(instance) => {
                let status = instance.current_status().await;
                self.handle.ack_status(status, mi);
            }
            None => self.handle.nack(mi),
        }
    }

    async fn handle_ping(&self, id: String, thid: String, mi: String) {
        let current = self.current.lock().await;
        let matches = match current.as_ref() {
            Some(instance) if instance.instance_id == id => {
                *instance.hub_id.lock().await == Some(thid.clone())
            }
            _ => false,
        };
        if matches {
            self.handle.ack_ping(id, thid, mi);
        } else {
            self.handle.nack(mi);
        }
    }

    async fn route_to_current(&self, id: &str, mi: String, cmd: Command) {
        let current = self.current.lock().await;
        let matches = matches!(current.as_ref(), Some(instance) if instance.instance_id == id);
        if matches {
            drop(current);
            if !self.handle.route_reply(id, cmd).await {
                debug!("no waiting tunnel controller for instance {} (mi {})", id, mi);
            }
        } else {
            debug!("dropping reply for unknown/mismatched instance {} (mi {})", id, mi);
        }
    }

    /// Destroy the current Instance, if any, as part of admin-socket or
    /// signal-driven shutdown.
    pub async fn destroy_current(&self) {
        if let Some(instance) = self.current.lock().await.take() {
            if let Err(e) = instance
                .destroy(&self.config.workspace.id, self.subprocess.as_ref(), &self.config.workspace.post_termination)
                .await
            {
                warn!("destroy during shutdown failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub async fn handle_launch_for_test(&self, id: String, ct: ConnType, pr: String, mi: String) {
        self.handle_launch(id, ct, pr, mi).await;
    }

    #[cfg(test)]
    pub async fn handle_ping_for_test(&self, id: String, thid: String, mi: String) {
        self.handle_ping(id, thid, mi).await;
    }

    pub async fn status_report(&self) -> Option<String> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(_) => Some(self.config.workspace.id.clone()),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardshare_common::{Provider, WorkspaceDescriptor};
    use crate::subprocess::{FakeScript, FakeSubprocessAdapter};

    fn test_config() -> Arc<DaemonConfig> {
        Arc::new(DaemonConfig {
            workspace: WorkspaceDescriptor {
                id: "ws-1".into(),
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
    async fn second_launch_without_destroy_is_rejected() {
        let subprocess: Arc<dyn SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let channel = ControlChannel::new(test_config(), subprocess);

        // VPN launches have no tunnel-key precondition, so the first
        // launch is accepted and `current` is populated immediately.
        channel.handle_launch("i1".into(), ConnType::Vpn, "pubkey".into(), "m1".into()).await;
        assert!(channel.current.lock().await.is_some());

        // Drain the ACK and the subsequent INIT status report from the
        // first launch so the NACK below is unambiguous.
        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        let ack = outbound.recv().await.unwrap();
        assert!(matches!(ack, Command::Ack { mi, .. } if mi == "m1"));
        let status = outbound.recv().await.unwrap();
        assert!(matches!(status, Command::InstanceStatus { s: Some(InstanceStatus::Init), mi: None }));
        *channel.outbound_rx.lock().await = Some(outbound);

        channel.handle_launch("i2".into(), ConnType::Vpn, "pubkey".into(), "m9".into()).await;

        // The VPN controller spawned by the first launch may also be
        // emitting TH_SEARCH concurrently; skip past anything that isn't
        // the rejection we're looking for.
        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        let rejected = loop {
            match outbound.recv().await.unwrap() {
                Command::Nack { mi } if mi == "m9" => break true,
                _ => continue,
            }
        };
        assert!(rejected);
    }

    #[tokio::test]
    async fn reverse_tunnel_launch_without_configured_key_is_nacked() {
        let subprocess: Arc<dyn SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let channel = ControlChannel::new(test_config(), subprocess);

        channel.handle_launch("i1".into(), ConnType::ReverseTunnel, "pubkey".into(), "m1".into()).await;
        assert!(channel.current.lock().await.is_none());

        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        let reply = outbound.recv().await.unwrap();
        assert!(matches!(reply, Command::Nack { mi } if mi == "m1"));
    }

    #[tokio::test]
    async fn init_fail_clears_current_so_next_launch_is_accepted() {
        let subprocess: Arc<dyn SubprocessAdapter> = Arc::new(FakeSubprocessAdapter::new(FakeScript {
            create_fails: true,
            ..Default::default()
        }));
        let channel = ControlChannel::new(test_config(), subprocess);

        channel.handle_launch("i1".into(), ConnType::Vpn, "pubkey".into(), "m1".into()).await;

        // m1: ACK, then INIT_FAIL status. The background provisioning
        // task reports these itself once sandbox creation fails.
        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        assert!(matches!(outbound.recv().await.unwrap(), Command::Ack { mi, .. } if mi == "m1"));
        assert!(matches!(
            outbound.recv().await.unwrap(),
            Command::InstanceStatus { s: Some(InstanceStatus::InitFail), mi: None }
        ));
        *channel.outbound_rx.lock().await = Some(outbound);

        // The same background task clears `current` right after
        // reporting INIT_FAIL; poll briefly rather than assume it has
        // already happened by the time the status message was received.
        for _ in 0..50 {
            if channel.current.lock().await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(channel.current.lock().await.is_none());

        // A second launch must now be accepted rather than NACKed, even
        // though the first one failed rather than being destroyed.
        channel.handle_launch("i2".into(), ConnType::Vpn, "pubkey".into(), "m2".into()).await;

        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        // m2: ACK (accepted, not NACKed) then its own INIT_FAIL.
        assert!(matches!(outbound.recv().await.unwrap(), Command::Ack { mi, .. } if mi == "m2"));
        assert!(matches!(
            outbound.recv().await.unwrap(),
            Command::InstanceStatus { s: Some(InstanceStatus::InitFail), mi: None }
        ));
    }

    #[tokio::test]
    async fn status_query_with_no_instance_is_nacked() {
        let subprocess: Arc<dyn SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let channel = ControlChannel::new(test_config(), subprocess);

        channel.handle_status_query(Some("m11".into())).await;

        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        let reply = outbound.recv().await.unwrap();
        assert!(matches!(reply, Command::Nack { mi } if mi == "m11"));
    }

    #[tokio::test]
    async fn th_ping_requires_both_id_and_thid_to_match() {
        let subprocess: Arc<dyn SubprocessAdapter> =
            Arc::new(FakeSubprocessAdapter::new(FakeScript::default()));
        let channel = ControlChannel::new(test_config(), subprocess);

        channel.handle_launch("i1".into(), ConnType::Vpn, "pubkey".into(), "m1".into()).await;

        // Drain ACK + INIT status so the TH_SEARCH below is unambiguous.
        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        assert!(matches!(outbound.recv().await.unwrap(), Command::Ack { mi, .. } if mi == "m1"));
        assert!(matches!(outbound.recv().await.unwrap(), Command::InstanceStatus { .. }));
        let search = outbound.recv().await.unwrap();
        let search_mi = match search {
            Command::ThSearch { mi, .. } => mi,
            other => panic!("expected TH_SEARCH, got {other:?}"),
        };
        *channel.outbound_rx.lock().await = Some(outbound);

        channel
            .handle
            .route_reply_for_test(
                "i1",
                Command::ThAccept {
                    id: "i1".into(),
                    hub_id: "h1".into(),
                    address: "hub.example".into(),
                    host_key: "AAAA".into(),
                    listen_port: 2210,
                    connect_port: 22,
                    connect_user: "tunnel".into(),
                    mi: search_mi,
                },
            )
            .await;

        // Let the VPN controller task process the TH_ACCEPT and record
        // the hub association on the Instance before pinging it.
        for _ in 0..50 {
            if channel
                .current
                .lock()
                .await
                .as_ref()
                .map(|i| i.hub_id.try_lock().map(|g| g.is_some()).unwrap_or(false))
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        assert!(matches!(outbound.recv().await.unwrap(), Command::Ack { .. })); // ACK for TH_ACCEPT
        let _ = outbound.recv().await; // VPN_CREATE request, not relevant here
        *channel.outbound_rx.lock().await = Some(outbound);

        channel.handle_ping_for_test("i1".into(), "h1".into(), "p1".into()).await;
        channel.handle_ping_for_test("i1".into(), "wrong-hub".into(), "p2".into()).await;

        let mut outbound = channel.outbound_rx.lock().await.take().unwrap();
        assert!(matches!(
            outbound.recv().await.unwrap(),
            Command::Ack { id: Some(id), thid: Some(thid), mi, .. } if id == "i1" && thid == "h1" && mi == "p1"
        ));
        assert!(matches!(outbound.recv().await.unwrap(), Command::Nack { mi } if mi == "p2"));
    }
}
