use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostbridge_protocol::{HostCommand, OutgoingEnvelope};
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::connection::{self, ConnectionManager, LinkEvents, LinkState};
use crate::correlator::{Correlator, Ticket};
use crate::error::{BridgeError, BridgeResult};
use crate::interpreter::{ProgressEvent, ProgressInterpreter};
use crate::session::ChannelSession;

/// Client side of the bridge. Cheap to clone; all clones share one
/// connection, one pending table and one joined channel.
#[derive(Clone)]
pub struct HostBridge {
    inner: Arc<Inner>,
}

struct Inner {
    config: BridgeConfig,
    manager: Arc<ConnectionManager>,
    state: Arc<BridgeState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Per-connection state touched by the connection task.
struct BridgeState {
    correlator: Correlator,
    interpreter: ProgressInterpreter,
    channel: ChannelSession,
}

impl LinkEvents for BridgeState {
    fn on_open(&self) {
        self.channel.clear();
    }

    fn on_message(&self, text: &str) {
        self.interpreter.handle(text);
    }

    fn on_error(&self, err: &BridgeError) {
        tracing::debug!(err = %err, pending = self.correlator.len(), "link error");
    }

    fn on_close(&self) {
        let swept = self.correlator.fail_all();
        if swept > 0 {
            tracing::warn!(swept, "rejected pending requests after connection loss");
        }
        self.channel.clear();
    }
}

impl HostBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let correlator = Correlator::new(config.inactivity_window());
        let interpreter = ProgressInterpreter::new(correlator.clone(), config.progress_buffer);
        let manager = Arc::new(ConnectionManager::new(
            config.endpoint(),
            config.reconnect_delay(),
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                manager,
                state: Arc::new(BridgeState {
                    correlator,
                    interpreter,
                    channel: ChannelSession::new(),
                }),
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Start the connection task. Calling again while it runs only cuts a
    /// pending reconnect delay short. Must be called inside a tokio runtime.
    pub fn connect(&self) {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!("bridge is shut down, not connecting");
            return;
        }
        let mut task = self.inner.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(running) = task.as_ref()
            && !running.is_finished()
        {
            self.inner.manager.retry_now();
            return;
        }
        *task = Some(tokio::spawn(connection::run(
            Arc::clone(&self.inner.manager),
            Arc::clone(&self.inner.state) as Arc<dyn LinkEvents>,
            self.inner.shutdown.clone(),
        )));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.manager.is_open()
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.manager.state()
    }

    pub fn current_channel(&self) -> Option<String> {
        self.inner.state.channel.current()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.correlator.len()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.state.interpreter.subscribe()
    }

    /// Wait until the link is open.
    pub async fn wait_connected(&self, timeout: Duration) -> BridgeResult<()> {
        let mut states = self.inner.manager.subscribe();
        let opened = tokio::time::timeout(timeout, async move {
            states.wait_for(|s| *s == LinkState::Open).await.is_ok()
        })
        .await;
        match opened {
            Ok(true) => Ok(()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Send `command` and wait for its terminal frame, using the configured
    /// timeout (the join timeout for `join`).
    pub async fn invoke(
        &self,
        command: impl Into<HostCommand>,
        params: Value,
    ) -> BridgeResult<Value> {
        let command = command.into();
        let timeout = if command.is_bootstrap() {
            self.inner.config.join_timeout()
        } else {
            self.inner.config.command_timeout()
        };
        self.invoke_with_timeout(command, params, timeout).await
    }

    pub async fn invoke_with_timeout(
        &self,
        command: impl Into<HostCommand>,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        let ticket = self.dispatch(command.into(), params, timeout)?;
        ticket.outcome().await
    }

    /// Join `channel`; it is recorded only once the host acknowledges.
    pub async fn join(&self, channel: &str) -> BridgeResult<Value> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(BridgeError::invalid("channel name must not be empty"));
        }
        let session = &self.inner.state.channel;
        let epoch = session.epoch();
        let ack = self
            .invoke(HostCommand::Join, json!({ "channel": channel }))
            .await?;
        // A reconnect after the ack means the new link never joined.
        session.set_if_epoch(epoch, channel);
        Ok(ack)
    }

    /// Stop reconnecting, close the socket and reject anything pending.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(err = %e, "connection task ended abnormally");
        }
        self.inner.state.on_close();
        tracing::info!("bridge shut down");
    }

    fn dispatch(
        &self,
        command: HostCommand,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<Ticket> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(BridgeError::invalid(format!(
                    "params must be a JSON object, got {other}"
                )));
            }
        };

        if !self.inner.manager.is_open() {
            tracing::info!(command = %command, "not connected, attempting to connect");
            self.connect();
            return Err(BridgeError::NotConnected);
        }

        let channel = if command.is_bootstrap() {
            params
                .get("channel")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .ok_or_else(|| BridgeError::invalid("join requires a channel"))?
        } else {
            self.inner.state.channel.require()?
        };

        let id = uuid::Uuid::new_v4().to_string();
        let envelope = OutgoingEnvelope::new(id.clone(), command.clone(), channel, params);
        let text = serde_json::to_string(&envelope)
            .map_err(|e| BridgeError::invalid(format!("unserializable params: {e}")))?;

        let correlator = &self.inner.state.correlator;
        let ticket = correlator.register(id.clone(), command.clone(), timeout);
        if let Err(e) = self.inner.manager.send(text) {
            correlator.discard(&id);
            tracing::warn!(id = %id, command = %command, "send failed, link went away");
            return Err(e);
        }
        tracing::info!(
            id = %id,
            command = %command,
            channel = %envelope.channel,
            timeout_ms = timeout.as_millis() as u64,
            "sent command"
        );
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_protocol::{
        EnvelopeType, ProgressFrame, ResponseFrame, chunking::ChunkedScan,
    };
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// A bridge whose link is an in-memory channel instead of a socket.
    fn fake_bridge() -> (HostBridge, mpsc::UnboundedReceiver<String>) {
        let bridge = HostBridge::new(BridgeConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        bridge.inner.manager.attach(tx);
        (bridge, rx)
    }

    fn deliver(bridge: &HostBridge, frame: &impl serde::Serialize) {
        let text = serde_json::to_string(frame).unwrap();
        bridge.inner.state.on_message(&text);
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<String>) -> OutgoingEnvelope {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn no_channel_puts_nothing_on_the_wire() {
        let (bridge, mut rx) = fake_bridge();
        let err = bridge
            .invoke("get_styles", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NoChannel);
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnected_invoke_fails_fast() {
        let mut config = BridgeConfig::default();
        // Nothing listens on port 1.
        config.url = Some("ws://127.0.0.1:1".into());
        config.reconnect_delay_ms = 10_000;
        let bridge = HostBridge::new(config);

        let err = bridge.invoke("get_styles", json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::NotConnected);
        assert_eq!(bridge.pending_count(), 0);
        bridge.shutdown().await;
        assert_eq!(bridge.link_state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn envelope_mirrors_one_id() {
        let (bridge, mut rx) = fake_bridge();
        bridge.inner.state.channel.set("design");
        let ticket = bridge
            .dispatch(HostCommand::GetNodeInfo, json!({"nodeId": "1:2"}), Duration::from_secs(5))
            .unwrap();

        let envelope = sent(&mut rx);
        assert_eq!(envelope.kind, EnvelopeType::Message);
        assert_eq!(envelope.channel, "design");
        assert_eq!(envelope.id, ticket.id());
        assert_eq!(envelope.message.id, ticket.id());
        assert_eq!(envelope.command_id(), Some(ticket.id()));
        assert_eq!(envelope.message.params["nodeId"], "1:2");
    }

    #[tokio::test]
    async fn join_records_channel_on_ack() {
        let (bridge, mut rx) = fake_bridge();
        let joining = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.join("design").await })
        };
        let envelope: OutgoingEnvelope =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.kind, EnvelopeType::Join);
        assert_eq!(envelope.channel, "design");
        assert!(bridge.current_channel().is_none());

        deliver(&bridge, &ResponseFrame::result(envelope.id, json!({"joined": "design"})));
        joining.await.unwrap().unwrap();
        assert_eq!(bridge.current_channel().as_deref(), Some("design"));
    }

    #[tokio::test]
    async fn join_ack_after_reconnect_is_not_recorded() {
        let (bridge, mut rx) = fake_bridge();
        let joining = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.join("design").await })
        };
        let envelope: OutgoingEnvelope =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();

        // The ack lands, then the link cycles before the join task resumes.
        deliver(&bridge, &ResponseFrame::result(envelope.id, json!({"joined": "design"})));
        bridge.inner.state.on_close();
        bridge.inner.state.on_open();

        joining.await.unwrap().unwrap();
        assert!(bridge.current_channel().is_none());
    }

    #[tokio::test]
    async fn join_rejects_blank_name() {
        let (bridge, mut rx) = fake_bridge();
        assert!(matches!(
            bridge.join("  ").await,
            Err(BridgeError::InvalidParams(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_object_params_are_rejected() {
        let (bridge, _rx) = fake_bridge();
        bridge.inner.state.channel.set("design");
        assert!(matches!(
            bridge.invoke("get_styles", json!([1, 2])).await,
            Err(BridgeError::InvalidParams(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_is_two_minutes() {
        let (bridge, _rx) = fake_bridge();
        bridge.inner.state.channel.set("design");
        let start = Instant::now();

        let err = bridge.invoke("get_styles", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 120_000, .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(120_000));
        assert!(elapsed < Duration::from_millis(121_000));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_keeps_request_alive() {
        let (bridge, mut rx) = fake_bridge();
        bridge.inner.state.channel.set("design");
        let mut progress = bridge.subscribe_progress();
        let ticket = bridge
            .dispatch(HostCommand::ScanTextNodes, json!({"nodeId": "0:1"}), Duration::from_secs(120))
            .unwrap();
        let id = sent(&mut rx).id;

        tokio::time::advance(Duration::from_secs(119)).await;
        let mut scan = ChunkedScan::new(id.clone(), "scan_text_nodes", 10);
        deliver(&bridge, &ProgressFrame::new(id.clone(), scan.start("Starting").unwrap()));

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bridge.pending_count(), 1);
        assert_eq!(progress.recv().await.unwrap().request_id, id);

        deliver(&bridge, &ResponseFrame::result(id, json!({"done": true})));
        assert_eq!(ticket.outcome().await.unwrap(), json!({"done": true}));
    }

    #[tokio::test]
    async fn close_sweeps_every_pending_request() {
        let (bridge, _rx) = fake_bridge();
        bridge.inner.state.channel.set("design");
        let tickets: Vec<Ticket> = (0..3)
            .map(|_| {
                bridge
                    .dispatch(HostCommand::GetSelection, json!({}), Duration::from_secs(60))
                    .unwrap()
            })
            .collect();
        assert_eq!(bridge.pending_count(), 3);

        bridge.inner.manager.detach();
        bridge.inner.state.on_close();

        for ticket in tickets {
            assert_eq!(ticket.outcome().await, Err(BridgeError::ConnectionClosed));
        }
        assert_eq!(bridge.pending_count(), 0);
        assert!(bridge.current_channel().is_none());
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn host_error_surfaces_verbatim() {
        let (bridge, mut rx) = fake_bridge();
        bridge.inner.state.channel.set("design");
        let ticket = bridge
            .dispatch(HostCommand::GetNodeInfo, json!({"nodeId": "9:9"}), Duration::from_secs(5))
            .unwrap();
        let id = sent(&mut rx).id;

        deliver(&bridge, &ResponseFrame::error(id.clone(), "Node not found: 9:9"));
        // A duplicate terminal for the same id is inert.
        deliver(&bridge, &ResponseFrame::result(id, json!(1)));
        assert_eq!(
            ticket.outcome().await,
            Err(BridgeError::HostError("Node not found: 9:9".into()))
        );
    }
}
