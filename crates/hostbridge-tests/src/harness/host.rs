//! In-process execution host speaking the relay wire format.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use hostbridge::BridgeConfig;
use hostbridge_protocol::chunking::{ChunkedScan, DEFAULT_CHUNK_SIZE, collect_chunk};
use hostbridge_protocol::{
    HostCommand, OutgoingEnvelope, ProgressFrame, ProgressPayload, RequestId, ResponseFrame,
};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::document::{DocumentNode, sample_page};

/// Behaviour knobs for [`MockHost`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Pause between chunks of a scan.
    pub chunk_pause: Duration,
    /// Spacing of `slow_progress` updates.
    pub progress_interval: Duration,
    /// Echo every received envelope back, as a relay does.
    pub relay_echo: bool,
    pub document: DocumentNode,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            chunk_pause: Duration::from_millis(10),
            progress_interval: Duration::from_millis(20),
            relay_echo: false,
            document: sample_page(25),
        }
    }
}

struct Shared {
    options: HostOptions,
    received: Mutex<Vec<OutgoingEnvelope>>,
    connections: AtomicUsize,
    kill: broadcast::Sender<()>,
}

/// A websocket execution host on a random local port.
pub struct MockHost {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockHost {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(HostOptions::default()).await
    }

    pub async fn spawn_with(options: HostOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock host")?;
        let addr = listener.local_addr()?;
        let (kill, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            options,
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            kill,
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));
        Ok(Self {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Bridge config pointed at this host with a short reconnect delay.
    pub fn config(&self) -> BridgeConfig {
        BridgeConfig {
            url: Some(self.url()),
            reconnect_delay_ms: 50,
            ..BridgeConfig::default()
        }
    }

    /// Every envelope received so far, in arrival order.
    pub fn received(&self) -> Vec<OutgoingEnvelope> {
        self.shared
            .received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of websocket connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Drop every open client connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.shared.kill.send(());
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.drop_connections();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, shared).await {
                        tracing::debug!(peer = %peer, err = %e, "mock host connection ended");
                    }
                });
            }
        }
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake")?;
    let mut kill = shared.kill.subscribe();
    shared.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            _ = kill.recv() => return Ok(()),
            Some(text) = rx.recv() => sink.send(Message::text(text)).await?,
            inbound = source.next() => match inbound {
                Some(Ok(Message::Text(text))) => accept_envelope(&shared, text.as_str(), &tx),
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

fn accept_envelope(shared: &Arc<Shared>, text: &str, tx: &mpsc::UnboundedSender<String>) {
    let envelope: OutgoingEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(err = %e, "mock host got an unparseable envelope");
            return;
        }
    };
    shared
        .received
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(envelope.clone());

    if shared.options.relay_echo {
        let _ = tx.send(text.to_string());
    }
    tokio::spawn(run_command(Arc::clone(shared), envelope, tx.clone()));
}

/// Writes frames for one command back to its connection.
struct Reply {
    id: RequestId,
    tx: mpsc::UnboundedSender<String>,
}

impl Reply {
    fn progress(&self, payload: ProgressPayload) {
        self.send(&ProgressFrame::new(self.id.clone(), payload));
    }

    fn result(&self, result: Value) {
        self.send(&ResponseFrame::result(self.id.clone(), result));
    }

    fn error(&self, message: impl Into<String>) {
        self.send(&ResponseFrame::error(self.id.clone(), message));
    }

    fn send(&self, frame: &impl serde::Serialize) {
        match serde_json::to_string(frame) {
            // The client may already be gone.
            Ok(text) => {
                let _ = self.tx.send(text);
            }
            Err(e) => tracing::warn!(err = %e, "mock host failed to encode a frame"),
        }
    }
}

async fn run_command(shared: Arc<Shared>, envelope: OutgoingEnvelope, tx: mpsc::UnboundedSender<String>) {
    let reply = Reply {
        id: envelope.message.id.clone(),
        tx,
    };
    let params = envelope.message.params;
    match &envelope.message.command {
        HostCommand::Join => reply.result(json!({ "channel": envelope.channel, "joined": true })),
        HostCommand::GetDocumentInfo => {
            let document = &shared.options.document;
            reply.result(json!({
                "id": document.id,
                "name": document.name,
                "type": document.kind.as_str(),
                "nodeCount": document.count(),
            }));
        }
        HostCommand::ScanTextNodes => scan_text_nodes(&shared, &reply, &params).await,
        HostCommand::ExportNodeAsImage => export_node(&shared, &reply, &params),
        HostCommand::Other(name) => match name.as_str() {
            "echo" => reply.result(Value::Object(params)),
            "fail" => reply.error(
                params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("command failed"),
            ),
            "silent" => {}
            "slow_progress" => slow_progress(&shared, &reply, &params).await,
            other => reply.error(format!("Unknown command: {other}")),
        },
        other => reply.error(format!("Unknown command: {other}")),
    }
}

async fn scan_text_nodes(shared: &Shared, reply: &Reply, params: &Map<String, Value>) {
    let node_id = params.get("nodeId").and_then(Value::as_str).unwrap_or_default();
    let use_chunking = params.get("useChunking").and_then(Value::as_bool).unwrap_or(true);
    let chunk_size = params
        .get("chunkSize")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    let mut scan = ChunkedScan::new(reply.id.clone(), "scan_text_nodes", chunk_size);
    // Transitions below are always issued in order.
    let Ok(started) = scan.start(format!("Starting scan of node {node_id}")) else {
        return;
    };
    reply.progress(started);

    let Some(root) = shared.options.document.find(node_id) else {
        let message = format!("Node not found: {node_id}");
        reply.progress(scan.fail(message.clone(), json!({ "error": message })));
        reply.error(message);
        return;
    };
    let nodes = root.visible_nodes();

    if !use_chunking {
        let text_nodes = collect_chunk(&nodes, |node| node.text_info());
        let found = text_nodes.len();
        if let Ok(done) = scan.complete(
            format!("Scan complete. Found {found} text nodes."),
            found,
            json!({ "textNodesFound": found }),
        ) {
            reply.progress(done);
        }
        reply.result(json!({
            "success": true,
            "message": format!("Scanned {found} text nodes."),
            "count": found,
            "textNodes": text_nodes,
            "commandId": reply.id,
        }));
        return;
    }

    let Ok(collected) = scan.collected(
        nodes.len(),
        format!("Found {} nodes to scan", nodes.len()),
    ) else {
        return;
    };
    reply.progress(collected);

    let Some(plan) = scan.plan() else { return };
    let mut text_nodes = Vec::new();
    for index in 0..plan.total_chunks() {
        let Some(range) = plan.bounds(index) else { break };
        let chunk = &nodes[range];
        let found = collect_chunk(chunk, |node| node.text_info());
        text_nodes.extend(found.iter().cloned());
        if let Ok(update) = scan.chunk_done(chunk.len(), text_nodes.len(), json!(found)) {
            reply.progress(update);
        }
        if index + 1 < plan.total_chunks() && !shared.options.chunk_pause.is_zero() {
            tokio::time::sleep(shared.options.chunk_pause).await;
        }
    }

    let found = text_nodes.len();
    let processed = scan.processed_items();
    let chunks = plan.total_chunks();
    // The completed update only summarizes; the nodes travel in the terminal frame.
    if let Ok(done) = scan.complete(
        format!("Scan complete. Found {found} text nodes."),
        found,
        json!({ "textNodesFound": found, "processedNodes": processed, "chunks": chunks }),
    ) {
        reply.progress(done);
    }
    reply.result(json!({
        "success": true,
        "message": format!("Chunked scan complete. Found {found} text nodes."),
        "totalNodes": found,
        "processedNodes": processed,
        "chunks": chunks,
        "textNodes": text_nodes,
        "commandId": reply.id,
    }));
}

/// Eight bytes of PNG signature, base64-encoded.
pub const PNG_SIGNATURE_B64: &str = "iVBORw0KGgo=";

fn export_node(shared: &Shared, reply: &Reply, params: &Map<String, Value>) {
    let node_id = params.get("nodeId").and_then(Value::as_str).unwrap_or_default();
    if shared.options.document.find(node_id).is_none() {
        reply.error(format!("Node not found: {node_id}"));
        return;
    }
    let mime_type = match params.get("format").and_then(Value::as_str).unwrap_or("PNG") {
        "JPG" => "image/jpeg",
        "SVG" => "image/svg+xml",
        "PDF" => "application/pdf",
        _ => "image/png",
    };
    reply.result(json!({ "imageData": PNG_SIGNATURE_B64, "mimeType": mime_type }));
}

async fn slow_progress(shared: &Shared, reply: &Reply, params: &Map<String, Value>) {
    let steps = params.get("steps").and_then(Value::as_u64).unwrap_or(3) as usize;
    let interval = params
        .get("intervalMs")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(shared.options.progress_interval);

    let mut scan = ChunkedScan::new(reply.id.clone(), "slow_progress", 1);
    if let Ok(update) = scan.start("Starting") {
        reply.progress(update);
    }
    if let Ok(update) = scan.collected(steps, format!("{steps} steps")) {
        reply.progress(update);
    }
    for step in 0..steps {
        tokio::time::sleep(interval).await;
        if let Ok(update) = scan.chunk_done(1, step + 1, json!({ "step": step + 1 })) {
            reply.progress(update);
        }
    }
    if let Ok(done) = scan.complete("Done", steps, json!({ "stepsReported": steps })) {
        reply.progress(done);
    }
    reply.result(json!({ "steps": steps }));
}
