//! The websocket link: one task per bridge that connects, pumps frames, and
//! reconnects after a fixed delay until shut down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Callbacks driven by the connection task.
pub trait LinkEvents: Send + Sync + 'static {
    fn on_open(&self);
    fn on_message(&self, text: &str);
    fn on_error(&self, err: &BridgeError);
    fn on_close(&self);
}

/// Shared view of the link used by senders.
pub struct ConnectionManager {
    endpoint: String,
    reconnect_delay: Duration,
    state: watch::Sender<LinkState>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    retry_now: Notify,
}

impl ConnectionManager {
    pub fn new(endpoint: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            reconnect_delay,
            state,
            writer: Mutex::new(None),
            retry_now: Notify::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Queue one text frame for the writer. Fails fast when the link is not
    /// open; nothing is buffered across reconnects.
    pub fn send(&self, text: String) -> BridgeResult<()> {
        if !self.is_open() {
            return Err(BridgeError::NotConnected);
        }
        let writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        match writer.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| BridgeError::NotConnected),
            None => Err(BridgeError::NotConnected),
        }
    }

    /// Cut a pending reconnect delay short.
    pub fn retry_now(&self) {
        self.retry_now.notify_waiters();
    }

    /// Install the writer for a freshly opened socket.
    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.writer.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        self.set_state(LinkState::Open);
    }

    pub fn detach(&self) {
        self.writer.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "link state");
        }
    }
}

/// Connect, pump, and reconnect until `shutdown` fires.
pub async fn run(
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn LinkEvents>,
    shutdown: CancellationToken,
) {
    loop {
        match run_session(&manager, handler.as_ref(), &shutdown).await {
            Ok(()) => {
                tracing::info!(endpoint = %manager.endpoint, "connection closed");
            }
            Err(e) => {
                tracing::warn!(endpoint = %manager.endpoint, err = %e, "connection failed");
                handler.on_error(&e);
            }
        }
        manager.detach();
        handler.on_close();

        if shutdown.is_cancelled() {
            break;
        }
        tracing::info!(
            delay_ms = manager.reconnect_delay.as_millis() as u64,
            "reconnecting after delay"
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = manager.retry_now.notified() => {}
            _ = tokio::time::sleep(manager.reconnect_delay) => {}
        }
    }
    manager.set_state(LinkState::Disconnected);
    tracing::info!(endpoint = %manager.endpoint, "connection loop stopped");
}

async fn run_session(
    manager: &ConnectionManager,
    handler: &dyn LinkEvents,
    shutdown: &CancellationToken,
) -> BridgeResult<()> {
    manager.set_state(LinkState::Connecting);
    tracing::info!(endpoint = %manager.endpoint, "connecting to execution host");

    let (ws, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        connected = connect_async(manager.endpoint.as_str()) => connected?,
    };
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    handler.on_open();
    manager.attach(tx);
    tracing::info!(endpoint = %manager.endpoint, "connected to execution host");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                manager.set_state(LinkState::Closing);
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    return Ok(());
                };
                sink.send(Message::text(text)).await?;
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handler.on_message(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        tracing::debug!(len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "host closed the connection");
                        manager.set_state(LinkState::Closing);
                        return Ok(());
                    }
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        opens: AtomicUsize,
        errors: AtomicUsize,
        closes: AtomicUsize,
    }

    impl LinkEvents for Counting {
        fn on_open(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        fn on_message(&self, _text: &str) {}
        fn on_error(&self, _err: &BridgeError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn send_fails_fast_when_not_open() {
        let manager = ConnectionManager::new("ws://127.0.0.1:1", Duration::from_millis(10));
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(manager.send("x".into()), Err(BridgeError::NotConnected));
    }

    #[test]
    fn attached_writer_receives_frames() {
        let manager = ConnectionManager::new("ws://127.0.0.1:1", Duration::from_millis(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.attach(tx);
        assert!(manager.is_open());

        manager.send("hello".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "hello");

        manager.detach();
        assert_eq!(manager.send("late".into()), Err(BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn retries_until_shutdown() {
        // Reserve a port with nothing listening on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = Arc::new(ConnectionManager::new(
            format!("ws://{addr}"),
            Duration::from_millis(20),
        ));
        let events = Arc::new(Counting::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(manager.clone(), events.clone(), shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while events.closes.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.opens.load(Ordering::SeqCst), 0);
        assert!(events.errors.load(Ordering::SeqCst) >= 3);
        assert_eq!(manager.state(), LinkState::Disconnected);
    }
}
