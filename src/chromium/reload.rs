//! WebSocket reload channel for Chromium sessions.
//!
//! The channel binds a WebSocket server on an ephemeral loopback port.
//! The companion extension running inside the browser connects as a
//! client; reload commands are broadcast to every connection tracked at
//! call time. Per-client socket failures drop that client only; the
//! server and the remaining clients are unaffected.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// How long a broadcast waits for the first client before failing.
///
/// Covers the race between browser startup and the first reload.
const FIRST_CLIENT_WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// Outgoing message queues keyed by client id.
type ClientMap = Arc<Mutex<FxHashMap<Uuid, mpsc::UnboundedSender<Message>>>>;

/// Builds the reload-all wire command.
///
/// `reload_extension_by_source_dir` sends this exact payload too: the
/// companion protocol carries no target identifier, so a per-extension
/// reload degrades to a full reload. Known limitation, kept as is.
fn reload_command() -> Value {
    json!({"type": "webExtReloadAllExtensions"})
}

// ============================================================================
// ReloadManagerChannel
// ============================================================================

/// WebSocket server broadcasting reload commands to companion clients.
pub struct ReloadManagerChannel {
    port: u16,
    clients: ClientMap,
    client_attached: Arc<Notify>,
    accept_task: tokio::task::JoinHandle<()>,
    first_client_wait: Duration,
}

impl ReloadManagerChannel {
    /// Binds the server on an ephemeral loopback port and starts
    /// accepting clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let clients: ClientMap = Arc::new(Mutex::new(FxHashMap::default()));
        let client_attached = Arc::new(Notify::new());

        let accept_task = tokio::spawn(Self::run_accept_loop(
            listener,
            Arc::clone(&clients),
            Arc::clone(&client_attached),
        ));

        debug!(port, "Reload manager channel listening");

        Ok(Self {
            port,
            clients,
            client_attached,
            accept_task,
            first_client_wait: FIRST_CLIENT_WAIT,
        })
    }

    /// Overrides how long a broadcast waits for the first client.
    #[inline]
    #[must_use]
    pub fn with_first_client_wait(mut self, wait: Duration) -> Self {
        self.first_client_wait = wait;
        self
    }

    /// Returns the server port the companion extension dials.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the WebSocket URL for this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Returns the number of currently connected clients.
    #[inline]
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Broadcasts the reload-all command to every connected client.
    ///
    /// With no client connected yet the call waits (bounded) for the
    /// first one to attach, then delivers; it never hangs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reload`] if no client attaches within the wait
    /// window.
    pub async fn reload_all_extensions(&self) -> Result<()> {
        self.broadcast(reload_command()).await
    }

    /// Reloads the extension from one source directory.
    ///
    /// The companion protocol cannot address a single extension, so
    /// this broadcasts the same command as
    /// [`ReloadManagerChannel::reload_all_extensions`].
    pub async fn reload_extension_by_source_dir(&self, source_dir: &std::path::Path) -> Result<()> {
        debug!(
            source_dir = %source_dir.display(),
            "Per-extension reload degrades to a full reload"
        );
        self.broadcast(reload_command()).await
    }

    /// Delivers one command to a snapshot of the connected clients.
    async fn broadcast(&self, command: Value) -> Result<()> {
        if timeout(self.first_client_wait, self.wait_for_client())
            .await
            .is_err()
        {
            return Err(Error::reload(format!(
                "No reload client connected within {}s; is the browser still starting?",
                self.first_client_wait.as_secs()
            )));
        }

        let text = serde_json::to_string(&command)?;

        // Snapshot at call time; clients joining later get nothing from
        // this broadcast, clients leaving are dropped from the set.
        let snapshot: Vec<(Uuid, mpsc::UnboundedSender<Message>)> = self
            .clients
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0usize;
        for (id, tx) in snapshot {
            if tx.send(Message::Text(text.clone().into())).is_ok() {
                delivered += 1;
            } else {
                warn!(client = %id, "Reload client gone; dropping from broadcast set");
                self.clients.lock().remove(&id);
            }
        }

        debug!(delivered, "Reload command broadcast");
        Ok(())
    }

    /// Resolves once at least one client is connected.
    async fn wait_for_client(&self) {
        loop {
            let notified = self.client_attached.notified();
            if !self.clients.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting clients and disconnects the current ones.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        self.accept_task.abort();
        // Dropping the senders ends every per-client task, which closes
        // its socket on the way out.
        self.clients.lock().clear();
        debug!(port = self.port, "Reload manager channel closed");
    }

    /// Accept loop: one task per client connection.
    async fn run_accept_loop(listener: TcpListener, clients: ClientMap, attached: Arc<Notify>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(?addr, "Reload client connecting");
                    tokio::spawn(Self::run_client(
                        stream,
                        Arc::clone(&clients),
                        Arc::clone(&attached),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Reload channel accept failed");
                }
            }
        }
    }

    /// Per-client task: upgrade, forward outgoing commands, watch for
    /// close. Any socket error drops this client only.
    async fn run_client(stream: TcpStream, clients: ClientMap, attached: Arc<Notify>) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "Reload client upgrade failed");
                return;
            }
        };

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        clients.lock().insert(id, tx);
        attached.notify_waiters();
        debug!(client = %id, "Reload client connected");

        let (mut sink, mut source) = ws_stream.split();

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                warn!(client = %id, error = %e, "Reload client write failed");
                                break;
                            }
                        }
                        // Channel closed by shutdown.
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    }
                }

                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(client = %id, "Reload client disconnected");
                            break;
                        }
                        // Companion acks and pings are irrelevant here.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(client = %id, error = %e, "Reload client socket error");
                            break;
                        }
                    }
                }
            }
        }

        clients.lock().remove(&id);
    }
}

impl Drop for ReloadManagerChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_tungstenite::connect_async;

    async fn connect_client(
        channel: &ReloadManagerChannel,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (ws, _) = connect_async(channel.ws_url()).await.expect("connect");
        ws
    }

    /// Waits until the channel tracks `count` clients.
    async fn wait_for_clients(channel: &ReloadManagerChannel, count: usize) {
        timeout(Duration::from_secs(5), async {
            while channel.client_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count should settle");
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> String {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("message within timeout")
                .expect("stream open")
                .expect("no socket error");
            if let Message::Text(text) = message {
                return text.to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let channel = ReloadManagerChannel::start().await.expect("start");
        let mut first = connect_client(&channel).await;
        let mut second = connect_client(&channel).await;
        wait_for_clients(&channel, 2).await;

        channel.reload_all_extensions().await.expect("broadcast");

        let expected = r#"{"type":"webExtReloadAllExtensions"}"#;
        assert_eq!(next_text(&mut first).await, expected);
        assert_eq!(next_text(&mut second).await, expected);

        channel.close();
    }

    #[tokio::test]
    async fn test_closed_client_does_not_disrupt_survivor() {
        let channel = ReloadManagerChannel::start().await.expect("start");
        let mut survivor = connect_client(&channel).await;
        let mut doomed = connect_client(&channel).await;
        wait_for_clients(&channel, 2).await;

        doomed.close(None).await.expect("close client");
        wait_for_clients(&channel, 1).await;

        channel.reload_all_extensions().await.expect("broadcast");
        assert_eq!(
            next_text(&mut survivor).await,
            r#"{"type":"webExtReloadAllExtensions"}"#
        );

        channel.close();
    }

    #[tokio::test]
    async fn test_reload_by_source_dir_sends_identical_payload() {
        let channel = ReloadManagerChannel::start().await.expect("start");
        let mut client = connect_client(&channel).await;
        wait_for_clients(&channel, 1).await;

        channel.reload_all_extensions().await.expect("reload all");
        let all_payload = next_text(&mut client).await;

        channel
            .reload_extension_by_source_dir(std::path::Path::new("/fake/sourceDir"))
            .await
            .expect("reload by dir");
        let by_dir_payload = next_text(&mut client).await;

        assert_eq!(all_payload, by_dir_payload);
        channel.close();
    }

    #[tokio::test]
    async fn test_broadcast_without_clients_fails_deterministically() {
        let channel = ReloadManagerChannel::start()
            .await
            .expect("start")
            .with_first_client_wait(Duration::from_millis(200));

        let err = channel.reload_all_extensions().await.unwrap_err();
        assert!(matches!(err, Error::Reload { .. }));

        channel.close();
    }

    #[tokio::test]
    async fn test_broadcast_delivers_once_first_client_attaches() {
        let channel = Arc::new(ReloadManagerChannel::start().await.expect("start"));

        let broadcaster = Arc::clone(&channel);
        let broadcast = tokio::spawn(async move { broadcaster.reload_all_extensions().await });

        // Attach a client while the broadcast is waiting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut client = connect_client(&channel).await;

        broadcast
            .await
            .expect("task")
            .expect("broadcast resolves after attach");
        assert_eq!(
            next_text(&mut client).await,
            r#"{"type":"webExtReloadAllExtensions"}"#
        );

        channel.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let channel = ReloadManagerChannel::start().await.expect("start");
        channel.close();
        channel.close();
    }
}
