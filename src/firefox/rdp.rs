//! Firefox remote debugging protocol client.
//!
//! The control channel to Firefox is a TCP socket carrying
//! length-prefixed JSON packets:
//!
//! ```text
//! <byte length, ASCII decimal>:<exactly that many bytes of UTF-8 JSON>
//! ```
//!
//! The protocol carries no request ids. Requests are correlated to
//! responses by a caller-supplied matcher predicate held in FIFO order:
//! an incoming packet resolves the first pending request whose matcher
//! accepts it, and anything no request claims is dispatched as an
//! unsolicited event. Overlapping requests with ambiguous response
//! shapes must be serialized by the caller; [`RemoteFirefox`] issues
//! its own request sequences one at a time.
//!
//! Connection states: `Disconnected -> Connecting -> Connected ->
//! Disconnecting -> Disconnected`. [`RdpClient::connect`] covers the
//! dial-and-retry window (the debug server is not ready immediately
//! after process launch); [`RdpClient::disconnect`] closes the socket
//! and rejects every still-pending request.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Dial attempts while the debug server starts up.
const DIAL_ATTEMPTS: u32 = 50;

/// Delay between dial attempts.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(120);

/// Timeout for the server's root greeting after connect.
const GREETING_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single framed packet.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Longest accepted ASCII length prefix (well past `MAX_FRAME_LEN`).
const MAX_PREFIX_DIGITS: usize = 10;

/// Packet types the server emits without a matching request.
///
/// These must never be mistaken for a reply from the same actor.
const UNSOLICITED_EVENTS: &[&str] = &[
    "addonListChanged",
    "frameUpdate",
    "networkEvent",
    "networkEventUpdate",
    "newMutations",
    "tabListChanged",
    "tabNavigated",
    "workerListChanged",
];

// ============================================================================
// PacketDecoder
// ============================================================================

/// Incremental decoder for `<len>:<json>` framed packets.
///
/// Feed it raw socket bytes in arbitrary chunks; it yields every
/// complete packet in arrival order and buffers the remainder.
pub struct PacketDecoder {
    buf: Vec<u8>,
}

impl PacketDecoder {
    /// Creates an empty decoder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends bytes and drains every complete packet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on unframable data: a non-digit
    /// length prefix, an oversized length, or invalid JSON. The stream
    /// cannot be resynchronized after that; callers must disconnect.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Value>> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            let Some(colon) = self.buf.iter().position(|&b| b == b':') else {
                if self.buf.len() > MAX_PREFIX_DIGITS {
                    return Err(Error::protocol(
                        "Missing ':' after length prefix in packet stream",
                    ));
                }
                break;
            };

            let prefix = &self.buf[..colon];
            if colon == 0 || colon > MAX_PREFIX_DIGITS || !prefix.iter().all(u8::is_ascii_digit) {
                return Err(Error::protocol(format!(
                    "Invalid packet length prefix: {:?}",
                    String::from_utf8_lossy(prefix)
                )));
            }

            // Prefix is pure ASCII digits, so both conversions hold.
            let len: usize = std::str::from_utf8(prefix)
                .map_err(|_| Error::protocol("Non-UTF-8 length prefix"))?
                .parse()
                .map_err(|_| Error::protocol("Unparsable packet length prefix"))?;

            if len > MAX_FRAME_LEN {
                return Err(Error::protocol(format!(
                    "Packet length {len} exceeds maximum {MAX_FRAME_LEN}"
                )));
            }

            let frame_end = colon + 1 + len;
            if self.buf.len() < frame_end {
                // Partial packet; wait for more bytes.
                break;
            }

            let body = &self.buf[colon + 1..frame_end];
            let packet: Value = serde_json::from_slice(body).map_err(|e| {
                Error::protocol(format!("Invalid JSON in framed packet: {e}"))
            })?;

            packets.push(packet);
            self.buf.drain(..frame_end);
        }

        Ok(packets)
    }

    /// Returns the number of buffered (incomplete) bytes.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Events
// ============================================================================

/// An unsolicited packet from the debugging server.
#[derive(Debug, Clone)]
pub struct RdpEvent {
    /// Actor that emitted the event.
    pub from: String,
    /// Event type.
    pub kind: String,
    /// Full packet payload.
    pub payload: Value,
}

/// Registered handler for unsolicited events.
pub type EventHandler = Box<dyn Fn(RdpEvent) + Send + Sync>;

// ============================================================================
// Internal types
// ============================================================================

/// Caller-supplied response matcher.
type PacketMatcher = Box<dyn Fn(&Value) -> bool + Send>;

/// A request awaiting its response packet.
struct PendingRequest {
    id: u64,
    matcher: PacketMatcher,
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending requests in FIFO order.
type PendingQueue = Arc<Mutex<VecDeque<PendingRequest>>>;

/// Commands for the connection event loop.
enum ClientCommand {
    /// Frame and send a packet, registering its response matcher.
    Send {
        id: u64,
        packet: Value,
        matcher: PacketMatcher,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    /// Close the socket.
    Shutdown,
}

// ============================================================================
// RdpClient
// ============================================================================

/// Connection to the Firefox remote debugging server.
///
/// Packets are processed in arrival order by a single event-loop task;
/// all operations are non-blocking and the handle is cheaply cloneable.
pub struct RdpClient {
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    pending: PendingQueue,
    event_handler: Arc<Mutex<Option<EventHandler>>>,
    next_id: Arc<AtomicU64>,
}

impl Clone for RdpClient {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            pending: Arc::clone(&self.pending),
            event_handler: Arc::clone(&self.event_handler),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl RdpClient {
    /// Dials the debug server, retrying while it starts up.
    ///
    /// Connection refused is retried (50 attempts, 120 ms apart); any
    /// other socket error fails fast.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] when the retry window is exhausted
    /// - [`Error::Connection`] on a non-refusal socket error
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = Self::dial(port).await?;
        Ok(Self::new(stream, VecDeque::new()))
    }

    /// Dials the debug server and waits for a packet matching
    /// `greeting` before returning.
    ///
    /// The matcher is registered before the event loop starts reading,
    /// so a greeting the server sends immediately on accept cannot be
    /// lost to the race between connect and registration.
    ///
    /// # Errors
    ///
    /// Same as [`RdpClient::connect`], plus
    /// [`Error::ConnectionTimeout`] if no matching packet arrives
    /// within `wait`.
    pub async fn connect_with_greeting(
        port: u16,
        greeting: impl Fn(&Value) -> bool + Send + 'static,
        wait: Duration,
    ) -> Result<(Self, Value)> {
        let stream = Self::dial(port).await?;

        let (tx, rx) = oneshot::channel();
        let mut seed = VecDeque::new();
        // Id 0 is reserved for the greeting; request ids start at 1.
        seed.push_back(PendingRequest {
            id: 0,
            matcher: Box::new(greeting),
            tx,
        });

        let client = Self::new(stream, seed);

        let packet = match timeout(wait, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                client.pending.lock().retain(|p| p.id != 0);
                return Err(Error::connection_timeout(wait.as_millis() as u64));
            }
        };

        Ok((client, packet))
    }

    /// Retries the TCP dial while the debug server starts up.
    async fn dial(port: u16) -> Result<TcpStream> {
        for attempt in 1..=DIAL_ATTEMPTS {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    debug!(port, attempt, "Connected to remote debugging server");
                    return Ok(stream);
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    trace!(port, attempt, "Debug server not ready yet");
                    sleep(DIAL_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(Error::connection(format!(
                        "Failed to reach debug server on port {port}: {e}"
                    )));
                }
            }
        }

        Err(Error::connection_timeout(
            u64::from(DIAL_ATTEMPTS) * DIAL_RETRY_DELAY.as_millis() as u64,
        ))
    }

    /// Creates a client from an established stream and spawns the
    /// event loop. `seed` holds matchers that must be registered before
    /// the first byte is read.
    fn new(stream: TcpStream, seed: VecDeque<PendingRequest>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let pending: PendingQueue = Arc::new(Mutex::new(seed));
        let event_handler: Arc<Mutex<Option<EventHandler>>> = Arc::new(Mutex::new(None));

        tokio::spawn(Self::run_event_loop(
            stream,
            command_rx,
            Arc::clone(&pending),
            Arc::clone(&event_handler),
        ));

        Self {
            command_tx,
            pending,
            event_handler,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Sends a packet and resolves with the first subsequent packet the
    /// matcher accepts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the channel goes down
    /// before the response arrives.
    pub async fn request(
        &self,
        packet: Value,
        matcher: impl Fn(&Value) -> bool + Send + 'static,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(ClientCommand::Send {
                id,
                packet,
                matcher: Box::new(matcher),
                response_tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Registers the handler for unsolicited events.
    pub fn set_event_handler(&self, handler: EventHandler) {
        *self.event_handler.lock() = Some(handler);
    }

    /// Clears the event handler.
    pub fn clear_event_handler(&self) {
        *self.event_handler.lock() = None;
    }

    /// Returns the number of requests awaiting responses.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Closes the socket and rejects every pending request.
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(ClientCommand::Shutdown);
    }

    /// Event loop: socket I/O plus command handling.
    async fn run_event_loop(
        stream: TcpStream,
        mut command_rx: mpsc::UnboundedReceiver<ClientCommand>,
        pending: PendingQueue,
        event_handler: Arc<Mutex<Option<EventHandler>>>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut decoder = PacketDecoder::new();
        let mut read_buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                read = read_half.read(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            debug!("Debug server closed the connection");
                            break;
                        }
                        Ok(n) => match decoder.push(&read_buf[..n]) {
                            Ok(packets) => {
                                for packet in packets {
                                    Self::handle_packet(packet, &pending, &event_handler);
                                }
                            }
                            Err(e) => {
                                // Unframable stream; no resynchronization.
                                error!(error = %e, "Protocol error on control socket; disconnecting");
                                break;
                            }
                        },
                        Err(e) => {
                            error!(error = %e, "Control socket read failed");
                            break;
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(ClientCommand::Send { id, packet, matcher, response_tx }) => {
                            Self::handle_send(
                                id,
                                packet,
                                matcher,
                                response_tx,
                                &mut write_half,
                                &pending,
                            )
                            .await;
                        }
                        Some(ClientCommand::Shutdown) => {
                            debug!("Disconnect requested");
                            let _ = write_half.shutdown().await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        Self::fail_pending(&pending);
        debug!("RDP event loop terminated");
    }

    /// Routes one decoded packet: first matching pending request wins,
    /// otherwise it is an event.
    fn handle_packet(packet: Value, pending: &PendingQueue, event_handler: &Arc<Mutex<Option<EventHandler>>>) {
        let claimed = {
            let mut queue = pending.lock();
            match queue.iter().position(|p| (p.matcher)(&packet)) {
                Some(index) => queue.remove(index),
                None => None,
            }
        };

        if let Some(request) = claimed {
            let _ = request.tx.send(Ok(packet));
            return;
        }

        let event = RdpEvent {
            from: packet
                .get("from")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: packet
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            payload: packet,
        };

        let handler = event_handler.lock();
        if let Some(ref handler) = *handler {
            handler(event);
        } else {
            trace!(from = %event.from, kind = %event.kind, "Unhandled server event");
        }
    }

    /// Frames and writes one request, registering its matcher first.
    async fn handle_send(
        id: u64,
        packet: Value,
        matcher: PacketMatcher,
        response_tx: oneshot::Sender<Result<Value>>,
        write_half: &mut OwnedWriteHalf,
        pending: &PendingQueue,
    ) {
        let json = match serde_json::to_string(&packet) {
            Ok(json) => json,
            Err(e) => {
                let _ = response_tx.send(Err(Error::Json(e)));
                return;
            }
        };

        // Register before writing so a fast response cannot race us.
        pending.lock().push_back(PendingRequest {
            id,
            matcher,
            tx: response_tx,
        });

        let frame = format!("{}:{}", json.len(), json);
        if let Err(e) = write_half.write_all(frame.as_bytes()).await {
            let request = {
                let mut queue = pending.lock();
                queue
                    .iter()
                    .position(|p| p.id == id)
                    .and_then(|index| queue.remove(index))
            };
            if let Some(request) = request {
                let _ = request.tx.send(Err(Error::connection(e.to_string())));
            }
            return;
        }

        trace!(bytes = frame.len(), "Request packet sent");
    }

    /// Rejects every pending request with a disconnection error.
    fn fail_pending(pending: &PendingQueue) {
        let drained: Vec<_> = pending.lock().drain(..).collect();
        let count = drained.len();

        for request in drained {
            let _ = request.tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Rejected pending requests on disconnect");
        }
    }
}

// ============================================================================
// RemoteFirefox
// ============================================================================

/// High-level operations over one [`RdpClient`].
///
/// Each operation is a specific request/response packet pair; the
/// wrapper serializes its own sequences, so matchers stay unambiguous.
#[derive(Clone)]
pub struct RemoteFirefox {
    client: RdpClient,
}

impl RemoteFirefox {
    /// Connects to the debug server and consumes the root greeting.
    ///
    /// # Errors
    ///
    /// Propagates dial errors; [`Error::ConnectionTimeout`] if the
    /// greeting never arrives.
    pub async fn connect(port: u16) -> Result<Self> {
        let (client, greeting) = RdpClient::connect_with_greeting(
            port,
            |p| p.get("applicationType").is_some(),
            GREETING_TIMEOUT,
        )
        .await?;
        debug!(
            application_type = greeting
                .get("applicationType")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default(),
            "Remote debugging session established"
        );

        Ok(Self { client })
    }

    /// Returns the underlying protocol client.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &RdpClient {
        &self.client
    }

    /// Closes the control channel.
    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    /// Resolves the addons actor for remote installation.
    ///
    /// Modern servers answer `getRoot`; older servers expose the actor
    /// on `listTabs` instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when neither reply carries an addons
    /// actor (remote installation unsupported).
    pub async fn addons_actor(&self) -> Result<String> {
        let root = self
            .request_to("root", json!({"to": "root", "type": "getRoot"}))
            .await?;
        if let Some(actor) = root.get("addonsActor").and_then(Value::as_str) {
            return Ok(actor.to_string());
        }

        let tabs = self
            .request_to("root", json!({"to": "root", "type": "listTabs"}))
            .await?;
        tabs.get("addonsActor")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::protocol(
                    "This Firefox version does not provide an add-ons actor for remote installation",
                )
            })
    }

    /// Installs an extension from a source directory as a temporary
    /// add-on and returns the id the browser assigned.
    pub async fn install_temporary_addon(&self, addon_dir: &Path) -> Result<String> {
        let actor = self.addons_actor().await?;
        let reply = self
            .request_to(
                &actor,
                json!({
                    "to": actor,
                    "type": "installTemporaryAddon",
                    "addonPath": addon_dir.to_string_lossy(),
                }),
            )
            .await?;

        let id = reply
            .pointer("/addon/id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("installTemporaryAddon reply is missing the addon id"))?;

        debug!(addon_id = id, dir = %addon_dir.display(), "Temporary add-on installed");
        Ok(id.to_string())
    }

    /// Looks up the actor of an installed add-on by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the add-on is not installed.
    pub async fn installed_addon_actor(&self, addon_id: &str) -> Result<String> {
        let reply = self
            .request_to("root", json!({"to": "root", "type": "listAddons"}))
            .await?;

        reply
            .get("addons")
            .and_then(Value::as_array)
            .and_then(|addons| {
                addons.iter().find(|addon| {
                    addon.get("id").and_then(Value::as_str) == Some(addon_id)
                })
            })
            .and_then(|addon| addon.get("actor").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| Error::protocol(format!("Add-on {addon_id} is not installed")))
    }

    /// Uninstalls an installed add-on by id.
    pub async fn uninstall_addon(&self, addon_id: &str) -> Result<()> {
        let actor = self.addons_actor().await?;
        self.request_to(
            &actor,
            json!({"to": actor, "type": "uninstallAddon", "addonId": addon_id}),
        )
        .await?;
        debug!(addon_id, "Add-on uninstalled");
        Ok(())
    }

    /// Asks the browser to reload one installed add-on.
    pub async fn reload_addon(&self, addon_id: &str) -> Result<()> {
        let actor = self.installed_addon_actor(addon_id).await?;
        self.request_to(&actor, json!({"to": actor, "type": "reload"}))
            .await?;
        debug!(addon_id, "Add-on reloaded");
        Ok(())
    }

    /// Sends a request and matches the reply by source actor,
    /// converting error replies into [`Error::Remote`].
    async fn request_to(&self, actor: &str, packet: Value) -> Result<Value> {
        let expected = actor.to_string();
        let reply = self
            .client
            .request(packet, move |p| {
                let from_matches =
                    p.get("from").and_then(Value::as_str) == Some(expected.as_str());
                let unsolicited = p
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| UNSOLICITED_EVENTS.contains(&t));
                from_matches && !unsolicited
            })
            .await?;

        into_remote_result(reply)
    }
}

/// Converts a server error reply into [`Error::Remote`].
fn into_remote_result(packet: Value) -> Result<Value> {
    if let Some(code) = packet.get("error").and_then(Value::as_str) {
        let message = packet
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(code)
            .to_string();
        warn!(error = code, message = %message, "Server rejected request");
        return Err(Error::remote(code, message));
    }
    Ok(packet)
}

// ============================================================================
// Tests
// ============================================================================
