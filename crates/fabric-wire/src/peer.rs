//! Peer: TCP server and client for the Fabric messaging protocol.
//!
//! A [`Peer`] binds a local TCP listener and dials outward to other nodes.
//! Every connection, accepted or dialed, gets a reader task that frames the
//! byte stream and dispatches messages, and a writer task that drains a
//! per-connection queue. Both sides send `IdentityRequest` as soon as the
//! socket opens, so handshakes are mutual.
//!
//! All mutable state (connection map, dedup set, message memory) sits behind
//! one mutex that is never held across an `.await`; frame dispatch runs to
//! completion on the reader task before the next frame is looked at.

use crate::config::PeerConfig;
use crate::connection::{
    validate_address, ConnectionContext, ConnectionHandle, ConnectionInfo, Direction,
};
use crate::dedup::DedupSet;
use crate::error::WireError;
use crate::events::PeerEvent;
use crate::identity::{Identity, StateSource};
use crate::message::{Instruction, Message, MessageId, MessageType};
use crate::reader::Reader;
use crate::registry::{PeerRegistry, Registration};

use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Read buffer size; one full frame fits.
const READ_BUFFER_SIZE: usize = 4096;

/// Inner `type` of a `PeerMessage` handled by the peer itself.
const COLLECTIONS_POST: &str = "collections:post";

/// State guarded by the peer's single lock.
struct Shared {
    connections: HashMap<String, ConnectionHandle>,
    /// Addresses with a dial in flight.
    dialing: HashSet<String>,
    /// Relayable message ids.
    seen: DedupSet,
    /// Per-connection keys of session-scoped messages.
    sessions: DedupSet,
    memory: LruCache<MessageId, Message>,
}

/// The local network node. Listens for connections and connects to peers.
pub struct Peer {
    config: PeerConfig,
    identity: Arc<dyn Identity>,
    state: Arc<dyn StateSource>,
    registry: PeerRegistry,
    shared: Mutex<Shared>,
    events: broadcast::Sender<PeerEvent>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: OnceLock<SocketAddr>,
    started: AtomicBool,
    next_session: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Peer {
    pub fn new(
        config: PeerConfig,
        identity: Arc<dyn Identity>,
        state: Arc<dyn StateSource>,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            shared: Mutex::new(Shared {
                connections: HashMap::new(),
                dialing: HashSet::new(),
                seen: DedupSet::new(config.dedup_capacity, config.dedup_ttl()),
                sessions: DedupSet::new(config.session_dedup_capacity, config.dedup_ttl()),
                memory: LruCache::new(capacity),
            }),
            config,
            identity,
            state,
            registry: PeerRegistry::new(),
            events,
            local_addr: OnceLock::new(),
            started: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Bind the listener, start accepting, and dial configured peers.
    ///
    /// Resolves once the socket is bound; does not wait for any peer.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, WireError> {
        if self.is_stopped() {
            return Err(WireError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WireError::AlreadyStarted);
        }

        let listener = match TcpListener::bind(&self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        info!("Fabric: listening on {} (id={})", local_addr, self.id());

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.accept_loop(listener).await;
        });

        self.emit(PeerEvent::Ready {
            id: self.id(),
            address: local_addr,
        });

        for address in self.config.peers.clone() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.connect(&address).await;
            });
        }

        Ok(local_addr)
    }

    /// Signal every task to wind down. Connections close and emit
    /// `ConnectionClose` as their reader tasks exit.
    pub fn stop(&self) {
        info!("Fabric: stopping peer {}", self.id());
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn id(&self) -> String {
        self.identity.id()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Subscribe to peer events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared()
            .connections
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    pub fn connection(&self, address: &str) -> Option<ConnectionInfo> {
        self.shared()
            .connections
            .get(address)
            .map(|h| h.info.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.shared().connections.len()
    }

    /// Whether more connections are open than `max_connections` allows.
    /// Inbound accepts are never refused, only reported.
    pub fn is_over_capacity(&self) -> bool {
        self.connection_count() > self.config.max_connections
    }

    /// Look up a previously seen message by id.
    pub fn recall(&self, id: &MessageId) -> Option<Message> {
        self.shared().memory.peek(id).cloned()
    }

    /// Connect to `address`, logging instead of failing.
    ///
    /// Returns the existing connection when one is open, and `None` on a
    /// malformed address, a failed dial, or while another dial to the same
    /// address is in flight.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Option<ConnectionInfo> {
        match self.try_connect(address).await {
            Ok(info) => info,
            Err(WireError::AddressFormat(addr)) => {
                warn!("Fabric: refusing to connect to malformed address '{}'", addr);
                None
            }
            Err(e) => {
                warn!("Fabric: could not connect to {}: {}", address, e);
                self.emit(PeerEvent::ConnectionError {
                    address: address.to_string(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Fallible form of [`connect`](Self::connect).
    pub async fn try_connect(
        self: &Arc<Self>,
        address: &str,
    ) -> Result<Option<ConnectionInfo>, WireError> {
        validate_address(address)?;
        if self.is_stopped() {
            return Err(WireError::ShuttingDown);
        }

        {
            let mut shared = self.shared();
            if let Some(existing) = shared.connections.get(address) {
                return Ok(Some(existing.info.clone()));
            }
            if !shared.dialing.insert(address.to_string()) {
                debug!("Fabric: dial to {} already in flight", address);
                return Ok(None);
            }
        }

        info!("Fabric: connecting to peer at {}", address);
        match TcpStream::connect(address).await {
            Ok(stream) => Ok(Some(self.register_connection(
                stream,
                address.to_string(),
                Direction::Initiator,
            ))),
            Err(e) => {
                self.shared().dialing.remove(address);
                Err(e.into())
            }
        }
    }

    /// Write `message` to every open connection.
    ///
    /// Returns `false`, writing nothing, if the message id was already seen.
    pub fn broadcast(&self, message: &Message) -> bool {
        let id = message.id();
        let targets: Vec<(String, mpsc::UnboundedSender<Bytes>)> = {
            let mut shared = self.shared();
            if !shared.seen.insert(id) {
                debug!("Fabric: not rebroadcasting {}", id);
                return false;
            }
            shared.memory.put(id, message.clone());
            shared
                .connections
                .iter()
                .map(|(address, handle)| (address.clone(), handle.tx.clone()))
                .collect()
        };

        let frame = message.to_raw();
        for (address, tx) in targets {
            if tx.send(frame.clone()).is_err() {
                warn!("Fabric: broadcast to {} failed: connection closed", address);
            }
        }
        true
    }

    /// Forward `message` to every connection except the one it came from.
    ///
    /// `origin` matches either a connection address or a registered peer id.
    /// Returns the number of connections written to.
    pub fn relay_from(&self, origin: &str, message: &Message) -> usize {
        let mut excluded = HashSet::from([origin.to_string()]);
        if let Some(record) = self.registry.get_peer(origin) {
            excluded.insert(record.address);
        }

        let id = message.id();
        let targets: Vec<(String, mpsc::UnboundedSender<Bytes>)> = {
            let mut shared = self.shared();
            shared.seen.insert(id);
            shared.memory.put(id, message.clone());
            shared
                .connections
                .iter()
                .filter(|(address, _)| !excluded.contains(*address))
                .map(|(address, handle)| (address.clone(), handle.tx.clone()))
                .collect()
        };

        let frame = message.to_raw();
        let mut written = 0;
        for (address, tx) in targets {
            if tx.send(frame.clone()).is_ok() {
                written += 1;
            } else {
                warn!("Fabric: relay to {} failed: connection closed", address);
            }
        }
        debug!("Fabric: relayed {} from {} to {} peers", id, origin, written);
        written
    }

    /// Advertise `address` to every connection as a dialable peer.
    pub fn announce_candidate(&self, address: &str) -> Result<bool, WireError> {
        validate_address(address)?;
        let message = Message::from_json(
            MessageType::PeerInstruction,
            &Instruction::PeerCandidate {
                address: address.to_string(),
            },
        )?;
        Ok(self.broadcast(&message))
    }

    /// Accept loop, run in a spawned task.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Fabric: accept loop stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Fabric: accepted connection from {}", addr);
                        self.register_connection(stream, addr.to_string(), Direction::Acceptor);
                        if self.is_over_capacity() {
                            warn!(
                                "Fabric: {} connections exceed max_connections={} after accepting {}",
                                self.connection_count(),
                                self.config.max_connections,
                                addr
                            );
                        }
                    }
                    Err(e) => {
                        error!("Fabric: accept error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Track a fresh socket, spawn its tasks, and open the handshake.
    fn register_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        address: String,
        direction: Direction,
    ) -> ConnectionInfo {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let info = ConnectionInfo {
            address: address.clone(),
            direction,
            authenticated: false,
            session,
            opened_at: Utc::now(),
        };

        {
            let mut shared = self.shared();
            shared.dialing.remove(&address);
            let handle = ConnectionHandle {
                info: info.clone(),
                tx: tx.clone(),
            };
            if shared.connections.insert(address.clone(), handle).is_some() {
                warn!("Fabric: replaced existing connection to {}", address);
            }
        }

        tokio::spawn(write_loop(writer, rx, address.clone()));

        let ctx = ConnectionContext {
            address: address.clone(),
            session,
            tx,
        };

        self.emit(PeerEvent::ConnectionOpen {
            address: address.clone(),
            status: "connected",
            initiator: direction == Direction::Initiator,
        });

        match Message::new(MessageType::IdentityRequest, self.id()) {
            Ok(request) => {
                if let Err(e) = ctx.send(&request) {
                    debug!("Fabric: could not queue IdentityRequest to {}: {}", address, e);
                }
            }
            Err(e) => error!("Fabric: cannot encode local identity: {}", e),
        }

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.read_loop(reader, ctx).await;
        });

        info
    }

    /// Read, frame, and dispatch until EOF, error, or shutdown.
    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, ctx: ConnectionContext) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut framer = Reader::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = if *shutdown.borrow() {
            Ok(())
        } else {
            loop {
                let n = tokio::select! {
                    _ = shutdown.changed() => break Ok(()),
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(e) => break Err(WireError::Io(e)),
                    },
                };
                framer.push(&buf[..n]);
                if let Err(e) = self.drain_frames(&mut framer, &ctx) {
                    break Err(e);
                }
            }
        };

        self.close_connection(&ctx, result.err());
    }

    fn drain_frames(&self, framer: &mut Reader, ctx: &ConnectionContext) -> Result<(), WireError> {
        while let Some(frame) = framer.next_frame()? {
            self.emit(PeerEvent::SocketData {
                address: ctx.address.clone(),
                size: frame.len(),
            });
            let message = frame.to_message(self.config.verify_hash)?;
            self.handle_message(ctx, message)?;
        }
        Ok(())
    }

    /// Dedup gate, then dispatch by type. An error closes the connection.
    fn handle_message(&self, ctx: &ConnectionContext, message: Message) -> Result<(), WireError> {
        let id = message.id();

        {
            let mut shared = self.shared();
            let fresh = if message.kind().is_session_scoped() {
                shared.sessions.insert(session_key(ctx.session, &id))
            } else {
                let fresh = shared.seen.insert(id);
                if fresh {
                    shared.memory.put(id, message.clone());
                }
                fresh
            };
            if !fresh {
                debug!(
                    "Fabric: dropping duplicate {} {} from {}",
                    message.kind(),
                    id,
                    ctx.address
                );
                return Ok(());
            }
        }

        match message.kind() {
            MessageType::IdentityRequest => {
                let response = Message::new(MessageType::IdentityResponse, self.id())?;
                ctx.send(&response)
            }
            MessageType::IdentityResponse => self.on_identity_response(ctx, &message),
            MessageType::Ping => {
                let pong = Message::new(MessageType::Pong, message.payload().clone())?;
                ctx.send(&pong)
            }
            MessageType::Pong => {
                debug!("Fabric: pong from {}", ctx.address);
                Ok(())
            }
            MessageType::PeerMessage => self.on_peer_message(ctx, message),
            MessageType::PeerInstruction => self.on_peer_instruction(ctx, message),
            kind @ (MessageType::StateRoot
            | MessageType::StateCommitment
            | MessageType::StateChange
            | MessageType::StateRequest) => {
                let body: Value = message.payload_json()?;
                self.emit(PeerEvent::State {
                    address: ctx.address.clone(),
                    kind,
                    body,
                });
                Ok(())
            }
            _ => {
                self.emit(PeerEvent::Message {
                    address: ctx.address.clone(),
                    message,
                });
                Ok(())
            }
        }
    }

    fn on_identity_response(
        &self,
        ctx: &ConnectionContext,
        message: &Message,
    ) -> Result<(), WireError> {
        let remote_id = message.payload_str()?.to_string();
        if remote_id == self.id() {
            return Err(WireError::SelfConnection);
        }

        self.mark_authenticated(ctx);

        match self.registry.register(&remote_id, &ctx.address) {
            Registration::New(record) => {
                info!("Fabric: handshake complete with {} at {}", record.id, record.address);
                self.emit(PeerEvent::Peer(record));
            }
            Registration::Reconnected(record) => {
                info!("Fabric: peer {} reconnected at {}", record.id, record.address);
            }
            Registration::Known => {
                debug!("Fabric: peer {} already known", remote_id);
            }
        }

        let root = Message::from_json(MessageType::StateRoot, &self.state.snapshot())?;
        ctx.send(&root)
    }

    fn on_peer_message(&self, ctx: &ConnectionContext, message: Message) -> Result<(), WireError> {
        let body: Value = message.payload_json()?;
        let inner_type = body.get("type").and_then(Value::as_str).unwrap_or_default();

        if self.config.relay {
            self.relay_from(&ctx.address, &message);
        }

        match inner_type {
            COLLECTIONS_POST => self.emit(PeerEvent::CollectionPost {
                address: ctx.address.clone(),
                body,
            }),
            _ => self.emit(PeerEvent::Message {
                address: ctx.address.clone(),
                message,
            }),
        }
        Ok(())
    }

    fn on_peer_instruction(
        &self,
        ctx: &ConnectionContext,
        message: Message,
    ) -> Result<(), WireError> {
        let body: Value = message.payload_json()?;
        match serde_json::from_value::<Instruction>(body) {
            Ok(Instruction::PeerCandidate { address }) => match validate_address(&address) {
                Ok(()) => {
                    debug!("Fabric: {} suggested peer {}", ctx.address, address);
                    self.emit(PeerEvent::PeerCandidate { address });
                }
                Err(e) => warn!("Fabric: ignoring candidate from {}: {}", ctx.address, e),
            },
            Err(_) => self.emit(PeerEvent::Message {
                address: ctx.address.clone(),
                message,
            }),
        }
        Ok(())
    }

    fn mark_authenticated(&self, ctx: &ConnectionContext) {
        let updated = {
            let mut shared = self.shared();
            match shared.connections.get_mut(&ctx.address) {
                Some(handle) if handle.info.session == ctx.session && !handle.info.authenticated => {
                    handle.info.authenticated = true;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.emit(PeerEvent::SessionUpdate {
                address: ctx.address.clone(),
                authenticated: true,
            });
        }
    }

    /// Remove the connection entry (if it is still this session) and
    /// announce the close.
    fn close_connection(&self, ctx: &ConnectionContext, cause: Option<WireError>) {
        let removed = {
            let mut shared = self.shared();
            let current = shared
                .connections
                .get(&ctx.address)
                .is_some_and(|h| h.info.session == ctx.session);
            if current {
                shared.connections.remove(&ctx.address);
            }
            current
        };

        if let Some(e) = cause {
            match &e {
                WireError::SelfConnection => info!("Fabric: dropped self-connection to {}", ctx.address),
                e if e.is_protocol_violation() => {
                    warn!("Fabric: disconnecting {} for protocol violation: {}", ctx.address, e)
                }
                e => warn!("Fabric: connection with {} failed: {}", ctx.address, e),
            }
            self.emit(PeerEvent::ConnectionError {
                address: ctx.address.clone(),
                error: e.to_string(),
            });
        }

        if !removed {
            debug!("Fabric: stale session {} for {} ended", ctx.session, ctx.address);
            return;
        }

        let ids = self.registry.mark_address_disconnected(&ctx.address);
        debug!(
            "Fabric: connection to {} closed ({} peers disconnected)",
            ctx.address,
            ids.len()
        );
        self.emit(PeerEvent::ConnectionClose {
            address: ctx.address.clone(),
        });
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Dedup key for session-scoped messages: unique per connection.
fn session_key(session: u64, id: &MessageId) -> MessageId {
    let mut hasher = Sha256::new();
    hasher.update(session.to_be_bytes());
    hasher.update(id.as_bytes());
    MessageId(hasher.finalize().into())
}

/// Drain the connection's outbound queue onto the socket.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    address: String,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Fabric: write to {} failed: {}", address, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EmptyState, LocalIdentity};
    use crate::reader::Frame;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> PeerConfig {
        PeerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..PeerConfig::default()
        }
    }

    fn make_peer(id: &str, config: PeerConfig) -> Arc<Peer> {
        Peer::new(
            config,
            Arc::new(LocalIdentity::new(id)),
            Arc::new(EmptyState),
        )
    }

    /// Wait for the first event matching `pick`.
    async fn next_matching<T>(
        rx: &mut broadcast::Receiver<PeerEvent>,
        mut pick: impl FnMut(PeerEvent) -> Option<T>,
    ) -> T {
        timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Raw TCP client speaking the wire format by hand.
    struct RawClient {
        stream: TcpStream,
        reader: Reader,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                reader: Reader::new(),
            }
        }

        async fn send(&mut self, message: &Message) {
            self.stream.write_all(&message.to_raw()).await.unwrap();
        }

        async fn next_frame(&mut self) -> Option<Frame> {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(frame) = self.reader.next_frame().unwrap() {
                    return Some(frame);
                }
                let n = timeout(WAIT, self.stream.read(&mut buf)).await.ok()?.ok()?;
                if n == 0 {
                    return None;
                }
                self.reader.push(&buf[..n]);
            }
        }

        /// Next frame of `kind`, skipping anything else.
        async fn expect(&mut self, kind: MessageType) -> Message {
            loop {
                let frame = self.next_frame().await.expect("connection closed");
                if frame.kind() == kind {
                    return frame.to_message(true).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_over_localhost() {
        let node_a = make_peer("node-a", test_config());
        let mut events_a = node_a.subscribe();
        let addr_a = node_a.start().await.unwrap();

        let config_b = PeerConfig {
            peers: vec![format!("localhost:{}", addr_a.port())],
            ..test_config()
        };
        let node_b = make_peer("node-b", config_b);
        let mut events_b = node_b.subscribe();
        node_b.start().await.unwrap();

        let seen_by_a = next_matching(&mut events_a, |e| match e {
            PeerEvent::Peer(record) => Some(record),
            _ => None,
        })
        .await;
        let seen_by_b = next_matching(&mut events_b, |e| match e {
            PeerEvent::Peer(record) => Some(record),
            _ => None,
        })
        .await;

        assert_eq!(seen_by_a.id, "node-b");
        assert_eq!(seen_by_b.id, "node-a");
        assert_eq!(seen_by_b.address, format!("localhost:{}", addr_a.port()));
        assert!(node_a.registry().get_peer("node-b").is_some());
        assert!(node_b.registry().get_peer("node-a").is_some());

        // B replied to A's IdentityResponse with its state root.
        let (kind, body) = next_matching(&mut events_b, |e| match e {
            PeerEvent::State { kind, body, .. } => Some((kind, body)),
            _ => None,
        })
        .await;
        assert_eq!(kind, MessageType::StateRoot);
        assert_eq!(body, serde_json::json!({}));

        node_a.stop();
        node_b.stop();
    }

    #[tokio::test]
    async fn test_acceptor_answers_identity_and_ping() {
        let node = make_peer("server", test_config());
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        // The acceptor opens with its own IdentityRequest.
        let request = client.expect(MessageType::IdentityRequest).await;
        assert_eq!(request.payload_str().unwrap(), "server");

        client
            .send(&Message::new(MessageType::IdentityRequest, "client").unwrap())
            .await;
        let response = client.expect(MessageType::IdentityResponse).await;
        assert_eq!(response.payload_str().unwrap(), "server");

        client
            .send(&Message::new(MessageType::Ping, "nonce-42").unwrap())
            .await;
        let pong = client.expect(MessageType::Pong).await;
        assert_eq!(pong.payload().as_ref(), b"nonce-42");

        // No PeerRecord without an IdentityResponse from the client.
        assert_eq!(node.registry().total_count(), 0);
        node.stop();
    }

    #[tokio::test]
    async fn test_identity_response_registers_and_gets_state_root() {
        let state = || serde_json::json!({ "root": "abc" });
        let node = Peer::new(
            test_config(),
            Arc::new(LocalIdentity::new("server")),
            Arc::new(state),
        );
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        client
            .send(&Message::new(MessageType::IdentityResponse, "client-1").unwrap())
            .await;

        let root = client.expect(MessageType::StateRoot).await;
        let body: Value = root.payload_json().unwrap();
        assert_eq!(body["root"], "abc");

        let record = next_matching(&mut events, |e| match e {
            PeerEvent::Peer(record) => Some(record),
            _ => None,
        })
        .await;
        assert_eq!(record.id, "client-1");

        let client_addr = client.stream.local_addr().unwrap().to_string();
        assert!(node.connection(&client_addr).unwrap().authenticated);
        node.stop();
    }

    #[tokio::test]
    async fn test_bad_magic_disconnects() {
        let node = make_peer("server", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        let mut garbage = Message::new(MessageType::Generic, "x").unwrap().to_raw().to_vec();
        garbage[0] = 0;
        client.stream.write_all(&garbage).await.unwrap();

        let error = next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionError { error, .. } => Some(error),
            _ => None,
        })
        .await;
        assert!(error.contains("magic"), "unexpected error: {error}");

        next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionClose { .. } => Some(()),
            _ => None,
        })
        .await;

        // Server closed the socket: the client reads to EOF.
        while client.next_frame().await.is_some() {}
        assert_eq!(node.connection_count(), 0);
        node.stop();
    }

    #[tokio::test]
    async fn test_broadcast_dedup_writes_once() {
        let node = make_peer("hub", test_config());
        let addr = node.start().await.unwrap();
        let mut events = node.subscribe();

        let mut alice = RawClient::connect(addr).await;
        let mut bob = RawClient::connect(addr).await;
        for _ in 0..2 {
            next_matching(&mut events, |e| match e {
                PeerEvent::ConnectionOpen { .. } => Some(()),
                _ => None,
            })
            .await;
        }

        let message = Message::from_vector("Generic", "Hello, world!").unwrap();
        assert!(node.broadcast(&message));
        assert!(!node.broadcast(&message));

        // Send a marker after the duplicate; nothing may arrive in between.
        let marker = Message::from_vector("Generic", "marker").unwrap();
        assert!(node.broadcast(&marker));

        for client in [&mut alice, &mut bob] {
            let first = client.expect(MessageType::Generic).await;
            assert_eq!(first.id(), message.id());
            let second = client.expect(MessageType::Generic).await;
            assert_eq!(second.id(), marker.id());
        }
        assert_eq!(node.recall(&message.id()), Some(message));
        node.stop();
    }

    #[tokio::test]
    async fn test_inbound_duplicate_dropped() {
        let node = make_peer("server", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        let message = Message::from_vector("Transaction", "tx-1").unwrap();
        let marker = Message::from_vector("Transaction", "tx-2").unwrap();
        client.send(&message).await;
        client.send(&message).await;
        client.send(&marker).await;

        let mut received = Vec::new();
        while received.len() < 2 {
            let got = next_matching(&mut events, |e| match e {
                PeerEvent::Message { message, .. } => Some(message),
                _ => None,
            })
            .await;
            received.push(got.id());
        }
        assert_eq!(received, vec![message.id(), marker.id()]);
        node.stop();
    }

    #[tokio::test]
    async fn test_relay_skips_origin() {
        let config = PeerConfig {
            relay: true,
            ..test_config()
        };
        let node = make_peer("relay", config);
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut origin = RawClient::connect(addr).await;
        let mut other = RawClient::connect(addr).await;
        for _ in 0..2 {
            next_matching(&mut events, |e| match e {
                PeerEvent::ConnectionOpen { .. } => Some(()),
                _ => None,
            })
            .await;
        }

        let chat = Message::from_vector("PeerMessage", r#"{"type":"chat","text":"hi"}"#).unwrap();
        origin.send(&chat).await;

        let relayed = other.expect(MessageType::PeerMessage).await;
        assert_eq!(relayed.id(), chat.id());

        // The origin must not get its own message back; a later broadcast
        // arrives first.
        let marker = Message::from_vector("Generic", "after").unwrap();
        next_matching(&mut events, |e| match e {
            PeerEvent::Message { message, .. } if message.kind() == MessageType::PeerMessage => {
                Some(())
            }
            _ => None,
        })
        .await;
        node.broadcast(&marker);
        loop {
            let frame = origin.next_frame().await.expect("origin closed");
            assert_ne!(frame.kind(), MessageType::PeerMessage);
            if frame.kind() == MessageType::Generic {
                break;
            }
        }
        node.stop();
    }

    #[tokio::test]
    async fn test_collection_post_and_peer_candidate() {
        let node = make_peer("server", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        client
            .send(
                &Message::from_vector(
                    "PeerMessage",
                    r#"{"type":"collections:post","object":{"n":1}}"#,
                )
                .unwrap(),
            )
            .await;
        let body = next_matching(&mut events, |e| match e {
            PeerEvent::CollectionPost { body, .. } => Some(body),
            _ => None,
        })
        .await;
        assert_eq!(body["object"]["n"], 1);

        client
            .send(
                &Message::from_json(
                    MessageType::PeerInstruction,
                    &Instruction::PeerCandidate {
                        address: "10.1.2.3:7777".to_string(),
                    },
                )
                .unwrap(),
            )
            .await;
        let candidate = next_matching(&mut events, |e| match e {
            PeerEvent::PeerCandidate { address } => Some(address),
            _ => None,
        })
        .await;
        assert_eq!(candidate, "10.1.2.3:7777");
        node.stop();
    }

    #[tokio::test]
    async fn test_invalid_peer_message_json_disconnects() {
        let node = make_peer("server", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        client
            .send(&Message::from_vector("PeerMessage", "not json").unwrap())
            .await;

        next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionClose { .. } => Some(()),
            _ => None,
        })
        .await;
        node.stop();
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_address() {
        let node = make_peer("dialer", test_config());
        assert!(node.connect("no-port").await.is_none());
        assert!(matches!(
            node.try_connect("a:b:c").await,
            Err(WireError::AddressFormat(_))
        ));
        assert_eq!(node.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let server = make_peer("server", test_config());
        let addr = server.start().await.unwrap();
        let dialer = make_peer("dialer", test_config());

        let address = format!("127.0.0.1:{}", addr.port());
        let first = dialer.connect(&address).await.unwrap();
        let second = dialer.connect(&address).await.unwrap();
        assert_eq!(first.session, second.session);
        assert_eq!(first.direction, Direction::Initiator);
        assert_eq!(dialer.connection_count(), 1);

        server.stop();
        dialer.stop();
    }

    #[tokio::test]
    async fn test_self_connection_dropped() {
        let node = make_peer("loop", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        node.connect(&format!("127.0.0.1:{}", addr.port())).await;
        let error = next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionError { error, .. } => Some(error),
            _ => None,
        })
        .await;
        assert!(error.contains("self"), "unexpected error: {error}");
        assert!(node.registry().get_peer("loop").is_none());
        node.stop();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let node = make_peer("once", test_config());
        node.start().await.unwrap();
        assert!(matches!(
            node.start().await,
            Err(WireError::AlreadyStarted)
        ));
        node.stop();
        assert!(node.is_stopped());
    }

    #[tokio::test]
    async fn test_close_marks_record_disconnected() {
        let server = make_peer("server", test_config());
        let mut events = server.subscribe();
        let addr = server.start().await.unwrap();

        let client = make_peer("client", test_config());
        client.connect(&format!("127.0.0.1:{}", addr.port())).await.unwrap();
        next_matching(&mut events, |e| match e {
            PeerEvent::Peer(_) => Some(()),
            _ => None,
        })
        .await;

        client.stop();
        next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionClose { .. } => Some(()),
            _ => None,
        })
        .await;
        let record = server.registry().get_peer("client").unwrap();
        assert_eq!(record.state, crate::registry::PeerState::Disconnected);
        server.stop();
    }

    #[tokio::test]
    async fn test_announce_candidate_reaches_remote() {
        let node_a = make_peer("node-a", test_config());
        let mut events_a = node_a.subscribe();
        let addr_a = node_a.start().await.unwrap();

        let node_b = make_peer("node-b", test_config());
        let mut events_b = node_b.subscribe();
        node_b
            .connect(&format!("127.0.0.1:{}", addr_a.port()))
            .await
            .unwrap();
        next_matching(&mut events_a, |e| match e {
            PeerEvent::Peer(_) => Some(()),
            _ => None,
        })
        .await;

        assert!(node_a.announce_candidate("10.4.4.4:7777").unwrap());
        // Same instruction, same id: not sent twice.
        assert!(!node_a.announce_candidate("10.4.4.4:7777").unwrap());

        let candidate = next_matching(&mut events_b, |e| match e {
            PeerEvent::PeerCandidate { address } => Some(address),
            _ => None,
        })
        .await;
        assert_eq!(candidate, "10.4.4.4:7777");

        assert!(matches!(
            node_a.announce_candidate("not-an-address"),
            Err(WireError::AddressFormat(_))
        ));
        node_a.stop();
        node_b.stop();
    }

    #[tokio::test]
    async fn test_relay_from_peer_id_skips_origin() {
        let hub = make_peer("hub", test_config());
        let mut hub_events = hub.subscribe();
        let addr = hub.start().await.unwrap();
        let address = format!("127.0.0.1:{}", addr.port());

        let origin = make_peer("origin", test_config());
        let mut origin_events = origin.subscribe();
        let other = make_peer("other", test_config());
        let mut other_events = other.subscribe();
        origin.connect(&address).await.unwrap();
        other.connect(&address).await.unwrap();
        for _ in 0..2 {
            next_matching(&mut hub_events, |e| match e {
                PeerEvent::Peer(_) => Some(()),
                _ => None,
            })
            .await;
        }

        let message = Message::from_vector("Generic", "relayed").unwrap();
        assert_eq!(hub.relay_from("origin", &message), 1);

        let got = next_matching(&mut other_events, |e| match e {
            PeerEvent::Message { message, .. } => Some(message),
            _ => None,
        })
        .await;
        assert_eq!(got.id(), message.id());

        // Anything relayed to the origin would arrive before this.
        let marker = Message::from_vector("Generic", "marker").unwrap();
        assert!(hub.broadcast(&marker));
        let first = next_matching(&mut origin_events, |e| match e {
            PeerEvent::Message { message, .. } => Some(message),
            _ => None,
        })
        .await;
        assert_eq!(first.id(), marker.id());

        hub.stop();
        origin.stop();
        other.stop();
    }

    fn tampered_frame() -> Vec<u8> {
        let mut raw = Message::from_vector("Transaction", "tx-9")
            .unwrap()
            .to_raw()
            .to_vec();
        // First byte of the header hash.
        raw[16] ^= 0xFF;
        raw
    }

    #[tokio::test]
    async fn test_hash_mismatch_disconnects_when_verifying() {
        let node = make_peer("strict", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        client.stream.write_all(&tampered_frame()).await.unwrap();

        let error = next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionError { error, .. } => Some(error),
            _ => None,
        })
        .await;
        assert!(error.contains("hash"), "unexpected error: {error}");
        next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionClose { .. } => Some(()),
            _ => None,
        })
        .await;
        node.stop();
    }

    #[tokio::test]
    async fn test_hash_mismatch_accepted_when_not_verifying() {
        let config = PeerConfig {
            verify_hash: false,
            ..test_config()
        };
        let node = make_peer("lenient", config);
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        client.stream.write_all(&tampered_frame()).await.unwrap();

        let message = next_matching(&mut events, |e| match e {
            PeerEvent::Message { message, .. } => Some(message),
            PeerEvent::ConnectionClose { .. } => panic!("connection dropped"),
            _ => None,
        })
        .await;
        assert_eq!(message.kind(), MessageType::Transaction);
        assert_eq!(message.payload().as_ref(), b"tx-9");
        assert!(!message.verify_hash());
        assert_eq!(node.connection_count(), 1);
        node.stop();
    }

    #[tokio::test]
    async fn test_state_messages_emit_state() {
        let node = make_peer("server", test_config());
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        let sent = [
            (MessageType::StateCommitment, serde_json::json!({ "commit": 1 })),
            (MessageType::StateChange, serde_json::json!({ "change": 2 })),
            (MessageType::StateRequest, serde_json::json!({ "request": 3 })),
        ];
        for (kind, body) in &sent {
            client.send(&Message::from_json(*kind, body).unwrap()).await;
        }

        for (kind, body) in sent {
            let got = next_matching(&mut events, |e| match e {
                PeerEvent::State { kind, body, .. } => Some((kind, body)),
                _ => None,
            })
            .await;
            assert_eq!(got, (kind, body));
        }
        node.stop();
    }

    #[tokio::test]
    async fn test_pings_do_not_evict_relayed_ids() {
        let config = PeerConfig {
            dedup_capacity: 4,
            session_dedup_capacity: 2,
            ..test_config()
        };
        let node = make_peer("server", config);
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let mut client = RawClient::connect(addr).await;
        let message = Message::from_vector("Transaction", "tx-1").unwrap();
        let marker = Message::from_vector("Transaction", "tx-2").unwrap();
        client.send(&message).await;
        for i in 0..10 {
            client
                .send(&Message::new(MessageType::Ping, format!("nonce-{i}")).unwrap())
                .await;
        }
        client.send(&message).await;
        client.send(&marker).await;

        let mut received = Vec::new();
        while received.len() < 2 {
            let got = next_matching(&mut events, |e| match e {
                PeerEvent::Message { message, .. } => Some(message),
                _ => None,
            })
            .await;
            received.push(got.id());
        }
        assert_eq!(received, vec![message.id(), marker.id()]);
        node.stop();
    }

    #[tokio::test]
    async fn test_inbound_over_capacity_reported() {
        let config = PeerConfig {
            max_connections: 1,
            ..test_config()
        };
        let node = make_peer("full", config);
        let mut events = node.subscribe();
        let addr = node.start().await.unwrap();

        let _first = RawClient::connect(addr).await;
        next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionOpen { .. } => Some(()),
            _ => None,
        })
        .await;
        assert!(!node.is_over_capacity());

        let _second = RawClient::connect(addr).await;
        next_matching(&mut events, |e| match e {
            PeerEvent::ConnectionOpen { .. } => Some(()),
            _ => None,
        })
        .await;
        assert_eq!(node.connection_count(), 2);
        assert!(node.is_over_capacity());
        node.stop();
    }
}
