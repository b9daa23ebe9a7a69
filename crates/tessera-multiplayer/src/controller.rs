//! The process-wide network controller.
//!
//! Owns every network view, the server session with its peers, and the
//! connection to a parent server. The application drives it with
//! [`update_read`](NetworkController::update_read) early in a frame and
//! [`update_write`](NetworkController::update_write) late in the same frame;
//! both only do work on network ticks.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tessera_config::{NetworkConfig, UpdateCheckType};
use tessera_net::{
    ClientSession, ClientSessionHandler, ConnectionId, DataReader, DataWriter, NetworkNode,
    ServerSession, ServerSessionHandler, ServerSideClientSession, SessionError, TransportConfig,
};

use crate::context::{Command, HandlerContext, ResponseCallback, Route, response_callback, run_guarded};
use crate::component::ComponentState;
use crate::event::{MessageKind, NetworkEvent};
use crate::link::{ConnectedLink, ServerLink};
use crate::message::{
    EntityMessage, HandlerError, MessageRegistry, RESERVED_TYPE_IDS, ResponseData, decode_body,
    encode_body,
};
use crate::network_id::NetworkId;
use crate::node::{MultiplayerNode, SendError};
use crate::peer_id::{DESTROY_VIEW_RPC, RegisterPeerId, RequestPeerId, ResponsePeerId, assign_peer_id};
use crate::rpc::RpcValue;
use crate::view::{NetworkView, SynchronizeHandler};

/// Controller-local handle of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u32);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// An endpoint events can be sent to or received from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKey {
    /// The parent server this process is a client of.
    Server,
    /// A peer connected to this process's server session.
    Peer(PeerHandle),
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Peer(handle) => handle.fmt(f),
        }
    }
}

/// Connection lifecycle notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplayerEvent {
    PeerConnected(PeerHandle),
    PeerDisconnected {
        peer: PeerHandle,
        peer_id: Option<NetworkId>,
    },
    PeerAuthorized {
        peer: PeerHandle,
        peer_id: NetworkId,
    },
    ConnectedToServer,
    DisconnectedFromServer,
    AuthorizedFromServer(NetworkId),
}

/// Tick timing and transport settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub update_check: UpdateCheckType,
    /// Milliseconds between ticks in Time mode, frames in Frame mode.
    pub update_period: u64,
    /// Minimum gap between snapshots in Time mode.
    pub synchronize_interval: Duration,
    /// Inbound frames read per node per tick in Time mode.
    pub max_read_events_per_tick: usize,
    pub transport: TransportConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            update_check: UpdateCheckType::Time,
            update_period: 50,
            synchronize_interval: Duration::from_millis(100),
            max_read_events_per_tick: 40,
            transport: TransportConfig::default(),
        }
    }
}

impl From<&NetworkConfig> for ControllerConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            update_check: config.update_check,
            update_period: config.update_period,
            synchronize_interval: Duration::from_millis(config.synchronize_interval_ms),
            max_read_events_per_tick: config.max_read_events_per_tick,
            transport: TransportConfig {
                inbound_capacity: config.inbound_queue_capacity,
                outbound_capacity: config.outbound_queue_capacity,
                max_backlog: config.max_outbound_backlog,
                max_connections: config.max_connections,
                pool_size: config.message_pool_size,
                ..TransportConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Server,
    Client,
}

/// Decides which frames are network ticks and when snapshots are due.
struct UpdateClock {
    check: UpdateCheckType,
    period: u64,
    synchronize_interval: u64,
    started: Instant,
    frame: u64,
    last_update: u64,
    last_synchronize: u64,
    tick_pending: bool,
}

impl UpdateClock {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            check: config.update_check,
            period: config.update_period,
            synchronize_interval: config.synchronize_interval.as_millis() as u64,
            started: Instant::now(),
            frame: 0,
            last_update: 0,
            last_synchronize: 0,
            tick_pending: false,
        }
    }

    fn now(&self) -> u64 {
        match self.check {
            UpdateCheckType::Time => self.started.elapsed().as_millis() as u64,
            UpdateCheckType::Frame => self.frame,
        }
    }

    /// Advance one frame; `true` when this frame is a network tick.
    fn begin_frame(&mut self) -> bool {
        self.frame += 1;
        let now = self.now();
        self.tick_pending = now.saturating_sub(self.last_update) >= self.period;
        if self.tick_pending {
            self.last_update = now;
        }
        self.tick_pending
    }

    fn take_tick(&mut self) -> bool {
        std::mem::take(&mut self.tick_pending)
    }

    fn synchronize_due(&mut self) -> bool {
        let now = self.now();
        let due = match self.check {
            UpdateCheckType::Time => now.saturating_sub(self.last_synchronize) > self.synchronize_interval,
            UpdateCheckType::Frame => now.saturating_sub(self.last_synchronize) >= self.period,
        };
        if due {
            self.last_synchronize = now;
        }
        due
    }

    fn read_budget(&self, max_per_tick: usize) -> usize {
        match self.check {
            UpdateCheckType::Time => max_per_tick,
            UpdateCheckType::Frame => usize::MAX,
        }
    }
}

type NodeOf<N> = MultiplayerNode<N, ResponseCallback>;

struct Peer {
    node: NodeOf<Box<dyn NetworkNode>>,
    peer_id: Option<NetworkId>,
    connection: Option<ConnectionId>,
}

enum ServerChange {
    Connected(ServerSideClientSession),
    Disconnected(ConnectionId),
}

#[derive(Default)]
struct ServerChanges(Vec<ServerChange>);

impl ServerSessionHandler for ServerChanges {
    fn on_client_connect(&mut self, client: ServerSideClientSession) {
        self.0.push(ServerChange::Connected(client));
    }

    fn on_client_disconnect(&mut self, id: ConnectionId) {
        self.0.push(ServerChange::Disconnected(id));
    }
}

#[derive(Default)]
struct LinkChanges(Vec<bool>);

impl ClientSessionHandler for LinkChanges {
    fn on_connected_to_server(&mut self) {
        self.0.push(true);
    }

    fn on_disconnected_from_server(&mut self) {
        self.0.push(false);
    }
}

/// Run `$body` with `$node` bound to the multiplayer node behind `$key`.
/// Evaluates to `None` when there is no such node.
macro_rules! on_node {
    ($self:ident, $key:expr, $node:ident => $body:expr) => {
        match $key {
            NodeKey::Server => $self.parent.as_mut().map(|$node| $body),
            NodeKey::Peer(handle) => $self.peers.get_mut(&handle).map(|peer| {
                let $node = &mut peer.node;
                $body
            }),
        }
    };
}

/// Process-wide owner of views, sessions and peers.
pub struct NetworkController {
    config: ControllerConfig,
    registry: MessageRegistry,
    views: FxHashMap<NetworkId, NetworkView>,
    synchronizable: Vec<NetworkId>,
    peer_id: Option<NetworkId>,
    is_root: bool,
    next_object_chunk: u16,
    last_given_peer_id: u16,
    server: Option<ServerSession>,
    peers: BTreeMap<PeerHandle, Peer>,
    connections: FxHashMap<ConnectionId, PeerHandle>,
    next_peer_handle: u32,
    parent: Option<NodeOf<Box<dyn ServerLink>>>,
    default_session: Option<SessionKind>,
    clock: UpdateClock,
    events: VecDeque<MultiplayerEvent>,
    outbox: Vec<Command>,
    inbox: Vec<Vec<u8>>,
}

impl NetworkController {
    pub fn new(config: ControllerConfig, registry: MessageRegistry) -> Self {
        let mut views = FxHashMap::default();
        views.insert(NetworkId::ROOT, NetworkView::new(NetworkId::ROOT));
        Self {
            clock: UpdateClock::new(&config),
            config,
            registry,
            views,
            synchronizable: Vec::new(),
            peer_id: None,
            is_root: false,
            next_object_chunk: 1,
            last_given_peer_id: 0,
            server: None,
            peers: BTreeMap::new(),
            connections: FxHashMap::default(),
            next_peer_handle: 1,
            parent: None,
            default_session: None,
            events: VecDeque::new(),
            outbox: Vec::new(),
            inbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Make this process the root of the id hierarchy.
    pub fn set_root(&mut self) {
        self.is_root = true;
        self.peer_id = Some(NetworkId::ROOT);
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// This process's session id, once known.
    pub fn peer_id(&self) -> Option<NetworkId> {
        self.peer_id
    }

    /// A fresh object id owned by `owner`. Chunks still held by a live view
    /// are skipped; `None` once every chunk under `owner` is taken.
    pub fn generate_network_id(&mut self, owner: NetworkId) -> Option<NetworkId> {
        for _ in 0..u16::MAX {
            let chunk = self.next_object_chunk;
            // Chunk 0 addresses the child-session controller.
            self.next_object_chunk = chunk.checked_add(1).unwrap_or(1);
            let id = NetworkId::generate(owner, chunk);
            if !self.views.contains_key(&id) {
                return Some(id);
            }
        }
        tracing::warn!(%owner, "no free object id left");
        None
    }

    /// Whether this process owns `id`.
    pub fn is_mine(&self, id: NetworkId) -> bool {
        self.peer_id.is_some_and(|peer_id| id.is_owned_by(peer_id))
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Register a view under `id` and link it to its parent object view.
    pub fn create_view(&mut self, id: NetworkId) -> &mut NetworkView {
        debug_assert!(!self.views.contains_key(&id), "view {id} already exists");
        if let Some(parent) = id.parent_object()
            && let Some(parent_view) = self.views.get_mut(&parent)
        {
            parent_view.children_mut().insert(id);
        }
        self.views.entry(id).or_insert_with(|| NetworkView::new(id))
    }

    /// Create a view with a fresh id owned by `owner`.
    pub fn spawn_view(&mut self, owner: NetworkId) -> Option<NetworkId> {
        let id = self.generate_network_id(owner)?;
        self.create_view(id);
        Some(id)
    }

    pub fn find_network_view(&self, id: NetworkId) -> Option<&NetworkView> {
        self.views.get(&id)
    }

    pub fn find_network_view_mut(&mut self, id: NetworkId) -> Option<&mut NetworkView> {
        self.views.get_mut(&id)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// State of component `name` on view `id`, if it has type `S`.
    pub fn component_state<S: 'static>(&self, id: NetworkId, name: &str) -> Option<&S> {
        self.views.get(&id)?.component(name)?.data()
    }

    pub fn component_state_mut<S: 'static>(&mut self, id: NetworkId, name: &str) -> Option<&mut S> {
        self.views.get_mut(&id)?.component_mut(name)?.data_mut()
    }

    pub fn set_synchronize_handler(
        &mut self,
        id: NetworkId,
        handler: Option<Box<dyn SynchronizeHandler>>,
    ) -> bool {
        let Some(view) = self.views.get_mut(&id) else {
            return false;
        };
        self.synchronizable.retain(|&s| s != id);
        if handler.is_some() {
            self.synchronizable.push(id);
        }
        view.synchronize = handler;
        true
    }

    /// Restrict which peers receive the view's snapshots. `None` means all.
    pub fn set_synchronization_peers(&mut self, id: NetworkId, peers: Option<Vec<PeerHandle>>) -> bool {
        match self.views.get_mut(&id) {
            Some(view) => {
                view.set_synchronization_peers(peers);
                true
            }
            None => false,
        }
    }

    /// Move object view `id` under `new_parent`. Every descendant gets a new
    /// id as well. Returns the view's new id.
    pub fn reparent_view(&mut self, id: NetworkId, new_parent: NetworkId) -> Option<NetworkId> {
        if !self.views.contains_key(&id) {
            return None;
        }
        let new_id = id.with_new_parent(new_parent);
        self.readdress(id, new_id);
        Some(new_id)
    }

    fn readdress(&mut self, old: NetworkId, new: NetworkId) {
        let Some(mut view) = self.views.remove(&old) else {
            return;
        };
        if let Some(parent) = old.parent_object()
            && let Some(parent_view) = self.views.get_mut(&parent)
        {
            parent_view.children_mut().remove(&old);
        }
        if let Some(slot) = self.synchronizable.iter_mut().find(|s| **s == old) {
            *slot = new;
        }

        let children = std::mem::take(view.children_mut());
        view.set_id(new);
        if let Some(parent) = new.parent_object()
            && let Some(parent_view) = self.views.get_mut(&parent)
        {
            parent_view.children_mut().insert(new);
        }
        self.views.insert(new, view);

        for child in children {
            self.readdress(child, child.with_new_parent(new));
        }
    }

    /// Destroy a view and its descendants. Views this process owns are
    /// destroyed on the remote side too.
    pub fn destroy_view(&mut self, id: NetworkId) {
        if !self.views.contains_key(&id) {
            return;
        }
        if self.is_mine(id)
            && self.default_session.is_some()
            && let Err(e) = self.send_rpc(Route::Default, id, DESTROY_VIEW_RPC, &[])
        {
            tracing::warn!(view = %id, "failed to announce destroy: {e}");
        }
        self.destroy_local(id);
        self.apply_outbox();
    }

    fn destroy_local(&mut self, id: NetworkId) {
        debug_assert!(!id.is_root(), "the root view is never destroyed");
        let Some(mut view) = self.views.remove(&id) else {
            return;
        };
        if let Some(parent) = id.parent_object()
            && let Some(parent_view) = self.views.get_mut(&parent)
        {
            parent_view.children_mut().remove(&id);
        }
        self.synchronizable.retain(|&s| s != id);

        let children: Vec<_> = view.children().collect();
        for child in children {
            self.destroy_local(child);
        }

        let local_peer_id = self.peer_id;
        for component in view.components.iter_mut() {
            let mut ctx = HandlerContext {
                source: None,
                source_peer_id: None,
                view: id,
                local_peer_id,
                request_id: None,
                outbox: &mut self.outbox,
            };
            let label = format!("{}::destroy", component.name());
            run_guarded(&label, id, || component.destroy(&mut ctx));
        }
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start the server session on `addr`.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, SessionError> {
        debug_assert!(self.server.is_none(), "server session already started");
        let session = ServerSession::listen(addr, &self.config.transport)?;
        let local_addr = session.local_addr();
        self.server = Some(session);
        self.default_session.get_or_insert(SessionKind::Server);
        Ok(local_addr)
    }

    /// Serve a peer over an already connected transport.
    pub fn attach_peer(&mut self, node: impl NetworkNode + 'static) -> PeerHandle {
        self.default_session.get_or_insert(SessionKind::Server);
        self.add_peer(Box::new(node), None)
    }

    fn add_peer(&mut self, node: Box<dyn NetworkNode>, connection: Option<ConnectionId>) -> PeerHandle {
        let handle = PeerHandle(self.next_peer_handle);
        self.next_peer_handle += 1;
        self.peers.insert(
            handle,
            Peer {
                node: MultiplayerNode::new(node),
                peer_id: None,
                connection,
            },
        );
        if let Some(connection) = connection {
            self.connections.insert(connection, handle);
        }
        tracing::info!("{handle} connected");
        self.events.push_back(MultiplayerEvent::PeerConnected(handle));
        handle
    }

    /// Drop a peer and close its transport.
    pub fn disconnect_peer(&mut self, handle: PeerHandle) {
        let Some(mut peer) = self.peers.remove(&handle) else {
            return;
        };
        if let Some(connection) = peer.connection {
            self.connections.remove(&connection);
        }
        peer.node.close();
        tracing::info!("{handle} disconnected");
        self.events.push_back(MultiplayerEvent::PeerDisconnected {
            peer: handle,
            peer_id: peer.peer_id,
        });
    }

    /// Stop the server session and drop every peer.
    pub fn close_server(&mut self) {
        let handles: Vec<_> = self.peers.keys().copied().collect();
        for handle in handles {
            self.disconnect_peer(handle);
        }
        self.server = None;
    }

    /// Connect to a parent server over TCP.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), SessionError> {
        let session = ClientSession::connect(addr, &self.config.transport)?;
        self.connect_with(session);
        Ok(())
    }

    /// Use `link` as the connection to the parent server.
    pub fn connect_with(&mut self, link: impl ServerLink + 'static) {
        debug_assert!(self.parent.is_none(), "parent session already assigned");
        let link: Box<dyn ServerLink> = Box::new(link);
        self.parent = Some(MultiplayerNode::new(link));
        self.default_session.get_or_insert(SessionKind::Client);
    }

    /// Use an already connected transport as the connection to the server.
    pub fn connect_local(&mut self, node: impl NetworkNode + 'static) {
        self.connect_with(ConnectedLink::new(node));
    }

    /// Close the connection to the parent server.
    pub fn disconnect(&mut self) {
        if let Some(mut parent) = self.parent.take() {
            parent.close();
            self.on_disconnected_from_server();
        }
    }

    pub fn is_server(&self) -> bool {
        self.default_session == Some(SessionKind::Server)
    }

    pub fn is_client(&self) -> bool {
        self.parent.is_some()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(ServerSession::local_addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = (PeerHandle, Option<NetworkId>)> + '_ {
        self.peers.iter().map(|(&handle, peer)| (handle, peer.peer_id))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_id_of(&self, handle: PeerHandle) -> Option<NetworkId> {
        self.peers.get(&handle)?.peer_id
    }

    pub fn find_peer(&self, peer_id: NetworkId) -> Option<PeerHandle> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.peer_id == Some(peer_id))
            .map(|(&handle, _)| handle)
    }

    /// Next lifecycle notification, oldest first.
    pub fn poll_event(&mut self) -> Option<MultiplayerEvent> {
        self.events.pop_front()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Call `method` on `view` through the default session.
    pub fn rpc(&mut self, view: NetworkId, method: &str, args: &[RpcValue]) -> Result<(), SendError> {
        self.send_rpc(Route::Default, view, method, args)
    }

    pub fn rpc_to(
        &mut self,
        node: NodeKey,
        view: NetworkId,
        method: &str,
        args: &[RpcValue],
    ) -> Result<(), SendError> {
        self.send_rpc(Route::Node(node), view, method, args)
    }

    pub fn send_message<M: EntityMessage>(&mut self, view: NetworkId, message: &M) -> Result<(), SendError> {
        let body = encode_body(M::NAME, message)?;
        self.send_raw_message(Route::Default, view, M::TYPE_ID, &body)
    }

    pub fn send_message_to<M: EntityMessage>(
        &mut self,
        node: NodeKey,
        view: NetworkId,
        message: &M,
    ) -> Result<(), SendError> {
        let body = encode_body(M::NAME, message)?;
        self.send_raw_message(Route::Node(node), view, M::TYPE_ID, &body)
    }

    /// Send a request to the parent server.
    pub fn request<M, R, F>(&mut self, view: NetworkId, message: &M, on_response: F) -> Result<u16, SendError>
    where
        M: EntityMessage,
        R: ResponseData,
        F: FnOnce(&mut HandlerContext<'_>, R) -> Result<(), HandlerError> + 'static,
    {
        self.request_to(NodeKey::Server, view, message, on_response)
    }

    /// Send a request to `node`; `on_response` runs when the reply arrives.
    pub fn request_to<M, R, F>(
        &mut self,
        node: NodeKey,
        view: NetworkId,
        message: &M,
        on_response: F,
    ) -> Result<u16, SendError>
    where
        M: EntityMessage,
        R: ResponseData,
        F: FnOnce(&mut HandlerContext<'_>, R) -> Result<(), HandlerError> + 'static,
    {
        let body = encode_body(M::NAME, message)?;
        self.send_raw_request(node, view, M::TYPE_ID, &body, response_callback(on_response))
    }

    fn targets(&self, route: Route) -> Result<Vec<NodeKey>, SendError> {
        match route {
            Route::Node(key) => Ok(vec![key]),
            Route::Default => match self.default_session {
                Some(SessionKind::Server) => Ok(self.peers.keys().map(|&h| NodeKey::Peer(h)).collect()),
                Some(SessionKind::Client) if self.parent.is_some() => Ok(vec![NodeKey::Server]),
                _ => Err(SendError::NoSession),
            },
        }
    }

    fn send_rpc(
        &mut self,
        route: Route,
        view: NetworkId,
        method: &str,
        args: &[RpcValue],
    ) -> Result<(), SendError> {
        for key in self.targets(route)? {
            on_node!(self, key, node => node.add_rpc_event(view, method, args))
                .ok_or(SendError::UnknownNode(key))??;
        }
        Ok(())
    }

    fn send_raw_message(
        &mut self,
        route: Route,
        view: NetworkId,
        type_id: u16,
        body: &[u8],
    ) -> Result<(), SendError> {
        for key in self.targets(route)? {
            on_node!(self, key, node => node.add_entity_message_event(view, type_id, body))
                .ok_or(SendError::UnknownNode(key))??;
        }
        Ok(())
    }

    fn send_raw_request(
        &mut self,
        key: NodeKey,
        view: NetworkId,
        type_id: u16,
        body: &[u8],
        callback: ResponseCallback,
    ) -> Result<u16, SendError> {
        on_node!(self, key, node => node.add_request_event(view, type_id, body, callback))
            .ok_or(SendError::UnknownNode(key))?
    }

    fn apply_outbox(&mut self) {
        while !self.outbox.is_empty() {
            for command in std::mem::take(&mut self.outbox) {
                self.apply_command(command);
            }
        }
    }

    fn apply_command(&mut self, command: Command) {
        let result = match command {
            Command::Rpc {
                route,
                view,
                method,
                args,
            } => self.send_rpc(route, view, &method, &args),
            Command::Message {
                route,
                view,
                type_id,
                body,
            } => self.send_raw_message(route, view, type_id, &body),
            Command::Request {
                node,
                view,
                type_id,
                body,
                callback,
            } => self.send_raw_request(node, view, type_id, &body, callback).map(drop),
            Command::Respond {
                node,
                type_id,
                request_id,
                body,
            } => on_node!(self, node, n => n.respond_entity_message_event(type_id, request_id, &body))
                .ok_or(SendError::UnknownNode(node))
                .and_then(|result| result),
            Command::DestroyView(id) => {
                self.destroy_view(id);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!("dropping queued command: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    /// Read phase of a frame. Returns `false` when this frame is not a
    /// network tick.
    pub fn update_read(&mut self) -> bool {
        if !self.clock.begin_frame() {
            return false;
        }

        self.handle_connection_events();
        self.advance_lifecycle();

        let budget = self.clock.read_budget(self.config.max_read_events_per_tick);
        if self.parent.is_some() {
            self.read_node(NodeKey::Server, budget);
        }
        let handles: Vec<_> = self.peers.keys().copied().collect();
        for handle in handles {
            self.read_node(NodeKey::Peer(handle), budget);
        }

        self.reap_disconnected();
        true
    }

    /// Write phase of a frame: snapshots when due, then flush every node.
    pub fn update_write(&mut self) {
        if !self.clock.take_tick() {
            return;
        }

        if self.default_session.is_some() && self.clock.synchronize_due() {
            self.send_snapshots();
        }

        if let Some(parent) = self.parent.as_mut() {
            parent.finalize_and_send_message();
        }
        for peer in self.peers.values_mut() {
            peer.node.finalize_and_send_message();
        }
    }

    fn handle_connection_events(&mut self) {
        if let Some(server) = self.server.as_mut() {
            let mut changes = ServerChanges::default();
            server.handle_connection_events(&mut changes);
            for change in changes.0 {
                match change {
                    ServerChange::Connected(client) => {
                        let connection = client.id();
                        self.add_peer(Box::new(client), Some(connection));
                    }
                    ServerChange::Disconnected(connection) => {
                        if let Some(&handle) = self.connections.get(&connection) {
                            self.disconnect_peer(handle);
                        }
                    }
                }
            }
        }

        if let Some(parent) = self.parent.as_mut() {
            let mut changes = LinkChanges::default();
            parent.transport_mut().handle_link_events(&mut changes);
            for connected in changes.0 {
                if connected {
                    self.on_connected_to_server();
                } else if let Some(mut parent) = self.parent.take() {
                    parent.close();
                    self.on_disconnected_from_server();
                }
            }
        }
    }

    fn on_connected_to_server(&mut self) {
        tracing::info!("connected to server");
        self.events.push_back(MultiplayerEvent::ConnectedToServer);
        let result = match self.peer_id {
            Some(peer_id) => self.send_message_to(NodeKey::Server, NetworkId::ROOT, &RegisterPeerId { peer_id }),
            None => self.send_message_to(NodeKey::Server, NetworkId::ROOT, &RequestPeerId),
        };
        if let Err(e) = result {
            tracing::warn!("failed to request a peer id: {e}");
        }
    }

    fn on_disconnected_from_server(&mut self) {
        tracing::info!("disconnected from server");
        if !self.is_root {
            self.peer_id = None;
        }
        self.events.push_back(MultiplayerEvent::DisconnectedFromServer);
    }

    fn reap_disconnected(&mut self) {
        let closed: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, peer)| !peer.node.is_connected())
            .map(|(&handle, _)| handle)
            .collect();
        for handle in closed {
            self.disconnect_peer(handle);
        }
    }

    fn advance_lifecycle(&mut self) {
        let local_peer_id = self.peer_id;
        for target in [ComponentState::Uninitialized, ComponentState::Initialized] {
            for view in self.views.values_mut() {
                let id = view.id();
                for component in view.components.iter_mut().filter(|c| c.state() == target) {
                    let mut ctx = HandlerContext {
                        source: None,
                        source_peer_id: None,
                        view: id,
                        local_peer_id,
                        request_id: None,
                        outbox: &mut self.outbox,
                    };
                    if target == ComponentState::Uninitialized {
                        let label = format!("{}::initialize", component.name());
                        run_guarded(&label, id, || component.initialize(&mut ctx));
                    } else {
                        let label = format!("{}::start", component.name());
                        run_guarded(&label, id, || component.start(&mut ctx));
                    }
                }
            }
        }
        self.apply_outbox();
    }

    fn read_node(&mut self, key: NodeKey, budget: usize) {
        for _ in 0..budget {
            let mut inbox = std::mem::take(&mut self.inbox);
            let consumed = on_node!(self, key, node => {
                node.process_event(&mut |event: &[u8]| inbox.push(event.to_vec()))
            })
            .unwrap_or(false);

            for event in inbox.drain(..) {
                self.dispatch_event(key, &event);
            }
            self.inbox = inbox;

            if !consumed {
                break;
            }
        }
    }

    fn source_peer_id(&self, source: NodeKey) -> Option<NetworkId> {
        match source {
            NodeKey::Server => None,
            NodeKey::Peer(handle) => self.peer_id_of(handle),
        }
    }

    fn dispatch_event(&mut self, source: NodeKey, bytes: &[u8]) {
        let event = match NetworkEvent::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%source, "dropping malformed event: {e}");
                return;
            }
        };

        match event {
            NetworkEvent::Rpc { view, method, args } => self.dispatch_rpc(source, view, &method, &args),
            NetworkEvent::Synchronize { view, data } => self.dispatch_synchronize(view, data),
            NetworkEvent::EntityMessage {
                view,
                type_id,
                kind,
                body,
            } => self.dispatch_message(source, view, type_id, kind, body),
            NetworkEvent::Response {
                type_id,
                request_id,
                body,
            } => self.dispatch_response(source, type_id, request_id, body),
        }
        self.apply_outbox();
    }

    fn dispatch_rpc(&mut self, source: NodeKey, view: NetworkId, method: &str, args: &[RpcValue]) {
        if method == DESTROY_VIEW_RPC && args.is_empty() {
            if !view.is_root() {
                self.destroy_local(view);
            }
            return;
        }

        let source_peer_id = self.source_peer_id(source);
        let local_peer_id = self.peer_id;
        let Some(target) = self.views.get_mut(&view) else {
            tracing::debug!(%view, method, "rpc for unknown view");
            return;
        };

        let component = target
            .components
            .iter_mut()
            .find(|c| c.state() == ComponentState::Started && c.has_rpc(method, args));
        let Some(component) = component else {
            tracing::warn!(%view, method, "rpc not found");
            return;
        };

        let mut ctx = HandlerContext {
            source: Some(source),
            source_peer_id,
            view,
            local_peer_id,
            request_id: None,
            outbox: &mut self.outbox,
        };
        let label = format!("{}::{method}", component.name());
        run_guarded(&label, view, || {
            component.invoke_rpc(method, args, &mut ctx).unwrap_or(Ok(()))
        });
    }

    fn dispatch_synchronize(&mut self, view: NetworkId, data: &[u8]) {
        let Some(handler) = self
            .views
            .get_mut(&view)
            .and_then(|target| target.synchronize.as_mut())
        else {
            tracing::debug!(%view, "snapshot for a view without a synchronize handler");
            return;
        };
        run_guarded(&"synchronize", view, || {
            handler.deserialize(&mut DataReader::new(data))
        });
    }

    fn dispatch_message(
        &mut self,
        source: NodeKey,
        view: NetworkId,
        type_id: u16,
        kind: MessageKind,
        body: &[u8],
    ) {
        if type_id >= RESERVED_TYPE_IDS {
            self.handle_builtin(source, type_id, body);
            return;
        }
        let Some(message_name) = self.registry.name(type_id) else {
            tracing::warn!(%source, type_id, "dropping message of unregistered type");
            return;
        };

        let source_peer_id = self.source_peer_id(source);
        let local_peer_id = self.peer_id;
        let Some(target) = self.views.get_mut(&view) else {
            tracing::debug!(%view, message_name, "message for unknown view");
            return;
        };

        let mut handled = false;
        for component in target
            .components
            .iter_mut()
            .filter(|c| c.state() == ComponentState::Started && c.handles_message(type_id))
        {
            handled = true;
            let mut ctx = HandlerContext {
                source: Some(source),
                source_peer_id,
                view,
                local_peer_id,
                request_id: kind.request_id(),
                outbox: &mut self.outbox,
            };
            let label = format!("{}::{message_name}", component.name());
            run_guarded(&label, view, || {
                component.invoke_message(type_id, body, &mut ctx).unwrap_or(Ok(()))
            });
        }
        if !handled {
            tracing::debug!(%view, message_name, "no component handles message");
        }
    }

    fn dispatch_response(&mut self, source: NodeKey, type_id: u16, request_id: u16, body: &[u8]) {
        let pending = on_node!(self, source, node => node.take_pending(request_id)).flatten();
        let Some(pending) = pending else {
            tracing::warn!(%source, request_id, "response without a pending request");
            return;
        };

        let name = self.registry.name(type_id).unwrap_or("response");
        let mut ctx = HandlerContext {
            source: Some(source),
            source_peer_id: self.source_peer_id(source),
            view: pending.view,
            local_peer_id: self.peer_id,
            request_id: None,
            outbox: &mut self.outbox,
        };
        let callback = pending.callback;
        run_guarded(&name, pending.view, || callback(&mut ctx, body));
    }

    /// Next session id below `own` not held by a connected peer.
    fn next_peer_id(&mut self, own: NetworkId) -> Option<NetworkId> {
        for _ in 0..u16::MAX {
            self.last_given_peer_id = self.last_given_peer_id.checked_add(1).unwrap_or(1);
            let candidate = assign_peer_id(own, self.last_given_peer_id);
            if self.find_peer(candidate).is_none() {
                return Some(candidate);
            }
        }
        None
    }

    fn handle_builtin(&mut self, source: NodeKey, type_id: u16, body: &[u8]) {
        match (source, type_id) {
            (NodeKey::Peer(handle), RequestPeerId::TYPE_ID) => {
                let Some(own) = self.peer_id else {
                    tracing::warn!(%handle, "cannot assign a peer id before having one");
                    return;
                };
                match self.next_peer_id(own) {
                    Some(peer_id) => self.authorize_peer(handle, peer_id),
                    None => tracing::warn!(%handle, "no free peer id left"),
                }
            }
            (NodeKey::Peer(handle), RegisterPeerId::TYPE_ID) => {
                match decode_body::<RegisterPeerId>(RegisterPeerId::NAME, body) {
                    Ok(message) => self.authorize_peer(handle, message.peer_id),
                    Err(e) => tracing::warn!(%handle, "bad peer id registration: {e}"),
                }
            }
            (NodeKey::Server, ResponsePeerId::TYPE_ID) => {
                match decode_body::<ResponsePeerId>(ResponsePeerId::NAME, body) {
                    Ok(message) => {
                        tracing::info!(peer_id = %message.peer_id, "authorized by server");
                        self.peer_id = Some(message.peer_id);
                        self.events
                            .push_back(MultiplayerEvent::AuthorizedFromServer(message.peer_id));
                    }
                    Err(e) => tracing::warn!("bad peer id response: {e}"),
                }
            }
            _ => tracing::warn!(%source, "unexpected built-in message {type_id:#06x}"),
        }
    }

    fn authorize_peer(&mut self, handle: PeerHandle, peer_id: NetworkId) {
        let Some(peer) = self.peers.get_mut(&handle) else {
            return;
        };
        peer.peer_id = Some(peer_id);
        tracing::info!(%handle, %peer_id, "assigned peer id");

        let reply = ResponsePeerId { peer_id };
        if let Err(e) = self.send_message_to(NodeKey::Peer(handle), NetworkId::ROOT, &reply) {
            tracing::warn!(%handle, "failed to send peer id: {e}");
        }
        self.events
            .push_back(MultiplayerEvent::PeerAuthorized { peer: handle, peer_id });
    }

    fn send_snapshots(&mut self) {
        let mut writer = DataWriter::new();
        for index in 0..self.synchronizable.len() {
            let id = self.synchronizable[index];
            let mine = self.is_mine(id);
            let Some(view) = self.views.get_mut(&id) else {
                continue;
            };
            let Some(handler) = view.synchronize.as_mut() else {
                continue;
            };
            writer.clear();
            handler.serialize(&mut writer);

            match self.default_session {
                Some(SessionKind::Server) => {
                    let targets: Vec<PeerHandle> = match view.synchronization_peers() {
                        Some(group) => group.to_vec(),
                        None => self.peers.keys().copied().collect(),
                    };
                    for handle in targets {
                        let Some(peer) = self.peers.get_mut(&handle) else {
                            continue;
                        };
                        let Some(peer_id) = peer.peer_id else {
                            continue;
                        };
                        if (mine || !id.is_owned_by(peer_id))
                            && let Err(e) = peer.node.add_synchronize_event(id, writer.as_slice())
                        {
                            tracing::warn!(view = %id, %handle, "failed to queue snapshot: {e}");
                        }
                    }
                }
                Some(SessionKind::Client) => {
                    if mine
                        && let Some(parent) = self.parent.as_mut()
                        && let Err(e) = parent.add_synchronize_event(id, writer.as_slice())
                    {
                        tracing::warn!(view = %id, "failed to queue snapshot: {e}");
                    }
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
