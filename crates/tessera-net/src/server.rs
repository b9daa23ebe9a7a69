//! Server session: accepts connections on the I/O thread and hands each one
//! to the user thread as a [`ServerSideClientSession`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::connection::{
    Connection, NetworkNode, SessionError, TransportConfig, connection_pair, spawn_io_thread,
    wait_closing,
};
use crate::events::{EventError, EventHandler};
use crate::message::MessagePool;
use crate::socket::{bind_listener, configure_stream};

/// Unique identifier for a connection within a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the accept loop is currently waiting for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
    NotListening,
    Listening,
}

/// Callbacks invoked from [`ServerSession::handle_connection_events`].
pub trait ServerSessionHandler {
    /// A connection was accepted. The handler takes ownership of it.
    fn on_client_connect(&mut self, client: ServerSideClientSession);

    /// A previously reported connection ended.
    fn on_client_disconnect(&mut self, id: ConnectionId);
}

enum ServerEvent {
    Connected(ServerSideClientSession),
    Disconnected(ConnectionId),
}

/// One accepted connection, owned by the user thread.
pub struct ServerSideClientSession {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connection: Connection,
}

impl ServerSideClientSession {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl fmt::Debug for ServerSideClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSideClientSession")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl NetworkNode for ServerSideClientSession {
    fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool {
        self.connection.process_event(handler)
    }

    fn add_reliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.connection.add_reliable_event(event)
    }

    fn add_unreliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.connection.add_unreliable_event(event)
    }

    fn flush_message(&mut self) {
        self.connection.flush_message()
    }

    fn close(&mut self) {
        self.connection.close()
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

/// Listening endpoint with its own I/O thread.
pub struct ServerSession {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    accept_state: watch::Receiver<AcceptState>,
    active: Arc<AtomicUsize>,
    closing: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

struct AcceptLoop {
    config: TransportConfig,
    pool: MessagePool,
    ids: IdGenerator,
    active: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<ServerEvent>,
    state: watch::Sender<AcceptState>,
    closing: watch::Receiver<bool>,
}

impl ServerSession {
    /// Bind `addr` and start accepting connections.
    pub fn listen(addr: SocketAddr, config: &TransportConfig) -> Result<Self, SessionError> {
        let std_listener = bind_listener(addr, &config.socket)
            .map_err(|source| SessionError::Bind { addr, source })?;
        let local_addr = std_listener.local_addr()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AcceptState::NotListening);
        let (closing_tx, closing_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let accept_loop = AcceptLoop {
            config: config.clone(),
            pool: MessagePool::new(config.pool_size),
            ids: IdGenerator::new(),
            active: Arc::clone(&active),
            events: events_tx,
            state: state_tx,
            closing: closing_rx,
        };
        let thread = spawn_io_thread("tessera-net-io", accept_loop.run(std_listener))?;

        tracing::info!("Server listening on {local_addr}");

        Ok(Self {
            local_addr,
            events: events_rx,
            accept_state: state_rx,
            active,
            closing: closing_tx,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept_state(&self) -> AcceptState {
        *self.accept_state.borrow()
    }

    /// Connections currently served by the I/O thread.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Deliver queued connect/disconnect notifications. Never blocks.
    pub fn handle_connection_events(&mut self, handler: &mut (impl ServerSessionHandler + ?Sized)) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ServerEvent::Connected(client) => handler.on_client_connect(client),
                ServerEvent::Disconnected(id) => handler.on_client_disconnect(id),
            }
        }
    }

    /// Stop accepting and drop every connection served by this session.
    pub fn close(&mut self) {
        let _ = self.closing.send(true);
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("server I/O thread panicked");
        }
    }
}

impl AcceptLoop {
    async fn run(mut self, std_listener: std::net::TcpListener) {
        let listener = match TcpListener::from_std(std_listener) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("failed to register listener: {e}");
                return;
            }
        };

        let _ = self.state.send(AcceptState::Listening);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
                _ = wait_closing(&mut self.closing) => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        let _ = self.state.send(AcceptState::NotListening);
    }

    fn accept(&mut self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        if self.active.load(Ordering::Relaxed) >= self.config.max_connections {
            tracing::warn!("Connection limit reached, rejecting {peer_addr}");
            return;
        }
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!("failed to configure socket for {peer_addr}: {e}");
        }

        let id = self.ids.next_id();
        let (connection, io) = connection_pair(&self.config, self.pool.clone());
        let client = ServerSideClientSession {
            id,
            peer_addr,
            connection,
        };
        if self.events.send(ServerEvent::Connected(client)).is_err() {
            return;
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Accepted connection {id} from {peer_addr}");

        let active = Arc::clone(&self.active);
        let events = self.events.clone();
        tokio::spawn(async move {
            match io.run(stream).await {
                Ok(()) => tracing::info!("Connection {id} closed"),
                Err(e) => tracing::info!("Connection {id} closed: {e}"),
            }
            active.fetch_sub(1, Ordering::Relaxed);
            let _ = events.send(ServerEvent::Disconnected(id));
        });
    }
}
