//! Client session: connects to a server on its own I/O thread.
//!
//! [`ClientSession::connect`] returns immediately. Events queued before the
//! connection is established wait in the outbound channel and are written as
//! soon as the socket is up.

use std::net::SocketAddr;
use std::thread::JoinHandle;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::connection::{
    Connection, ConnectionIo, NetworkNode, SessionError, TransportConfig, connection_pair,
    spawn_io_thread, wait_closing,
};
use crate::events::{EventError, EventHandler};
use crate::message::MessagePool;
use crate::socket::{SocketConfig, configure_stream};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, ready for communication.
    Connected,
    /// Connection failed, lost or intentionally closed.
    Disconnected,
}

/// Callbacks invoked from [`ClientSession::handle_connection_events`].
pub trait ClientSessionHandler {
    fn on_connected_to_server(&mut self);
    fn on_disconnected_from_server(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientEvent {
    Connected,
    Disconnected,
}

/// Outgoing connection with its own I/O thread.
pub struct ClientSession {
    server_addr: SocketAddr,
    connection: Connection,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    thread: Option<JoinHandle<()>>,
}

impl ClientSession {
    /// Start connecting to `addr`. The outcome is reported through
    /// [`handle_connection_events`](Self::handle_connection_events).
    pub fn connect(addr: SocketAddr, config: &TransportConfig) -> Result<Self, SessionError> {
        let (connection, io) = connection_pair(config, MessagePool::new(config.pool_size));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let thread = spawn_io_thread(
            "tessera-net-io",
            run_client(addr, config.socket.clone(), io, state_tx, events_tx),
        )?;

        Ok(Self {
            server_addr: addr,
            connection,
            events: events_rx,
            state: state_rx,
            thread: Some(thread),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Deliver queued connect/disconnect notifications. Never blocks.
    pub fn handle_connection_events(&mut self, handler: &mut (impl ClientSessionHandler + ?Sized)) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ClientEvent::Connected => handler.on_connected_to_server(),
                ClientEvent::Disconnected => handler.on_disconnected_from_server(),
            }
        }
    }
}

impl NetworkNode for ClientSession {
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
        self.state() == ConnectionState::Connected && self.connection.is_connected()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.connection.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("client I/O thread panicked");
        }
    }
}

async fn run_client(
    addr: SocketAddr,
    socket: SocketConfig,
    io: ConnectionIo,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut closing = io.closing();
    let stream = tokio::select! {
        result = TcpStream::connect(addr) => result,
        _ = wait_closing(&mut closing) => {
            let _ = state.send(ConnectionState::Disconnected);
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("failed to connect to {addr}: {e}");
            let _ = state.send(ConnectionState::Disconnected);
            let _ = events.send(ClientEvent::Disconnected);
            return;
        }
    };
    if let Err(e) = configure_stream(&stream, &socket) {
        tracing::warn!("failed to configure socket for {addr}: {e}");
    }

    tracing::info!("Connected to {addr}");
    let _ = state.send(ConnectionState::Connected);
    let _ = events.send(ClientEvent::Connected);

    match io.run(stream).await {
        Ok(()) => tracing::info!("Disconnected from {addr}"),
        Err(e) => tracing::info!("Disconnected from {addr}: {e}"),
    }
    let _ = state.send(ConnectionState::Disconnected);
    let _ = events.send(ClientEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        connected: usize,
        disconnected: usize,
    }

    impl ClientSessionHandler for Recorder {
        fn on_connected_to_server(&mut self) {
            self.connected += 1;
        }

        fn on_disconnected_from_server(&mut self) {
            self.disconnected += 1;
        }
    }

    async fn poll_until(
        client: &mut ClientSession,
        recorder: &mut Recorder,
        done: impl Fn(&Recorder) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            client.handle_connection_events(recorder);
            if done(recorder) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached before deadline");
    }

    #[tokio::test]
    async fn test_connect_starts_in_connecting_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ClientSession::connect(addr, &TransportConfig::default()).unwrap();
        assert_ne!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.server_addr(), addr);
    }

    #[tokio::test]
    async fn test_connected_then_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = ClientSession::connect(addr, &TransportConfig::default()).unwrap();
        let mut recorder = Recorder::default();

        let (server_side, _) = listener.accept().await.unwrap();
        poll_until(&mut client, &mut recorder, |r| r.connected == 1).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.is_connected());

        drop(server_side);
        poll_until(&mut client, &mut recorder, |r| r.disconnected == 1).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_disconnect() {
        // Grab a free port, then release it so nothing listens there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = ClientSession::connect(addr, &TransportConfig::default()).unwrap();
        let mut recorder = Recorder::default();
        poll_until(&mut client, &mut recorder, |r| r.disconnected == 1).await;
        assert_eq!(recorder.connected, 0);
    }

    #[tokio::test]
    async fn test_events_queued_before_connect_are_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = ClientSession::connect(addr, &TransportConfig::default()).unwrap();
        client.add_reliable_event(b"hello").unwrap();
        client.flush_message();

        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut frame = [0u8; 10];
        server_side.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [8, 0, 0, 5, 0, b'h', b'e', b'l', b'l', b'o']);

        server_side
            .write_all(&[5, 0, 0, 2, 0, b'o', b'k'])
            .await
            .unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.is_empty() && Instant::now() < deadline {
            client.process_event(&mut |event: &[u8]| received.push(event.to_vec()));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received, vec![b"ok".to_vec()]);
    }
}
