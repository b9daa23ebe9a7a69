//! One framed connection split between the user thread and the I/O thread.
//!
//! The user side ([`Connection`]) owns the event writer/reader and talks to
//! the I/O side through two bounded channels: frames read from the socket
//! arrive on the inbound channel, packed frames leave on the outbound one.
//! The user side only ever calls `try_recv`/`try_send`, so it never blocks.
//! A `watch` flag carries the closing signal to the I/O task.

use std::collections::VecDeque;
use std::future::Future;
use std::thread::JoinHandle;

use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};

use crate::events::{EventError, EventHandler, EventReader, EventWriter};
use crate::framing::{FrameError, read_frame, write_frame};
use crate::message::{DEFAULT_POOL_SIZE, MessagePool, PooledMessage};
use crate::socket::SocketConfig;

/// Queue sizing and socket options for a session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Frames buffered from the I/O thread to the user thread per connection.
    pub inbound_capacity: usize,
    /// Frames buffered from the user thread to the I/O thread per connection.
    pub outbound_capacity: usize,
    /// Frames held back while the outbound channel is full. A connection
    /// whose backlog grows past this is closed.
    pub max_backlog: usize,
    /// Connections accepted concurrently by a server session.
    pub max_connections: usize,
    /// Buffers preallocated by the session's message pool.
    pub pool_size: usize,
    /// Options applied to every socket.
    pub socket: SocketConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 1024,
            outbound_capacity: 1024,
            max_backlog: 1024,
            max_connections: 256,
            pool_size: DEFAULT_POOL_SIZE,
            socket: SocketConfig::default(),
        }
    }
}

/// Errors raised when a session cannot be started.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: std::net::SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Runtime or thread creation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the user thread performs on one endpoint.
pub trait NetworkNode {
    /// Consume one received frame, dispatching its events to `handler`.
    /// Returns `false` when nothing was queued.
    fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool;

    /// Queue an event on the ordered stream.
    fn add_reliable_event(&mut self, event: &[u8]) -> Result<(), EventError>;

    /// Queue an event that tolerates loss. Shares the ordered stream.
    fn add_unreliable_event(&mut self, event: &[u8]) -> Result<(), EventError>;

    /// Close the frame being packed and hand pending frames to the I/O thread.
    fn flush_message(&mut self);

    /// Start closing; pending outbound events are discarded.
    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

impl<T: NetworkNode + ?Sized> NetworkNode for Box<T> {
    fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool {
        (**self).process_event(handler)
    }

    fn add_reliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        (**self).add_reliable_event(event)
    }

    fn add_unreliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        (**self).add_unreliable_event(event)
    }

    fn flush_message(&mut self) {
        (**self).flush_message()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// User-thread half of a connection.
pub struct Connection {
    inbound: mpsc::Receiver<PooledMessage>,
    outbound: mpsc::Sender<PooledMessage>,
    backlog: VecDeque<PooledMessage>,
    max_backlog: usize,
    writer: EventWriter,
    reader: EventReader,
    closing: watch::Sender<bool>,
    closed: bool,
}

/// I/O-thread half of a connection.
pub(crate) struct ConnectionIo {
    inbound: mpsc::Sender<PooledMessage>,
    outbound: mpsc::Receiver<PooledMessage>,
    closing: watch::Receiver<bool>,
    pool: MessagePool,
}

/// Create both halves of a connection sharing `pool`.
pub(crate) fn connection_pair(config: &TransportConfig, pool: MessagePool) -> (Connection, ConnectionIo) {
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
    let (closing_tx, closing_rx) = watch::channel(false);

    let connection = Connection {
        inbound: inbound_rx,
        outbound: outbound_tx,
        backlog: VecDeque::new(),
        max_backlog: config.max_backlog,
        writer: EventWriter::new(pool.clone()),
        reader: EventReader::new(),
        closing: closing_tx,
        closed: false,
    };
    let io = ConnectionIo {
        inbound: inbound_tx,
        outbound: outbound_rx,
        closing: closing_rx,
        pool,
    };
    (connection, io)
}

impl Connection {
    /// Move completed frames towards the I/O thread without blocking.
    fn pump(&mut self) {
        self.backlog.extend(self.writer.take_finished());

        while let Some(frame) = self.backlog.pop_front() {
            match self.outbound.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    self.backlog.push_front(frame);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    break;
                }
            }
        }

        if self.backlog.len() > self.max_backlog {
            tracing::warn!(
                backlog = self.backlog.len(),
                limit = self.max_backlog,
                "closing stalled connection"
            );
            self.close();
        }
    }

    /// Frames waiting for room in the outbound channel.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn add_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        if self.closed {
            return Ok(());
        }
        self.writer.add_event(event)?;
        if self.writer.has_finished() {
            self.pump();
        }
        Ok(())
    }
}

impl NetworkNode for Connection {
    fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool {
        if self.closed {
            return false;
        }

        match self.inbound.try_recv() {
            Ok(mut frame) => {
                if let Err(e) = self.reader.read_frame(&mut frame, handler) {
                    tracing::warn!("closing connection after bad frame: {e}");
                    self.close();
                }
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    fn add_reliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.add_event(event)
    }

    fn add_unreliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.add_event(event)
    }

    fn flush_message(&mut self) {
        if self.closed {
            return;
        }
        self.writer.flush();
        self.pump();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.writer.discard();
        self.backlog.clear();
        let _ = self.closing.send(true);
    }

    fn is_connected(&self) -> bool {
        !self.closed && !self.outbound.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl ConnectionIo {
    /// A receiver that resolves once the user side starts closing.
    pub(crate) fn closing(&self) -> watch::Receiver<bool> {
        self.closing.clone()
    }

    /// Pump frames between `stream` and the channels until either side stops.
    pub(crate) async fn run(self, stream: TcpStream) -> Result<(), FrameError> {
        let Self {
            inbound,
            mut outbound,
            mut closing,
            pool,
        } = self;
        let (mut read_half, mut write_half) = stream.into_split();

        let read_loop = async {
            loop {
                let frame = read_frame(&mut read_half, &pool).await?;
                if inbound.send(frame).await.is_err() {
                    return Ok::<(), FrameError>(());
                }
            }
        };

        let write_loop = async {
            while let Some(mut frame) = outbound.recv().await {
                write_frame(&mut write_half, &mut frame).await?;
            }
            Ok::<(), FrameError>(())
        };

        tokio::select! {
            result = read_loop => result,
            result = write_loop => result,
            _ = wait_closing(&mut closing) => Ok(()),
        }
    }
}

/// Resolve when the closing flag is set or its sender is gone.
pub(crate) async fn wait_closing(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

/// Run `future` to completion on a named thread with its own runtime.
///
/// The runtime is built on the calling thread so failures are reported to
/// the caller.
pub(crate) fn spawn_io_thread<F>(name: &str, future: F) -> Result<JoinHandle<()>, SessionError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || runtime.block_on(future))?;
    Ok(handle)
}
