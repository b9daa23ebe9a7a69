//! Framed TCP transport: byte codec, pooled message buffers, event packing
//! across frames, and client/server sessions driven by a dedicated I/O
//! thread.

pub mod client;
pub mod codec;
pub mod connection;
pub mod events;
pub mod framing;
pub mod message;
pub mod server;
pub mod socket;

pub use client::{ClientSession, ClientSessionHandler, ConnectionState};
pub use codec::{CodecError, DataReader, DataWriter};
pub use connection::{Connection, NetworkNode, SessionError, TransportConfig};
pub use events::{EVENT_HEADER_SIZE, EventError, EventHandler, EventReader, EventWriter};
pub use framing::{FrameError, read_frame, write_frame};
pub use message::{
    BUFFER_SIZE, DEFAULT_POOL_SIZE, HEADER_SIZE, MAX_PAYLOAD, MessagePool, NetworkMessage,
    PooledMessage,
};
pub use server::{
    AcceptState, ConnectionId, IdGenerator, ServerSession, ServerSessionHandler,
    ServerSideClientSession,
};
pub use socket::SocketConfig;
