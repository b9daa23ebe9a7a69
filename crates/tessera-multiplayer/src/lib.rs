//! Object synchronization on top of the framed transport: hierarchical
//! network ids, views with components, RPCs, entity messages with
//! request/response, periodic snapshots, and the controller that owns it all.

pub mod component;
pub mod context;
pub mod controller;
pub mod event;
pub mod link;
pub mod local;
pub mod message;
pub mod network_id;
pub mod node;
pub mod peer_id;
pub mod rpc;
pub mod view;

pub use component::{Component, ComponentBuilder, ComponentState};
pub use context::{HandlerContext, Route};
pub use controller::{ControllerConfig, MultiplayerEvent, NetworkController, NodeKey, PeerHandle};
pub use event::{EventKind, MessageKind, NetworkEvent};
pub use link::{ConnectedLink, ServerLink};
pub use local::LocalNode;
pub use message::{EntityMessage, HandlerError, MessageRegistry, RESERVED_TYPE_IDS, ResponseData};
pub use network_id::{IdKind, InvalidNetworkId, MAX_LEVEL, NetworkId};
pub use node::{MultiplayerNode, SendError};
pub use peer_id::{DESTROY_VIEW_RPC, RegisterPeerId, RequestPeerId, ResponsePeerId, assign_peer_id};
pub use rpc::{RpcType, RpcValue};
pub use view::{NetworkView, SynchronizeHandler};
