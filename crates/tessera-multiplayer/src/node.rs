//! Per-endpoint batching of application events onto a transport.

use rustc_hash::FxHashMap;
use tessera_net::{CodecError, DataWriter, EventError, EventHandler, NetworkNode};

use crate::controller::NodeKey;
use crate::event::{MessageKind, NetworkEvent};
use crate::message::HandlerError;
use crate::network_id::NetworkId;
use crate::rpc::RpcValue;

/// Errors raised while queueing an outgoing event.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Event(#[from] EventError),
    /// A message body could not be encoded.
    #[error(transparent)]
    Encode(#[from] HandlerError),
    /// The target node is not connected to this controller.
    #[error("no node {0}")]
    UnknownNode(NodeKey),
    /// Nothing to route to: no default session has been created.
    #[error("no session to send on")]
    NoSession,
}

/// A request waiting for its response.
pub(crate) struct PendingRequest<C> {
    pub(crate) view: NetworkId,
    pub(crate) callback: C,
}

/// Encodes application events straight into a transport.
///
/// `C` is whatever the owner keeps per outstanding request, typically a
/// response callback.
pub struct MultiplayerNode<N, C = ()> {
    transport: N,
    scratch: DataWriter,
    next_request_id: u16,
    pending: FxHashMap<u16, PendingRequest<C>>,
}

impl<N: NetworkNode, C> MultiplayerNode<N, C> {
    pub fn new(transport: N) -> Self {
        Self {
            transport,
            scratch: DataWriter::with_capacity(256),
            next_request_id: 0,
            pending: FxHashMap::default(),
        }
    }

    pub fn transport(&self) -> &N {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut N {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Consume one inbound transport frame.
    pub fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool {
        self.transport.process_event(handler)
    }

    fn encode(&mut self, event: &NetworkEvent<'_>) -> Result<(), CodecError> {
        self.scratch.clear();
        event.write_to(&mut self.scratch)
    }

    fn send_reliable(&mut self, event: &NetworkEvent<'_>) -> Result<(), SendError> {
        self.encode(event)?;
        self.transport.add_reliable_event(self.scratch.as_slice())?;
        Ok(())
    }

    pub fn add_rpc_event(
        &mut self,
        view: NetworkId,
        method: &str,
        args: &[RpcValue],
    ) -> Result<(), SendError> {
        self.send_reliable(&NetworkEvent::Rpc {
            view,
            method: method.to_owned(),
            args: args.to_vec(),
        })
    }

    pub fn add_entity_message_event(
        &mut self,
        view: NetworkId,
        type_id: u16,
        body: &[u8],
    ) -> Result<(), SendError> {
        self.send_reliable(&NetworkEvent::EntityMessage {
            view,
            type_id,
            kind: MessageKind::Plain,
            body,
        })
    }

    /// Send a request and remember `callback` under a fresh request id.
    pub fn add_request_event(
        &mut self,
        view: NetworkId,
        type_id: u16,
        body: &[u8],
        callback: C,
    ) -> Result<u16, SendError> {
        let request_id = self.next_request_id;
        self.send_reliable(&NetworkEvent::EntityMessage {
            view,
            type_id,
            kind: MessageKind::Request(request_id),
            body,
        })?;

        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self
            .pending
            .insert(request_id, PendingRequest { view, callback })
            .is_some()
        {
            tracing::warn!("request id {request_id} reused while still pending");
        }
        Ok(request_id)
    }

    pub fn respond_entity_message_event(
        &mut self,
        type_id: u16,
        request_id: u16,
        body: &[u8],
    ) -> Result<(), SendError> {
        self.send_reliable(&NetworkEvent::Response {
            type_id,
            request_id,
            body,
        })
    }

    /// Snapshots go through the unreliable entry point.
    pub fn add_synchronize_event(&mut self, view: NetworkId, data: &[u8]) -> Result<(), SendError> {
        self.encode(&NetworkEvent::Synchronize { view, data })?;
        self.transport.add_unreliable_event(self.scratch.as_slice())?;
        Ok(())
    }

    /// Hand everything batched this tick to the transport.
    pub fn finalize_and_send_message(&mut self) {
        self.transport.flush_message();
    }

    pub(crate) fn take_pending(&mut self, request_id: u16) -> Option<PendingRequest<C>> {
        self.pending.remove(&request_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn close(&mut self) {
        self.pending.clear();
        self.transport.close();
    }
}
