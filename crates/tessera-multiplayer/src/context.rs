//! What a handler sees while it runs, and the commands it can queue.
//!
//! Handlers never touch the controller directly. Anything they want sent
//! goes into an outbox that the controller applies once the handler returns.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::controller::NodeKey;
use crate::message::{EntityMessage, HandlerError, ResponseData, decode_body, encode_body};
use crate::network_id::NetworkId;
use crate::rpc::RpcValue;

/// Invoked with the raw response body when a response arrives.
pub(crate) type ResponseCallback =
    Box<dyn FnOnce(&mut HandlerContext<'_>, &[u8]) -> Result<(), HandlerError>>;

/// Where an outgoing event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The default session: every peer on a server, the server on a client.
    Default,
    Node(NodeKey),
}

pub(crate) enum Command {
    Rpc {
        route: Route,
        view: NetworkId,
        method: String,
        args: Vec<RpcValue>,
    },
    Message {
        route: Route,
        view: NetworkId,
        type_id: u16,
        body: Vec<u8>,
    },
    Request {
        node: NodeKey,
        view: NetworkId,
        type_id: u16,
        body: Vec<u8>,
        callback: ResponseCallback,
    },
    Respond {
        node: NodeKey,
        type_id: u16,
        request_id: u16,
        body: Vec<u8>,
    },
    DestroyView(NetworkId),
}

/// Context passed to every handler.
pub struct HandlerContext<'a> {
    pub(crate) source: Option<NodeKey>,
    pub(crate) source_peer_id: Option<NetworkId>,
    pub(crate) view: NetworkId,
    pub(crate) local_peer_id: Option<NetworkId>,
    pub(crate) request_id: Option<u16>,
    pub(crate) outbox: &'a mut Vec<Command>,
}

impl<'a> HandlerContext<'a> {
    /// Node the event came from. `None` for lifecycle hooks.
    pub fn source(&self) -> Option<NodeKey> {
        self.source
    }

    /// Peer id of the sender when it is an authorised peer.
    pub fn source_peer_id(&self) -> Option<NetworkId> {
        self.source_peer_id
    }

    /// View the handler is attached to.
    pub fn view(&self) -> NetworkId {
        self.view
    }

    /// This process's own peer id.
    pub fn local_peer_id(&self) -> Option<NetworkId> {
        self.local_peer_id
    }

    /// Request id when handling a request message.
    pub fn request_id(&self) -> Option<u16> {
        self.request_id
    }

    pub fn rpc(&mut self, view: NetworkId, method: &str, args: Vec<RpcValue>) {
        self.outbox.push(Command::Rpc {
            route: Route::Default,
            view,
            method: method.to_owned(),
            args,
        });
    }

    pub fn rpc_to(&mut self, node: NodeKey, view: NetworkId, method: &str, args: Vec<RpcValue>) {
        self.outbox.push(Command::Rpc {
            route: Route::Node(node),
            view,
            method: method.to_owned(),
            args,
        });
    }

    pub fn send_message<M: EntityMessage>(
        &mut self,
        view: NetworkId,
        message: &M,
    ) -> Result<(), HandlerError> {
        self.push_message(Route::Default, view, message)
    }

    pub fn send_message_to<M: EntityMessage>(
        &mut self,
        node: NodeKey,
        view: NetworkId,
        message: &M,
    ) -> Result<(), HandlerError> {
        self.push_message(Route::Node(node), view, message)
    }

    fn push_message<M: EntityMessage>(
        &mut self,
        route: Route,
        view: NetworkId,
        message: &M,
    ) -> Result<(), HandlerError> {
        let body = encode_body(M::NAME, message)?;
        self.outbox.push(Command::Message {
            route,
            view,
            type_id: M::TYPE_ID,
            body,
        });
        Ok(())
    }

    /// Send a request to `node`; `on_response` runs when the reply arrives.
    pub fn request<M, R, F>(
        &mut self,
        node: NodeKey,
        view: NetworkId,
        message: &M,
        on_response: F,
    ) -> Result<(), HandlerError>
    where
        M: EntityMessage,
        R: ResponseData,
        F: FnOnce(&mut HandlerContext<'_>, R) -> Result<(), HandlerError> + 'static,
    {
        let body = encode_body(M::NAME, message)?;
        self.outbox.push(Command::Request {
            node,
            view,
            type_id: M::TYPE_ID,
            body,
            callback: response_callback(on_response),
        });
        Ok(())
    }

    /// Reply to the request currently being handled.
    pub fn respond<R: ResponseData>(&mut self, response: &R) -> Result<(), HandlerError> {
        let (Some(node), Some(request_id)) = (self.source, self.request_id) else {
            return Err(HandlerError::NotARequest);
        };
        let body = encode_body(R::NAME, response)?;
        self.outbox.push(Command::Respond {
            node,
            type_id: R::TYPE_ID,
            request_id,
            body,
        });
        Ok(())
    }

    /// Destroy a view once the current handler returns.
    pub fn destroy_view(&mut self, view: NetworkId) {
        self.outbox.push(Command::DestroyView(view));
    }
}

pub(crate) fn response_callback<R, F>(on_response: F) -> ResponseCallback
where
    R: ResponseData,
    F: FnOnce(&mut HandlerContext<'_>, R) -> Result<(), HandlerError> + 'static,
{
    Box::new(move |ctx, body| {
        let response = decode_body::<R>(R::NAME, body)?;
        on_response(ctx, response)
    })
}

/// Run a handler, logging and suppressing errors and panics.
pub(crate) fn run_guarded<F>(handler: &dyn fmt::Display, view: NetworkId, f: F)
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(%handler, %view, "handler failed: {e}"),
        Err(payload) => {
            tracing::error!(%handler, %view, "handler panicked: {}", panic_message(&*payload))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
