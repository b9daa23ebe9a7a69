//! Connection to the parent server as seen by the controller.

use tessera_net::{ClientSession, ClientSessionHandler, EventError, EventHandler, NetworkNode};

/// A transport towards the server that also reports connect/disconnect.
pub trait ServerLink: NetworkNode {
    /// Deliver connection changes since the last call. Never blocks.
    fn handle_link_events(&mut self, handler: &mut dyn ClientSessionHandler);
}

impl ServerLink for ClientSession {
    fn handle_link_events(&mut self, handler: &mut dyn ClientSessionHandler) {
        self.handle_connection_events(handler);
    }
}

/// Wraps a transport that is connected from the start, such as a
/// [`LocalNode`](crate::local::LocalNode).
pub struct ConnectedLink<N> {
    node: N,
    reported_connect: bool,
    reported_disconnect: bool,
}

impl<N: NetworkNode> ConnectedLink<N> {
    pub fn new(node: N) -> Self {
        Self {
            node,
            reported_connect: false,
            reported_disconnect: false,
        }
    }

    pub fn get_ref(&self) -> &N {
        &self.node
    }
}

impl<N: NetworkNode> ServerLink for ConnectedLink<N> {
    fn handle_link_events(&mut self, handler: &mut dyn ClientSessionHandler) {
        if !self.reported_connect {
            self.reported_connect = true;
            handler.on_connected_to_server();
        }
        if !self.reported_disconnect && !self.node.is_connected() {
            self.reported_disconnect = true;
            handler.on_disconnected_from_server();
        }
    }
}

impl<N: NetworkNode> NetworkNode for ConnectedLink<N> {
    fn process_event(&mut self, handler: &mut dyn EventHandler) -> bool {
        self.node.process_event(handler)
    }

    fn add_reliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.node.add_reliable_event(event)
    }

    fn add_unreliable_event(&mut self, event: &[u8]) -> Result<(), EventError> {
        self.node.add_unreliable_event(event)
    }

    fn flush_message(&mut self) {
        self.node.flush_message()
    }

    fn close(&mut self) {
        self.node.close()
    }

    fn is_connected(&self) -> bool {
        self.node.is_connected()
    }
}

impl<T: ServerLink + ?Sized> ServerLink for Box<T> {
    fn handle_link_events(&mut self, handler: &mut dyn ClientSessionHandler) {
        (**self).handle_link_events(handler)
    }
}
