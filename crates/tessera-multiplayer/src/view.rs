//! Network views: the addressable unit RPCs, messages and snapshots target.

use rustc_hash::FxHashSet;
use tessera_net::{DataReader, DataWriter};

use crate::component::Component;
use crate::controller::PeerHandle;
use crate::message::HandlerError;
use crate::network_id::NetworkId;

/// Produces and applies periodic state snapshots for a view.
pub trait SynchronizeHandler {
    /// Write the current state.
    fn serialize(&mut self, writer: &mut DataWriter);

    /// Apply a snapshot produced by the remote `serialize`.
    fn deserialize(&mut self, reader: &mut DataReader<'_>) -> Result<(), HandlerError>;
}

/// A network-addressable object: an id, its child views, and the
/// components that answer RPCs and messages sent to it.
pub struct NetworkView {
    id: NetworkId,
    children: FxHashSet<NetworkId>,
    pub(crate) components: Vec<Component>,
    pub(crate) synchronize: Option<Box<dyn SynchronizeHandler>>,
    synchronization_peers: Option<Vec<PeerHandle>>,
}

impl NetworkView {
    pub(crate) fn new(id: NetworkId) -> Self {
        Self {
            id,
            children: FxHashSet::default(),
            components: Vec::new(),
            synchronize: None,
            synchronization_peers: None,
        }
    }

    pub fn id(&self) -> NetworkId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: NetworkId) {
        self.id = id;
    }

    pub fn children(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.children.iter().copied()
    }

    pub(crate) fn children_mut(&mut self) -> &mut FxHashSet<NetworkId> {
        &mut self.children
    }

    /// Attach a component. It is initialised and started on the next read
    /// tick.
    pub fn add_component(&mut self, component: impl Into<Component>) -> &mut Self {
        let component = component.into();
        debug_assert!(
            self.component(component.name()).is_none(),
            "view {} already has component {}",
            self.id,
            component.name()
        );
        self.components.push(component);
        self
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name() == name)
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.name() == name)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn is_synchronizable(&self) -> bool {
        self.synchronize.is_some()
    }

    /// Peers that receive this view's snapshots; `None` means every peer.
    pub fn synchronization_peers(&self) -> Option<&[PeerHandle]> {
        self.synchronization_peers.as_deref()
    }

    pub(crate) fn set_synchronization_peers(&mut self, peers: Option<Vec<PeerHandle>>) {
        self.synchronization_peers = peers;
    }
}

impl std::fmt::Debug for NetworkView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkView")
            .field("id", &self.id)
            .field("children", &self.children.len())
            .field(
                "components",
                &self.components.iter().map(Component::name).collect::<Vec<_>>(),
            )
            .field("synchronizable", &self.is_synchronizable())
            .finish()
    }
}
