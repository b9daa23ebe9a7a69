//! The dedicated server: a root controller driving one interest-grid scene.

use std::net::SocketAddr;

use glam::Vec2;
use tessera_config::Config;
use tessera_multiplayer::{
    ControllerConfig, MessageRegistry, MultiplayerEvent, NetworkController, NetworkId, PeerHandle,
};
use tessera_net::SessionError;
use tessera_scene::{
    ControllerSink, GameObjectDesc, GameSceneServer, default_scene_view, register_scene_messages,
};

/// Prefab clients instantiate for player avatars.
pub const AVATAR_PREFAB: &str = "Player";

pub struct ServerHost {
    controller: NetworkController,
    scene: GameSceneServer,
    scene_view: NetworkId,
    spawn_point: Vec2,
}

impl ServerHost {
    pub fn new(config: &Config) -> Self {
        let mut registry = MessageRegistry::new();
        register_scene_messages(&mut registry);

        let mut controller = NetworkController::new(ControllerConfig::from(&config.network), registry);
        controller.set_root();
        let scene_view = default_scene_view();
        controller.create_view(scene_view);

        let half_extent = config.scene.grid_size as f32 * config.scene.cell_length * 0.5;
        Self {
            controller,
            scene: GameSceneServer::new(&config.scene, &config.network),
            scene_view,
            spawn_point: Vec2::splat(half_extent),
        }
    }

    pub fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, SessionError> {
        self.controller.listen(addr)
    }

    pub fn controller(&self) -> &NetworkController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut NetworkController {
        &mut self.controller
    }

    pub fn scene(&self) -> &GameSceneServer {
        &self.scene
    }

    pub fn scene_view(&self) -> NetworkId {
        self.scene_view
    }

    /// One frame: read, scene pass when due, write.
    pub fn frame(&mut self) {
        let ticked = self.controller.update_read();
        self.handle_events();

        if ticked && self.scene.should_synchronize() {
            let mut sink = ControllerSink::new(&mut self.controller, self.scene_view);
            self.scene.synchronize(&mut sink);
        }

        self.controller.update_write();
    }

    fn handle_events(&mut self) {
        while let Some(event) = self.controller.poll_event() {
            match event {
                MultiplayerEvent::PeerAuthorized { peer, peer_id } => self.enter_peer(peer, peer_id),
                MultiplayerEvent::PeerDisconnected { peer, .. } => {
                    let mut sink = ControllerSink::new(&mut self.controller, self.scene_view);
                    self.scene.remove_peer(peer, &mut sink);
                }
                MultiplayerEvent::PeerConnected(peer) => tracing::info!(%peer, "peer connected"),
                other => tracing::debug!(?other, "ignored event"),
            }
        }
    }

    fn enter_peer(&mut self, peer: PeerHandle, peer_id: NetworkId) {
        // A known peer re-registering keeps its scene state.
        if self.scene.peer(peer).is_some() {
            return;
        }
        let Some(id) = self.controller.generate_network_id(peer_id) else {
            tracing::warn!(%peer, %peer_id, "no id left for an avatar");
            return;
        };
        let avatar = self.scene.spawn_object(GameObjectDesc::new(
            AVATAR_PREFAB,
            format!("Player {peer_id}"),
            id,
            self.spawn_point,
        ));
        self.scene.enter_peer(peer);
        self.scene.set_avatar(peer, Some(avatar));
        tracing::info!(%peer, %peer_id, avatar = %id, "peer entered the scene");
    }
}
