use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_config::NetworkConfig;

use super::*;
use crate::component::Component;
use crate::local::LocalNode;
use crate::rpc::RpcType;

#[derive(Debug, Serialize, Deserialize)]
struct Ping(u32);

impl EntityMessage for Ping {
    const TYPE_ID: u16 = 10;
    const NAME: &'static str = "Ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong(u32);

impl ResponseData for Pong {
    const TYPE_ID: u16 = 11;
    const NAME: &'static str = "Pong";
}

#[derive(Debug, Serialize, Deserialize)]
struct Unlisted;

impl EntityMessage for Unlisted {
    const TYPE_ID: u16 = 50;
    const NAME: &'static str = "Unlisted";
}

struct Counter(Rc<Cell<i32>>);

impl SynchronizeHandler for Counter {
    fn serialize(&mut self, writer: &mut DataWriter) {
        writer.write_i32(self.0.get());
    }

    fn deserialize(&mut self, reader: &mut DataReader<'_>) -> Result<(), HandlerError> {
        self.0.set(reader.read_i32()?);
        Ok(())
    }
}

fn frame_config() -> ControllerConfig {
    ControllerConfig {
        update_check: UpdateCheckType::Frame,
        update_period: 1,
        ..ControllerConfig::default()
    }
}

fn registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    registry.register::<Ping>().register_response::<Pong>();
    registry
}

fn root_server() -> NetworkController {
    let mut server = NetworkController::new(frame_config(), registry());
    server.set_root();
    server
}

fn join(server: &mut NetworkController) -> (NetworkController, PeerHandle) {
    let (server_end, client_end) = LocalNode::pair();
    let peer = server.attach_peer(server_end);
    let mut client = NetworkController::new(frame_config(), registry());
    client.connect_local(client_end);
    (client, peer)
}

/// Run `rounds` frames on every controller, reads before writes.
fn pump(controllers: &mut [&mut NetworkController], rounds: usize) {
    for _ in 0..rounds {
        for controller in controllers.iter_mut() {
            controller.update_read();
        }
        for controller in controllers.iter_mut() {
            controller.update_write();
        }
    }
}

fn drain_events(controller: &mut NetworkController) -> Vec<MultiplayerEvent> {
    std::iter::from_fn(|| controller.poll_event()).collect()
}

fn counter_component(name: &str) -> Component {
    Component::with_state(name, 0i32)
        .with_rpc("Add", &[RpcType::I32], |total, _ctx, args| {
            *total += args[0].as_i32().unwrap_or_default();
            Ok(())
        })
        .build()
}

/// A root server with one authorized client.
fn connected() -> (NetworkController, NetworkController, PeerHandle) {
    let mut server = root_server();
    let (mut client, peer) = join(&mut server);
    pump(&mut [&mut client, &mut server], 3);
    (server, client, peer)
}

#[test]
fn test_handshake_assigns_session_ids() {
    let (mut server, mut client, peer) = connected();
    let expected = assign_peer_id(NetworkId::ROOT, 1);

    assert_eq!(client.peer_id(), Some(expected));
    assert_eq!(server.peer_id_of(peer), Some(expected));
    assert_eq!(server.find_peer(expected), Some(peer));

    assert_eq!(
        drain_events(&mut server),
        [
            MultiplayerEvent::PeerConnected(peer),
            MultiplayerEvent::PeerAuthorized {
                peer,
                peer_id: expected
            },
        ]
    );
    assert_eq!(
        drain_events(&mut client),
        [
            MultiplayerEvent::ConnectedToServer,
            MultiplayerEvent::AuthorizedFromServer(expected),
        ]
    );
}

#[test]
fn test_each_client_gets_a_distinct_id() {
    let mut server = root_server();
    let (mut first, _) = join(&mut server);
    let (mut second, _) = join(&mut server);
    pump(&mut [&mut first, &mut second, &mut server], 3);

    assert_eq!(first.peer_id(), Some(assign_peer_id(NetworkId::ROOT, 1)));
    assert_eq!(second.peer_id(), Some(assign_peer_id(NetworkId::ROOT, 2)));
}

#[test]
fn test_known_id_is_registered_again() {
    let mut server = root_server();
    let (server_end, client_end) = LocalNode::pair();
    let peer = server.attach_peer(server_end);

    let remembered = assign_peer_id(NetworkId::ROOT, 7);
    let mut client = NetworkController::new(frame_config(), registry());
    client.peer_id = Some(remembered);
    client.connect_local(client_end);
    pump(&mut [&mut client, &mut server], 3);

    assert_eq!(server.peer_id_of(peer), Some(remembered));
    assert_eq!(client.peer_id(), Some(remembered));
}

#[test]
fn test_rpc_reaches_started_component() {
    let (mut server, mut client, _) = connected();
    let door = server.spawn_view(NetworkId::ROOT).unwrap();
    client.create_view(door).add_component(counter_component("door"));
    pump(&mut [&mut client, &mut server], 1);

    server.rpc(door, "Add", &[RpcValue::from(3i32)]).unwrap();
    server.rpc(door, "Add", &[RpcValue::from(4i32)]).unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert_eq!(client.component_state::<i32>(door, "door"), Some(&7));
}

#[test]
fn test_rpc_with_wrong_signature_is_ignored() {
    let (mut server, mut client, _) = connected();
    let door = server.spawn_view(NetworkId::ROOT).unwrap();
    client.create_view(door).add_component(counter_component("door"));
    pump(&mut [&mut client, &mut server], 1);

    server.rpc(door, "Add", &[RpcValue::from("three")]).unwrap();
    server.rpc(door, "Missing", &[]).unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert_eq!(client.component_state::<i32>(door, "door"), Some(&0));
}

#[test]
fn test_components_start_before_first_dispatch() {
    let (mut server, mut client, _) = connected();
    let door = server.spawn_view(NetworkId::ROOT).unwrap();
    server.rpc(door, "Add", &[RpcValue::from(5i32)]).unwrap();
    server.update_read();
    server.update_write();

    // The view appears in the same frame the event is read.
    client.create_view(door).add_component(counter_component("door"));
    client.update_read();

    assert_eq!(
        client.find_network_view(door).unwrap().component("door").unwrap().state(),
        ComponentState::Started
    );
    assert_eq!(client.component_state::<i32>(door, "door"), Some(&5));
}

#[test]
fn test_message_reaches_every_component() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    let seen = Rc::new(Cell::new(0));
    let target = client.create_view(view);
    for name in ["a", "b"] {
        let seen = seen.clone();
        target.add_component(Component::new(name).with_message::<Ping, _>(move |_, _ctx, ping| {
            seen.set(seen.get() + ping.0);
            Ok(())
        }));
    }
    pump(&mut [&mut client, &mut server], 1);

    server.send_message(view, &Ping(2)).unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert_eq!(seen.get(), 4);
}

#[test]
fn test_unregistered_message_is_dropped() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    let called = Rc::new(Cell::new(false));
    let flag = called.clone();
    client
        .create_view(view)
        .add_component(Component::new("sink").with_message::<Unlisted, _>(move |_, _, _| {
            flag.set(true);
            Ok(())
        }));
    pump(&mut [&mut client, &mut server], 1);

    server.send_message(view, &Unlisted).unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert!(!called.get());
}

#[test]
fn test_request_gets_response() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    server.find_network_view_mut(view).unwrap().add_component(
        Component::new("echo").with_message::<Ping, _>(|_, ctx, ping| ctx.respond(&Pong(ping.0 * 2))),
    );
    client.create_view(view);
    pump(&mut [&mut client, &mut server], 1);

    let answer = Rc::new(Cell::new(0));
    let slot = answer.clone();
    let request_id = client
        .request(view, &Ping(4), move |ctx: &mut HandlerContext<'_>, pong: Pong| {
            assert_eq!(ctx.source(), Some(NodeKey::Server));
            slot.set(pong.0);
            Ok(())
        })
        .unwrap();
    assert_eq!(request_id, 0);
    assert_eq!(client.parent.as_ref().unwrap().pending_requests(), 1);

    pump(&mut [&mut client, &mut server], 3);

    assert_eq!(answer.get(), 8);
    assert_eq!(client.parent.as_ref().unwrap().pending_requests(), 0);
}

#[test]
fn test_response_without_pending_request_is_dropped() {
    let (mut server, mut client, peer) = connected();
    server
        .peers
        .get_mut(&peer)
        .unwrap()
        .node
        .respond_entity_message_event(Pong::TYPE_ID, 999, &[])
        .unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert!(client.is_client());
    assert_eq!(client.parent.as_ref().unwrap().pending_requests(), 0);
}

#[test]
fn test_panicking_handler_does_not_stop_dispatch() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    client.create_view(view).add_component(
        Component::with_state("fragile", 0i32)
            .with_rpc("Boom", &[], |_, _, _| panic!("boom"))
            .with_rpc("Add", &[RpcType::I32], |total, _, args| {
                *total += args[0].as_i32().unwrap_or_default();
                Ok(())
            }),
    );
    pump(&mut [&mut client, &mut server], 1);

    server.rpc(view, "Boom", &[]).unwrap();
    server.rpc(view, "Add", &[RpcValue::from(1i32)]).unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert_eq!(client.component_state::<i32>(view, "fragile"), Some(&1));
}

#[test]
fn test_snapshots_reach_authorized_peers() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    let source = Rc::new(Cell::new(7));
    let mirror = Rc::new(Cell::new(0));
    server.set_synchronize_handler(view, Some(Box::new(Counter(source.clone()))));
    client.create_view(view);
    client.set_synchronize_handler(view, Some(Box::new(Counter(mirror.clone()))));

    pump(&mut [&mut server, &mut client], 2);
    assert_eq!(mirror.get(), 7);

    source.set(9);
    pump(&mut [&mut server, &mut client], 2);
    assert_eq!(mirror.get(), 9);
}

#[test]
fn test_unauthorized_peer_gets_no_snapshots() {
    let mut server = root_server();
    let (server_end, mut client_end) = LocalNode::pair();
    server.attach_peer(server_end);
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    server.set_synchronize_handler(view, Some(Box::new(Counter(Rc::new(Cell::new(1))))));

    server.update_read();
    server.update_write();

    assert!(!client_end.process_event(&mut |_: &[u8]| {}));
}

#[test]
fn test_synchronization_peers_limit_targets() {
    let mut server = root_server();
    let (mut first, first_peer) = join(&mut server);
    let (mut second, _) = join(&mut server);
    pump(&mut [&mut first, &mut second, &mut server], 3);

    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    server.set_synchronize_handler(view, Some(Box::new(Counter(Rc::new(Cell::new(3))))));
    server.set_synchronization_peers(view, Some(vec![first_peer]));

    let seen_first = Rc::new(Cell::new(0));
    let seen_second = Rc::new(Cell::new(0));
    first.create_view(view);
    first.set_synchronize_handler(view, Some(Box::new(Counter(seen_first.clone()))));
    second.create_view(view);
    second.set_synchronize_handler(view, Some(Box::new(Counter(seen_second.clone()))));

    pump(&mut [&mut server, &mut first, &mut second], 2);

    assert_eq!(seen_first.get(), 3);
    assert_eq!(seen_second.get(), 0);
}

#[test]
fn test_client_synchronizes_only_its_own_views() {
    let (mut server, mut client, _) = connected();
    let client_id = client.peer_id().unwrap();

    let server_object = server.spawn_view(NetworkId::ROOT).unwrap();
    let server_value = Rc::new(Cell::new(1));
    server.set_synchronize_handler(server_object, Some(Box::new(Counter(server_value.clone()))));

    let client_object = client.spawn_view(client_id).unwrap();
    let client_value = Rc::new(Cell::new(5));
    client.set_synchronize_handler(client_object, Some(Box::new(Counter(client_value.clone()))));

    let mirrored_server = Rc::new(Cell::new(99));
    client.create_view(server_object);
    client.set_synchronize_handler(server_object, Some(Box::new(Counter(mirrored_server.clone()))));

    let mirrored_client = Rc::new(Cell::new(0));
    server.create_view(client_object);
    server.set_synchronize_handler(client_object, Some(Box::new(Counter(mirrored_client.clone()))));

    pump(&mut [&mut client, &mut server], 3);

    assert_eq!(server_value.get(), 1);
    assert_eq!(mirrored_server.get(), 1);
    assert_eq!(mirrored_client.get(), 5);
    // The server never echoes a view back to its owner.
    assert_eq!(client_value.get(), 5);
}

#[test]
fn test_reparent_readdresses_descendants() {
    let mut controller = root_server();
    let old_parent = controller.spawn_view(NetworkId::ROOT).unwrap();
    let new_parent = controller.spawn_view(NetworkId::ROOT).unwrap();
    let child = controller.spawn_view(old_parent).unwrap();
    let grandchild = controller.spawn_view(child).unwrap();
    controller.set_synchronize_handler(grandchild, Some(Box::new(Counter(Rc::new(Cell::new(0))))));

    let moved = controller.reparent_view(child, new_parent).unwrap();
    let moved_grandchild = grandchild.with_new_parent(moved);

    assert_eq!(moved, child.with_new_parent(new_parent));
    assert!(controller.find_network_view(child).is_none());
    assert!(controller.find_network_view(grandchild).is_none());
    assert_eq!(controller.find_network_view(moved).unwrap().id(), moved);
    assert!(controller.find_network_view(moved_grandchild).is_some());
    assert_eq!(controller.synchronizable, [moved_grandchild]);

    let old_children: Vec<_> = controller.find_network_view(old_parent).unwrap().children().collect();
    let new_children: Vec<_> = controller.find_network_view(new_parent).unwrap().children().collect();
    assert!(old_children.is_empty());
    assert_eq!(new_children, [moved]);
}

#[test]
fn test_reparent_unknown_view_is_none() {
    let mut controller = root_server();
    let parent = controller.spawn_view(NetworkId::ROOT).unwrap();
    let ghost = NetworkId::generate(NetworkId::ROOT, 40);
    assert_eq!(controller.reparent_view(ghost, parent), None);
}

#[test]
fn test_destroy_propagates_to_mirrors() {
    let (mut server, mut client, _) = connected();
    let parent = server.spawn_view(NetworkId::ROOT).unwrap();
    let child = server.spawn_view(parent).unwrap();

    let destroyed = Rc::new(Cell::new(0));
    client.create_view(parent);
    let hook = destroyed.clone();
    client.create_view(child).add_component(Component::new("leaf").on_destroy(move |_, _| {
        hook.set(hook.get() + 1);
        Ok(())
    }));
    pump(&mut [&mut client, &mut server], 1);

    server.destroy_view(parent);
    assert!(server.find_network_view(parent).is_none());
    assert!(server.find_network_view(child).is_none());

    pump(&mut [&mut server, &mut client], 2);
    assert!(client.find_network_view(parent).is_none());
    assert!(client.find_network_view(child).is_none());
    assert_eq!(destroyed.get(), 1);
}

#[test]
fn test_destroying_foreign_view_stays_local() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    client.create_view(view);

    client.destroy_view(view);
    pump(&mut [&mut client, &mut server], 2);

    assert!(client.find_network_view(view).is_none());
    assert!(server.find_network_view(view).is_some());
}

#[test]
fn test_handler_can_destroy_views() {
    let (mut server, mut client, _) = connected();
    let view = server.spawn_view(NetworkId::ROOT).unwrap();
    client.create_view(view).add_component(Component::new("self_destruct").with_rpc(
        "Explode",
        &[],
        |_, ctx, _| {
            let view = ctx.view();
            ctx.destroy_view(view);
            Ok(())
        },
    ));
    pump(&mut [&mut client, &mut server], 1);

    server.rpc(view, "Explode", &[]).unwrap();
    pump(&mut [&mut server, &mut client], 2);

    assert!(client.find_network_view(view).is_none());
}

#[test]
fn test_peer_disconnect_is_reported() {
    let (mut server, mut client, peer) = connected();
    let peer_id = server.peer_id_of(peer);
    drain_events(&mut server);
    drain_events(&mut client);

    client.disconnect();
    assert_eq!(client.peer_id(), None);
    assert_eq!(drain_events(&mut client), [MultiplayerEvent::DisconnectedFromServer]);

    pump(&mut [&mut server], 1);
    assert_eq!(server.peer_count(), 0);
    assert_eq!(
        drain_events(&mut server),
        [MultiplayerEvent::PeerDisconnected { peer, peer_id }]
    );
}

#[test]
fn test_server_side_close_reaches_client() {
    let (mut server, mut client, peer) = connected();
    drain_events(&mut client);

    server.disconnect_peer(peer);
    pump(&mut [&mut client], 1);

    assert!(!client.is_client());
    assert_eq!(client.peer_id(), None);
    assert_eq!(drain_events(&mut client), [MultiplayerEvent::DisconnectedFromServer]);
}

#[test]
fn test_sending_without_session_fails() {
    let mut controller = NetworkController::new(frame_config(), registry());
    let result = controller.rpc(NetworkId::ROOT, "Anything", &[]);
    assert!(matches!(result, Err(SendError::NoSession)));

    let result = controller.rpc_to(NodeKey::Server, NetworkId::ROOT, "Anything", &[]);
    assert!(matches!(result, Err(SendError::UnknownNode(NodeKey::Server))));
}

#[test]
fn test_object_chunks_skip_zero() {
    let mut controller = root_server();
    controller.next_object_chunk = u16::MAX;

    let last = controller.generate_network_id(NetworkId::ROOT).unwrap();
    let wrapped = controller.generate_network_id(NetworkId::ROOT).unwrap();

    assert_eq!(last.chunk(), u16::MAX);
    assert_eq!(wrapped.chunk(), 1);
}

#[test]
fn test_object_ids_skip_live_views_after_wrap() {
    let mut controller = root_server();
    let first = controller.spawn_view(NetworkId::ROOT).unwrap();
    let second = controller.spawn_view(NetworkId::ROOT).unwrap();
    controller.next_object_chunk = u16::MAX - 1;

    let spawned: Vec<_> = (0..4)
        .map(|_| controller.spawn_view(NetworkId::ROOT).unwrap())
        .collect();

    let chunks: Vec<_> = spawned.iter().map(|id| id.chunk()).collect();
    assert_eq!(chunks, [u16::MAX - 1, u16::MAX, 3, 4]);
    assert!(!spawned.contains(&first) && !spawned.contains(&second));
    assert_eq!(controller.view_count(), 7);
}

#[test]
fn test_object_id_reused_once_view_is_gone() {
    let mut controller = root_server();
    let first = controller.spawn_view(NetworkId::ROOT).unwrap();
    controller.destroy_view(first);
    controller.next_object_chunk = u16::MAX;

    controller.generate_network_id(NetworkId::ROOT).unwrap();
    assert_eq!(controller.generate_network_id(NetworkId::ROOT), Some(first));
}

#[test]
fn test_object_ids_exhausted_under_one_owner() {
    let mut controller = root_server();
    for _ in 1..=u16::MAX {
        controller.spawn_view(NetworkId::ROOT).unwrap();
    }
    assert_eq!(controller.generate_network_id(NetworkId::ROOT), None);
    assert_eq!(controller.spawn_view(NetworkId::ROOT), None);
}

#[test]
fn test_peer_ids_skip_connected_peers_after_wrap() {
    let (mut server, mut first, first_peer) = connected();
    assert_eq!(server.peer_id_of(first_peer), Some(assign_peer_id(NetworkId::ROOT, 1)));
    server.last_given_peer_id = u16::MAX;

    let (mut second, second_peer) = join(&mut server);
    pump(&mut [&mut first, &mut second, &mut server], 3);

    let expected = assign_peer_id(NetworkId::ROOT, 2);
    assert_eq!(server.peer_id_of(second_peer), Some(expected));
    assert_eq!(second.peer_id(), Some(expected));
    assert_eq!(first.peer_id(), Some(assign_peer_id(NetworkId::ROOT, 1)));
}

#[test]
fn test_frame_mode_ticks_every_period() {
    let config = ControllerConfig {
        update_check: UpdateCheckType::Frame,
        update_period: 3,
        ..ControllerConfig::default()
    };
    let mut controller = NetworkController::new(config, registry());

    let ticks: Vec<bool> = (0..6).map(|_| controller.update_read()).collect();
    assert_eq!(ticks, [false, false, true, false, false, true]);
}

#[test]
fn test_time_mode_waits_for_period() {
    let config = ControllerConfig {
        update_period: 60_000,
        ..ControllerConfig::default()
    };
    let mut controller = NetworkController::new(config, registry());
    assert!(!controller.update_read());
}

#[test]
fn test_config_from_network_settings() {
    let network = NetworkConfig {
        update_check: UpdateCheckType::Frame,
        update_period: 2,
        synchronize_interval_ms: 250,
        max_read_events_per_tick: 8,
        max_connections: 4,
        max_outbound_backlog: 16,
        ..NetworkConfig::default()
    };
    let config = ControllerConfig::from(&network);

    assert_eq!(config.update_check, UpdateCheckType::Frame);
    assert_eq!(config.update_period, 2);
    assert_eq!(config.synchronize_interval, Duration::from_millis(250));
    assert_eq!(config.max_read_events_per_tick, 8);
    assert_eq!(config.transport.max_connections, 4);
    assert_eq!(config.transport.max_backlog, 16);
}

#[test]
fn test_tcp_session_handshake() {
    let config = ControllerConfig {
        update_period: 0,
        ..ControllerConfig::default()
    };
    let mut server = NetworkController::new(config.clone(), registry());
    server.set_root();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = NetworkController::new(config, registry());
    client.connect(addr).unwrap();

    for _ in 0..500 {
        client.update_read();
        server.update_read();
        client.update_write();
        server.update_write();
        if client.peer_id().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let expected = assign_peer_id(NetworkId::ROOT, 1);
    assert_eq!(client.peer_id(), Some(expected));
    let (_, peer_id) = server.peers().next().unwrap();
    assert_eq!(peer_id, Some(expected));
}
