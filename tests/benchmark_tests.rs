//! Performance benchmarks for the hot paths of the synchronization layer

use arena_client::config::ClientConfig;
use arena_client::network::ClientSession;
use arena_server::config::ServerConfig;
use arena_server::game::GameState;
use arena_server::network::Server;
use arena_shared::codec::WireReader;
use arena_shared::message::{self, TransformUpdate};
use arena_shared::{
    ChannelKey, Connection, ConnectionConfig, EntityId, Message, MessageHandler, MessageKind,
    MemoryNetwork, SequenceChannels, UnsupportedMessage, Vec2,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

fn transform(sequence: u32, entity: u32) -> Message {
    Message::TransformUpdate(TransformUpdate {
        sequence,
        entity: EntityId(entity),
        position: Vec2::new(412.5, 233.0),
        rotation: 1.25,
    })
}

/// Benchmarks framing and unframing a positional update
#[test]
fn benchmark_message_codec() {
    let iterations = 100_000;
    let mut buffer = Vec::with_capacity(64);
    let start = Instant::now();

    for i in 0..iterations {
        buffer.clear();
        message::encode(&transform(i, 7), &mut buffer).unwrap();
        let decoded = message::decode(&mut WireReader::new(&buffer)).unwrap();
        assert_eq!(decoded.sequence(), Some(i));
    }

    let duration = start.elapsed();
    println!(
        "Message codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds even unoptimized
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the per-channel staleness check across many entities
#[test]
fn benchmark_sequence_channels() {
    let mut channels = SequenceChannels::new();
    let entities = 500;
    let rounds = 200;
    let start = Instant::now();

    for round in 0..rounds {
        for entity in 0..entities {
            let key = ChannelKey::entity(MessageKind::TransformUpdate, EntityId(entity));
            assert!(channels.accept(key, round + 1));
            // A late duplicate of the previous round is always stale.
            assert!(!channels.accept(key, round));
        }
    }

    let duration = start.elapsed();
    let checks = u64::from(entities * rounds * 2);
    println!(
        "Sequence channels: {} checks in {:?} ({:.2} ns/check)",
        checks,
        duration,
        duration.as_nanos() as f64 / checks as f64
    );
    assert_eq!(channels.len(), entities as usize);
    assert!(duration.as_millis() < 1000);
}

#[derive(Default)]
struct Counter(usize);

impl MessageHandler for Counter {
    fn handle_message(&mut self, _message: Message) -> Result<(), UnsupportedMessage> {
        self.0 += 1;
        Ok(())
    }
}

/// Benchmarks packing, sending, receiving and dispatching a burst of updates
#[test]
fn benchmark_connection_throughput() {
    let network = MemoryNetwork::new();
    let a = SocketAddr::from(([127, 0, 0, 1], 4000));
    let b = SocketAddr::from(([127, 0, 0, 1], 4001));
    let end_a = network.bind(a);
    let end_b = network.bind(b);

    let now = Instant::now();
    let mut sender = Connection::with_session(b, ConnectionConfig::default(), 1, now);
    let mut receiver = Connection::new(a, ConnectionConfig::default(), now);
    let mut counter = Counter::default();

    let bursts = 100;
    let per_burst = 200;
    let start = Instant::now();

    for burst in 0..bursts {
        for entity in 0..per_burst {
            sender.enqueue_message(&transform(burst + 1, entity)).unwrap();
        }
        sender.send_queued_messages(&end_a, now).unwrap();
        receiver.poll_transport(&end_b, now).unwrap();
        receiver.dispatch_received_messages(&mut counter, now).unwrap();
    }

    let duration = start.elapsed();
    let messages = (bursts * per_burst) as usize;
    println!(
        "Connection throughput: {} messages in {:?} ({:.2} μs/message)",
        messages,
        duration,
        duration.as_micros() as f64 / messages as f64
    );
    assert_eq!(counter.0, messages);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks full server ticks with a busy arena
#[test]
fn benchmark_server_tick() {
    let network = MemoryNetwork::new();
    let server_addr = SocketAddr::from(([127, 0, 0, 1], 27960));
    let mut server = Server::with_game(
        network.bind(server_addr),
        ServerConfig::default(),
        GameState::seeded(1),
    );

    let mut now = Instant::now();
    let mut clients: Vec<_> = (0..12u16)
        .map(|i| {
            let endpoint = network.bind(SocketAddr::from(([127, 0, 0, 1], 5000 + i)));
            let config = ClientConfig {
                name: format!("bot{i}"),
                ..ClientConfig::default()
            };
            ClientSession::connect(endpoint, server_addr, config, now)
        })
        .collect();

    let tick = Duration::from_millis(33);
    for _ in 0..30 {
        server.tick(now).unwrap();
        for client in &mut clients {
            client.tick(now);
        }
        now += tick;
    }
    assert_eq!(server.player_count(), 12);

    let iterations = 300;
    let start = Instant::now();
    for _ in 0..iterations {
        for client in &mut clients {
            client.input_mut().set_movement(Vec2::new(1.0, 0.5));
            client.tick(now);
        }
        server.tick(now).unwrap();
        now += tick;
    }

    let duration = start.elapsed();
    println!(
        "Server tick (12 clients): {} ticks in {:?} ({:.2} μs/tick)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );
    assert!(clients.iter().all(|c| c.is_synced()));
    assert!(duration.as_millis() < 5000);
}
