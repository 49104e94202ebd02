use arena_client::config::ClientConfig;
use arena_client::input::Autopilot;
use arena_client::network::{ClientSession, SyncState};
use arena_shared::discovery::DiscoveryListener;
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// How often the status line is logged, in ticks.
const STATUS_EVERY: u64 = 30;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:27960")]
    server: SocketAddr,

    /// Display name
    #[arg(short = 'n', long, default_value = "Player")]
    name: String,

    /// Leave after this many ticks (runs until Ctrl+C when unset)
    #[arg(short = 't', long)]
    ticks: Option<u64>,

    /// List servers advertising on the LAN instead of connecting
    #[arg(short = 'b', long)]
    browse: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        name: args.name.clone(),
        ..ClientConfig::default()
    };

    if args.browse {
        return browse(&config).await;
    }

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut session = ClientSession::connect(socket, args.server, config, Instant::now());
    let mut autopilot = Autopilot::new();

    let mut ticker = interval(Duration::from_millis(33));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                if let (true, Some(player)) = (session.is_synced(), session.player_id()) {
                    let mut input = std::mem::take(session.input_mut());
                    autopilot.drive(player, session.world(), &mut input);
                    *session.input_mut() = input;
                }
                session.tick(now);

                ticks += 1;
                if ticks % STATUS_EVERY == 0 {
                    log_status(&session, now);
                }
                if !session.state().is_active() {
                    break;
                }
                if args.ticks.is_some_and(|limit| ticks >= limit) {
                    session.disconnect(now);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving...");
                session.disconnect(Instant::now());
                break;
            }
        }
    }

    match session.state() {
        SyncState::Faulted(fault) => warn!("Session ended: {}", fault),
        state => info!("Session ended: {:?}", state),
    }
    Ok(())
}

fn log_status(session: &ClientSession<UdpSocket>, now: Instant) {
    let stats = session.stats();
    info!(
        "{:?} | rtt {:?} | {} players, {} entities | sent {} recv {} resent {} stale {}",
        session.state(),
        session.rtt(),
        session.world().player_count(),
        session.world().entity_count(),
        stats.datagrams_sent,
        stats.datagrams_received,
        stats.reliable_resends,
        stats.stale_updates,
    );
    if session.is_lagging(now) {
        warn!("Waiting for server...");
    }
}

/// Listens for advertisements for one discovery timeout and prints what was
/// heard.
async fn browse(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut listener = DiscoveryListener::bind(&config.discovery).await?;
    let deadline = Instant::now() + config.discovery.discovery_timeout;
    let mut ticker = interval(Duration::from_millis(100));

    while Instant::now() < deadline {
        ticker.tick().await;
        listener.poll(Instant::now())?;
    }

    let servers = listener.servers().servers();
    if servers.is_empty() {
        println!("No servers found");
    }
    for server in servers {
        println!("{:<32} {}", server.name, server.endpoint);
    }
    Ok(())
}
