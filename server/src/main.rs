use arena_server::config::ServerConfig;
use arena_server::network::Server;
use arena_shared::discovery::{Advertisement, DiscoveryBroadcaster};
use arena_shared::DEFAULT_PORT;
use clap::Parser;
use log::{error, info, warn};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "30")]
    tick_rate: u16,
    /// Maximum number of players
    #[clap(short, long, default_value = "16")]
    max_players: usize,
    /// Name shown to clients browsing the LAN
    #[clap(short, long, default_value = "Arena")]
    name: String,
    /// Do not advertise on the LAN
    #[clap(long)]
    no_advertise: bool,
}

/// Binds the socket, then runs the server tick until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = ServerConfig {
        name: args.name.clone(),
        tick_rate: args.tick_rate.max(1),
        max_players: args.max_players,
        ..ServerConfig::default()
    };

    let address = format!("{}:{}", args.host, args.port);
    let socket = UdpSocket::bind(&address).await?;
    let port = socket.local_addr()?.port();
    info!(
        "Server \"{}\" listening on {} at {} Hz, up to {} players",
        config.name, address, config.tick_rate, config.max_players
    );

    let mut broadcaster = if args.no_advertise {
        None
    } else {
        let advertisement = Advertisement::new(port, &config.name);
        match DiscoveryBroadcaster::bind(&config.discovery, &advertisement).await {
            Ok(broadcaster) => Some(broadcaster),
            Err(e) => {
                warn!("LAN advertising disabled: {}", e);
                None
            }
        }
    };

    let mut ticker = interval(Duration::from_secs_f32(config.tick_seconds()));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut server = Server::new(socket, config);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                if let Err(e) = server.tick(now) {
                    error!("Server tick failed: {}", e);
                    break;
                }
                if let Some(advertiser) = broadcaster.as_mut() {
                    if let Err(e) = advertiser.poll(now) {
                        warn!("Advertisement failed, no longer advertising: {}", e);
                        broadcaster = None;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.shutdown(Instant::now());
    Ok(())
}
