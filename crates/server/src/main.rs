use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use cadence::{Authority, AuthorityConfig, AuthorityEvent, DemoGame};

#[derive(Parser)]
#[command(name = "cadence-server")]
#[command(about = "Cadence session authority")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = cadence::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 30)]
    frame_rate: u32,

    #[arg(short, long, default_value_t = 16)]
    max_peers: usize,

    #[arg(long, default_value = "cadence server")]
    name: String,

    #[arg(long, help = "Key peers must present to join")]
    join_key: Option<String>,

    #[arg(long, help = "Rendezvous coordinator to register with (host:port)")]
    relay: Option<String>,

    #[arg(long, default_value_t = 1, help = "Demo simulation seed")]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = AuthorityConfig {
        server_name: args.name,
        max_peers: args.max_peers,
        join_key: args.join_key,
        frame_rate: args.frame_rate,
        relay: args.relay,
        ..Default::default()
    };

    let mut server = Authority::new(&bind_addr, config, DemoGame::new(args.seed))?;
    let running = server.running();

    while running.load(Ordering::SeqCst) {
        server.tick_once();
        for event in server.drain_events() {
            match event {
                AuthorityEvent::PeerConnecting { addr } => {
                    info!("connection from {}", addr);
                }
                AuthorityEvent::PeerJoined { peer_id, name } => {
                    info!("peer {} ({}) joined", peer_id, name);
                }
                AuthorityEvent::PeerLeft { peer_id, reason } => {
                    info!("peer {} left: {}", peer_id, reason.as_str());
                }
                AuthorityEvent::Denied { addr, code } => {
                    warn!("denied {}: {}", addr, code.as_str());
                }
                AuthorityEvent::Desync { peer_id } => {
                    warn!("peer {} fell out of sync", peer_id);
                }
                AuthorityEvent::Chat { peer_id, message } => {
                    info!("[chat] peer {}: {}", peer_id, message);
                }
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    server.shutdown();
    info!("server stopped");
    Ok(())
}
