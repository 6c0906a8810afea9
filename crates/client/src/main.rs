use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use cadence::{DemoGame, PeerConfig, PeerEvent, PeerSession, SessionState};

#[derive(Parser)]
#[command(name = "cadence-client")]
#[command(about = "Cadence joining peer")]
struct Args {
    #[arg(help = "Server address to join (e.g. 127.0.0.1:26215)")]
    server: String,

    #[arg(short, long, default_value = "player")]
    name: String,

    #[arg(
        short,
        long,
        default_value_t = cadence::COMPANY_SPECTATOR,
        help = "Company to play as (default: spectate)"
    )]
    company: u8,

    #[arg(long, help = "Key the server requires to join")]
    join_key: Option<String>,

    #[arg(long, help = "Query the server descriptor and exit")]
    info: bool,

    #[arg(long, default_value_t = 1, help = "Demo simulation seed")]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.info {
        let info = cadence::query_info(&args.server, Duration::from_secs(5))?;
        println!(
            "{:?}: frame {}, {}/{} peers{}",
            info.name,
            info.frame,
            info.peers,
            info.max_peers,
            if info.paused { ", paused" } else { "" }
        );
        return Ok(());
    }

    let config = PeerConfig {
        name: args.name,
        company: args.company,
        join_key: args.join_key,
        ..Default::default()
    };
    let mut session = PeerSession::connect(&args.server, config, DemoGame::new(args.seed))?;

    while session.state() != SessionState::Inactive {
        session.pump();
        // Follow the authority's announcements rather than racing to the
        // granted ceiling; the extra grant is slack for stream hiccups.
        while session.behind() > 0 && session.step() {}

        for event in session.drain_events() {
            match event {
                PeerEvent::Connected {
                    peer_id,
                    server_name,
                } => {
                    info!("joined {:?} as peer {}", server_name, peer_id);
                }
                PeerEvent::Waiting { position } => {
                    info!("waiting for snapshot, position {}", position);
                }
                PeerEvent::Active { frame } => {
                    info!("live at frame {}", frame);
                }
                PeerEvent::PeerInfo {
                    peer_id,
                    name,
                    company,
                } => {
                    info!("peer {} is {:?} (company {})", peer_id, name, company);
                }
                PeerEvent::PeerJoined { peer_id } => {
                    info!("peer {} joined", peer_id);
                }
                PeerEvent::PeerLeft { peer_id } => {
                    info!("peer {} left", peer_id);
                }
                PeerEvent::Chat { peer_id, message } => {
                    info!("[chat] peer {}: {}", peer_id, message);
                }
                PeerEvent::CommandCompleted {
                    frame,
                    cmd,
                    callback,
                } => {
                    info!(
                        "command {:#x} executed at frame {} (callback {})",
                        cmd, frame, callback
                    );
                }
                PeerEvent::Dropped { reason } => {
                    warn!("session ended: {}", reason.as_str());
                }
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    Ok(())
}
