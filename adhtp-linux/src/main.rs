// Headless ad-hoc peer: discover, agree on the map source, sync the map, then send positions.

use std::path::PathBuf;
use std::time::Duration;

use adhtp_core::{Event, Phase};
use adhtp_linux::config::{self, NetConfig};
use adhtp_linux::{BroadcastKind, Network};
use anyhow::Context;
use clap::Parser;

/// 800 x 600 tiles, one byte each.
const BLANK_MAP_LEN: usize = 800 * 600;
/// Where the headless player stands.
const SPAWN: (i32, i32) = (64, 64);

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Identity in the session (1-254); the smallest identity serves the map
    #[arg(long)]
    player_id: Option<u8>,

    /// Broadcast UDP port; map connections use port - 1
    #[arg(long)]
    port: Option<u16>,

    /// This host's address on the ad-hoc network
    #[arg(long)]
    ip_addr: Option<String>,

    /// Broadcast address
    #[arg(long)]
    bd_addr: Option<String>,

    /// Local address to bind sockets to
    #[arg(long)]
    bind_ip: Option<String>,

    /// Network interface to bind to
    #[arg(long)]
    device: Option<String>,

    /// Map file to serve if this player ends up the map source
    #[arg(long)]
    map: Option<PathBuf>,

    /// Write the received map here on exit
    #[arg(long)]
    save_map: Option<PathBuf>,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,
}

impl Args {
    fn apply(&self, c: &mut NetConfig) {
        if let Some(id) = self.player_id {
            c.player_id = id;
        }
        if let Some(p) = self.port {
            c.port = p;
        }
        if let Some(s) = &self.ip_addr {
            c.ip_addr = s.clone();
        }
        if let Some(s) = &self.bd_addr {
            c.bd_addr = s.clone();
        }
        if let Some(s) = &self.bind_ip {
            c.bind_ip = s.clone();
        }
        if let Some(s) = &self.device {
            c.device = Some(s.clone());
        }
        if let Some(p) = &self.map {
            c.map_path = Some(p.clone());
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = config::load();
    args.apply(&mut cfg);

    let map = match &cfg.map_path {
        Some(p) => std::fs::read(p).with_context(|| format!("read map {}", p.display()))?,
        None => vec![0; BLANK_MAP_LEN],
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    rt.block_on(run(cfg, map, args.save_map, args.ticks))
}

async fn run(
    cfg: NetConfig,
    map: Vec<u8>,
    save_map: Option<PathBuf>,
    ticks: Option<u64>,
) -> anyhow::Result<()> {
    let mut net = Network::start(&cfg, Some(map)).context("network setup")?;
    let period = Duration::from_secs(1) / cfg.tick_rate.max(1);
    let mut interval = tokio::time::interval(period);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut tick = 0u64;
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = interval.tick() => {}
        }

        let sent = if net.is_phase_at_least(Phase::Active) {
            net.broadcast(BroadcastKind::Coord, SPAWN, (0, 0))
        } else if net.needs_hello() {
            net.broadcast(BroadcastKind::Hello, SPAWN, (0, 0))
        } else {
            Ok(())
        };
        sent.context("broadcast")?;

        for ev in net.poll().await.context("poll")? {
            if let Event::Position { peer, motion } = ev {
                log::debug!("{peer} at ({}, {}) moving ({}, {})", motion.x, motion.y, motion.dx, motion.dy);
            }
        }

        tick += 1;
        if ticks.is_some_and(|t| tick >= t) {
            break;
        }
    }

    net.end();
    if let Some(path) = save_map {
        match net.completed_map_buffer() {
            Some(m) => {
                std::fs::write(&path, m).with_context(|| format!("write map {}", path.display()))?;
                log::info!("saved {} map bytes to {}", m.len(), path.display());
            }
            None => log::warn!("no map was received, nothing saved"),
        }
    }
    net.destroy();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
