//! Load network config from file, environment and command line.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use adhtp_core::PeerId;
use serde::Deserialize;

/// Network configuration. File: ~/.config/adhtp/config.toml or /etc/adhtp/config.toml.
/// Env overrides: ADHTP_PORT, ADHTP_PLAYER_ID, ADHTP_IP_ADDR, ADHTP_BD_ADDR, ADHTP_DEVICE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Interface to bind both sockets to (SO_BINDTODEVICE). None binds to no device.
    #[serde(default)]
    pub device: Option<String>,
    /// Ad-hoc cell name. Informational only; the adapter is set up outside this program.
    #[serde(default)]
    pub essid: Option<String>,
    /// This host's address on the ad-hoc network (default 15.0.0.1).
    #[serde(default = "default_ip_addr")]
    pub ip_addr: String,
    #[serde(default = "default_net_msk")]
    pub net_msk: String,
    /// Where Hello/Coord broadcasts go (default 15.0.0.255).
    #[serde(default = "default_bd_addr")]
    pub bd_addr: String,
    /// Local address both sockets bind to (default 0.0.0.0).
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_player_id")]
    pub player_id: u8,
    /// Broadcast UDP port (default 2113). The map rendezvous listens on port - 1.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Game ticks per second.
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    /// Map to serve if this process ends up the map source. None means a blank map.
    #[serde(default)]
    pub map_path: Option<PathBuf>,
}

fn default_ip_addr() -> String {
    "15.0.0.1".into()
}
fn default_net_msk() -> String {
    "255.255.255.0".into()
}
fn default_bd_addr() -> String {
    "15.0.0.255".into()
}
fn default_bind_ip() -> String {
    "0.0.0.0".into()
}
fn default_player_id() -> u8 {
    1
}
fn default_port() -> u16 {
    2113
}
fn default_poll_timeout_ms() -> u64 {
    24
}
fn default_tick_rate() -> u32 {
    32
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            device: None,
            essid: None,
            ip_addr: default_ip_addr(),
            net_msk: default_net_msk(),
            bd_addr: default_bd_addr(),
            bind_ip: default_bind_ip(),
            player_id: default_player_id(),
            port: default_port(),
            poll_timeout_ms: default_poll_timeout_ms(),
            tick_rate: default_tick_rate(),
            map_path: None,
        }
    }
}

/// Validated, typed view of a [`NetConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub local: PeerId,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: SocketAddrV4,
    pub udp_bind: SocketAddr,
    pub tcp_bind: SocketAddr,
    /// Port every peer's rendezvous listener uses.
    pub rendezvous_port: u16,
    pub device: Option<String>,
    pub poll_timeout: Duration,
}

impl NetConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    /// Values that do not parse are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(p) = lookup("ADHTP_PORT").and_then(|s| s.parse().ok()) {
            self.port = p;
        }
        if let Some(id) = lookup("ADHTP_PLAYER_ID").and_then(|s| s.parse().ok()) {
            self.player_id = id;
        }
        if let Some(s) = lookup("ADHTP_IP_ADDR") {
            self.ip_addr = s;
        }
        if let Some(s) = lookup("ADHTP_BD_ADDR") {
            self.bd_addr = s;
        }
        if let Some(s) = lookup("ADHTP_DEVICE") {
            self.device = Some(s).filter(|d| !d.is_empty());
        }
    }

    /// Check every value and convert it into socket addresses.
    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        let local = PeerId::new(self.player_id).ok_or(ConfigError::PlayerId(self.player_id))?;
        if self.port < 2 {
            return Err(ConfigError::Port(self.port));
        }
        let ip = parse_ip("ip_addr", &self.ip_addr)?;
        let netmask = parse_ip("net_msk", &self.net_msk)?;
        let bd = parse_ip("bd_addr", &self.bd_addr)?;
        let bind = parse_ip("bind_ip", &self.bind_ip)?;
        if !in_subnet(bd, ip, netmask) {
            log::warn!("broadcast address {bd} is outside {ip}/{netmask}");
        }
        let rendezvous_port = self.port - 1;
        Ok(Endpoints {
            local,
            ip,
            netmask,
            broadcast: SocketAddrV4::new(bd, self.port),
            udp_bind: SocketAddr::from((bind, self.port)),
            tcp_bind: SocketAddr::from((bind, rendezvous_port)),
            rendezvous_port,
            device: self.device.clone(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        })
    }
}

fn parse_ip(field: &'static str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value.parse().map_err(|_| ConfigError::Address {
        field,
        value: value.to_string(),
    })
}

fn in_subnet(addr: Ipv4Addr, net: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    u32::from(addr) & mask == u32::from(net) & mask
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("player id {0} out of range 1..=254")]
    PlayerId(u8),
    #[error("port {0} leaves no room for the rendezvous port below it")]
    Port(u16),
    #[error("{field}: {value:?} is not an IPv4 address")]
    Address { field: &'static str, value: String },
    #[error("config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load config: merge default, then config file (if present), then env vars.
/// Command-line flags are applied on top by the binary.
pub fn load() -> NetConfig {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/adhtp/config.toml"));
    }
    out.push(PathBuf::from("/etc/adhtp/config.toml"));
    out
}

fn load_file() -> Option<NetConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("cannot read {}: {e}", path.display());
            return None;
        }
    };
    match NetConfig::from_toml(&text) {
        Ok(c) => {
            log::info!("config loaded from {}", path.display());
            Some(c)
        }
        Err(e) => {
            log::warn!("ignoring {}: {e}", path.display());
            None
        }
    }
}
