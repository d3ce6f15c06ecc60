//! Socket setup and teardown: broadcast UDP socket, rendezvous TCP socket, outbound map connections.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use crate::config::Endpoints;

const LISTEN_BACKLOG: i32 = 8;

/// An outbound map connection in progress.
pub type Connecting = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Everything the dispatcher polls. Dropping it closes every socket it holds.
#[derive(Debug)]
pub struct Transport {
    pub udp: UdpSocket,
    rendezvous: Rendezvous,
    local_ip: Ipv4Addr,
    bind_ip: IpAddr,
    device: Option<String>,
    broadcast: SocketAddrV4,
    rendezvous_port: u16,
}

#[derive(Debug)]
enum Rendezvous {
    /// Bound to port - 1, not yet accepting.
    Bound(Socket),
    Listening(TcpListener),
    /// Only seen if turning the bound socket into a listener failed.
    Gone,
}

/// Create and bind both sockets. Must run inside a tokio runtime.
/// On failure nothing leaks: sockets created so far are dropped.
pub fn setup(ep: &Endpoints) -> Result<Transport, TransportError> {
    let udp = udp_socket(ep)?;
    let tcp = rendezvous_socket(ep)?;
    log::info!(
        "transport up: udp {} -> {}, rendezvous {}{}",
        ep.udp_bind,
        ep.broadcast,
        ep.tcp_bind,
        ep.device
            .as_deref()
            .map(|d| format!(" on {d}"))
            .unwrap_or_default()
    );
    Ok(Transport {
        udp,
        rendezvous: Rendezvous::Bound(tcp),
        local_ip: ep.ip,
        bind_ip: ep.udp_bind.ip(),
        device: ep.device.clone(),
        broadcast: ep.broadcast,
        rendezvous_port: ep.rendezvous_port,
    })
}

fn udp_step(step: &'static str) -> impl FnOnce(io::Error) -> TransportError {
    move |source| TransportError::Udp { step, source }
}

fn tcp_step(step: &'static str) -> impl FnOnce(io::Error) -> TransportError {
    move |source| TransportError::Rendezvous { step, source }
}

fn udp_socket(ep: &Endpoints) -> Result<UdpSocket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(udp_step("socket"))?;
    socket.set_reuse_address(true).map_err(udp_step("SO_REUSEADDR"))?;
    socket.set_broadcast(true).map_err(udp_step("SO_BROADCAST"))?;
    bind_device(&socket, ep.device.as_deref()).map_err(udp_step("SO_BINDTODEVICE"))?;
    socket.set_nonblocking(true).map_err(udp_step("O_NONBLOCK"))?;
    socket.bind(&ep.udp_bind.into()).map_err(udp_step("bind"))?;
    UdpSocket::from_std(socket.into()).map_err(udp_step("register"))
}

fn rendezvous_socket(ep: &Endpoints) -> Result<Socket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(tcp_step("socket"))?;
    socket.set_reuse_address(true).map_err(tcp_step("SO_REUSEADDR"))?;
    bind_device(&socket, ep.device.as_deref()).map_err(tcp_step("SO_BINDTODEVICE"))?;
    socket.set_nonblocking(true).map_err(tcp_step("O_NONBLOCK"))?;
    socket.bind(&ep.tcp_bind.into()).map_err(tcp_step("bind"))?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn bind_device(socket: &Socket, device: Option<&str>) -> io::Result<()> {
    match device {
        Some(d) => socket.bind_device(Some(d.as_bytes())),
        None => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_device(_socket: &Socket, device: Option<&str>) -> io::Result<()> {
    match device {
        Some(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "device binding needs Linux",
        )),
        None => Ok(()),
    }
}

impl Transport {
    /// Start accepting map connections. Idempotent.
    pub fn listen(&mut self) -> io::Result<()> {
        if let Rendezvous::Listening(_) = self.rendezvous {
            return Ok(());
        }
        let Rendezvous::Bound(socket) = std::mem::replace(&mut self.rendezvous, Rendezvous::Gone)
        else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "rendezvous socket already failed",
            ));
        };
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;
        log::info!("listening for map connections on {}", listener.local_addr()?);
        self.rendezvous = Rendezvous::Listening(listener);
        Ok(())
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        match &self.rendezvous {
            Rendezvous::Listening(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener().is_some()
    }

    /// Open a fresh socket towards the rendezvous port of the peer at `ip`.
    /// Bound to the local address (and device) so the peer sees the same IP as our datagrams.
    pub fn connect(&self, ip: IpAddr) -> io::Result<Connecting> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        bind_device(&socket, self.device.as_deref())?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(self.bind_ip, 0).into())?;
        let socket = TcpSocket::from_std_stream(socket.into());
        Ok(Box::pin(socket.connect(self.rendezvous_of(ip))))
    }

    /// Where a peer at `ip` accepts map connections.
    pub fn rendezvous_of(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.rendezvous_port)
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.broadcast)
    }

    /// True for datagrams this host sent itself (broadcasts loop back).
    pub fn is_own_datagram(&self, from: SocketAddr) -> bool {
        from.ip() == IpAddr::V4(self.local_ip)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("udp socket: {step} failed: {source}")]
    Udp {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("rendezvous socket: {step} failed: {source}")]
    Rendezvous {
        step: &'static str,
        #[source]
        source: io::Error,
    },
}
