//! Event dispatcher: one readiness wait over the broadcast socket, the rendezvous listener,
//! pending outbound connects and every live map stream. Each `poll_once` returns the batch
//! of events that became available, never blocking past its timeout.

use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use adhtp_core::{
    decode_packet, encode_packet, MapReceiver, MapSender, Packet, PacketEncodeError, PeerDirectory,
    PeerId, Role, StreamToken, TransferError,
};
use tokio::net::TcpStream;

use crate::transport::{Connecting, Transport};

/// Larger than any valid packet so oversized datagrams show up as such.
const RECV_BUF: usize = 64;

/// What one poll cycle produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Accepted by the codec, the self filter and the sequence filter.
    Packet(Packet),
    /// Last byte of a map stream moved. `map` is the finished buffer on the receiving side.
    TransferDone {
        peer: PeerId,
        role: Role,
        map: Option<Vec<u8>>,
    },
    TransferFailed { peer: PeerId, role: Role },
}

enum Engine {
    Sending(MapSender),
    Receiving(MapReceiver),
}

struct Stream {
    token: StreamToken,
    tcp: TcpStream,
    engine: Engine,
}

impl Stream {
    fn is_active(&self) -> bool {
        match &self.engine {
            Engine::Sending(tx) => tx.is_active(),
            Engine::Receiving(rx) => rx.is_active(),
        }
    }

    fn role(&self) -> Role {
        match self.engine {
            Engine::Sending(_) => Role::Sender,
            Engine::Receiving(_) => Role::Receiver,
        }
    }
}

struct Connect {
    peer: PeerId,
    receiver: MapReceiver,
    fut: Connecting,
}

enum Ready {
    Datagrams,
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    Connected(Connect, io::Result<TcpStream>),
    Stream(StreamToken),
    StreamFailed(StreamToken, io::Error),
}

/// Non-blocking `Read`/`Write` over a tokio stream, for the transfer engine.
struct TryIo<'a>(&'a TcpStream);

impl io::Read for TryIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for TryIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Dispatcher {
    local: PeerId,
    transport: Transport,
    directory: PeerDirectory,
    /// Served to every peer that connects once we listen.
    map: Arc<[u8]>,
    /// Indexed by `StreamToken`. Never shrinks during a session.
    streams: Vec<Stream>,
    connecting: Vec<Connect>,
}

impl Dispatcher {
    pub fn new(local: PeerId, transport: Transport, map: Arc<[u8]>) -> Self {
        Self {
            local,
            transport,
            directory: PeerDirectory::new(),
            map,
            streams: Vec::new(),
            connecting: Vec::new(),
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn is_listening(&self) -> bool {
        self.transport.is_listening()
    }

    /// Map streams opened so far, finished ones included.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Wait up to `timeout` for readiness and handle everything that is ready.
    pub async fn poll_once(&mut self, timeout: Duration) -> Result<Vec<DispatchEvent>, DispatchError> {
        let ready = match tokio::time::timeout(timeout, poll_fn(|cx| self.poll_ready(cx))).await {
            Err(_elapsed) => return Ok(Vec::new()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Ok(Err(e)) => return Err(DispatchError::Poll(e)),
            Ok(Ok(ready)) => ready,
        };
        let mut events = Vec::new();
        for r in ready {
            match r {
                Ready::Datagrams => self.drain_datagrams(&mut events),
                Ready::Accepted(tcp, addr) => self.on_accepted(tcp, addr),
                Ready::AcceptFailed(e) => log::warn!("accept failed: {e}"),
                Ready::Connected(c, res) => self.on_connected(c, res, &mut events),
                Ready::Stream(token) => self.on_stream_ready(token, &mut events),
                Ready::StreamFailed(token, e) => self.on_stream_failed(token, e, &mut events),
            }
        }
        Ok(events)
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Vec<Ready>>> {
        let mut ready = Vec::new();
        match self.transport.udp.poll_recv_ready(cx) {
            Poll::Ready(Ok(())) => ready.push(Ready::Datagrams),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {}
        }
        if let Some(listener) = self.transport.listener() {
            match listener.poll_accept(cx) {
                Poll::Ready(Ok((tcp, addr))) => ready.push(Ready::Accepted(tcp, addr)),
                Poll::Ready(Err(e)) => ready.push(Ready::AcceptFailed(e)),
                Poll::Pending => {}
            }
        }
        let mut i = 0;
        while i < self.connecting.len() {
            match self.connecting[i].fut.as_mut().poll(cx) {
                Poll::Ready(res) => {
                    let c = self.connecting.swap_remove(i);
                    ready.push(Ready::Connected(c, res));
                }
                Poll::Pending => i += 1,
            }
        }
        for s in self.streams.iter().filter(|s| s.is_active()) {
            let r = match s.engine {
                Engine::Sending(_) => s.tcp.poll_write_ready(cx),
                Engine::Receiving(_) => s.tcp.poll_read_ready(cx),
            };
            match r {
                Poll::Ready(Ok(())) => ready.push(Ready::Stream(s.token)),
                Poll::Ready(Err(e)) => ready.push(Ready::StreamFailed(s.token, e)),
                Poll::Pending => {}
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(ready))
        }
    }

    fn drain_datagrams(&mut self, events: &mut Vec<DispatchEvent>) {
        let mut buf = [0u8; RECV_BUF];
        loop {
            match self.transport.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Some(pkt) = self.accept_datagram(&buf[..n], from) {
                        events.push(DispatchEvent::Packet(pkt));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("udp receive failed: {e}");
                    return;
                }
            }
        }
    }

    fn accept_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Option<Packet> {
        if self.transport.is_own_datagram(from) {
            log::trace!("dropped own datagram");
            return None;
        }
        let pkt = match decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                log::trace!("dropped datagram from {from}: {e}");
                return None;
            }
        };
        if pkt.sender == self.local {
            log::trace!("dropped datagram from {from} claiming our identity");
            return None;
        }
        if self.directory.learn(pkt.sender, from) {
            log::debug!("learned peer {} at {from}", pkt.sender);
        }
        if !self.directory.accept_sequence(pkt.sender, pkt.seq) {
            log::trace!("dropped stale seq {} from {}", pkt.seq, pkt.sender);
            return None;
        }
        if !pkt.is_for(self.local) {
            log::trace!("dropped {:?} for another peer", pkt.opcode());
            return None;
        }
        Some(pkt)
    }

    fn next_token(&self) -> StreamToken {
        StreamToken(self.streams.len())
    }

    fn on_accepted(&mut self, tcp: TcpStream, addr: SocketAddr) {
        let Some(peer) = self.directory.identity_by_ip(addr.ip()) else {
            log::warn!("rejecting map connection from unknown {addr}");
            return;
        };
        let token = self.next_token();
        if let Err(e) = self.directory.attach_stream(peer, token) {
            log::warn!("rejecting map connection from {addr}: {e}");
            return;
        }
        let mut sender = MapSender::new(peer);
        if let Err(e) = sender.start() {
            log::warn!("{e}");
            return;
        }
        log::info!("serving {} map bytes to {peer}", self.map.len());
        self.streams.push(Stream {
            token,
            tcp,
            engine: Engine::Sending(sender),
        });
    }

    fn on_connected(&mut self, c: Connect, res: io::Result<TcpStream>, events: &mut Vec<DispatchEvent>) {
        let Connect {
            peer, mut receiver, ..
        } = c;
        let tcp = match res {
            Ok(tcp) => tcp,
            Err(e) => {
                let err = receiver.on_connect_failed(e);
                log::warn!("{err}");
                events.push(DispatchEvent::TransferFailed {
                    peer,
                    role: Role::Receiver,
                });
                return;
            }
        };
        let token = self.next_token();
        if let Err(e) = self.directory.attach_stream(peer, token) {
            log::warn!("dropping map connection to {peer}: {e}");
            events.push(DispatchEvent::TransferFailed {
                peer,
                role: Role::Receiver,
            });
            return;
        }
        receiver.on_connected();
        log::info!("connected to {peer}, receiving {} map bytes", receiver.expected());
        self.streams.push(Stream {
            token,
            tcp,
            engine: Engine::Receiving(receiver),
        });
    }

    fn on_stream_ready(&mut self, token: StreamToken, events: &mut Vec<DispatchEvent>) {
        let Some(peer) = self.directory.identity_for(token) else {
            return;
        };
        let Some(stream) = self.streams.get_mut(token.0) else {
            return;
        };
        let role = stream.role();
        let mut io = TryIo(&stream.tcp);
        let step = match &mut stream.engine {
            Engine::Sending(tx) => tx.on_writable(&mut io, &self.map),
            Engine::Receiving(rx) => rx.on_readable(&mut io),
        };
        let progress = match step {
            Ok(p) => p,
            Err(e) => {
                log::warn!("{e}");
                events.push(DispatchEvent::TransferFailed { peer, role });
                return;
            }
        };
        if progress.moved > 0 {
            match role {
                Role::Sender => self.directory.record_sent(peer, progress.moved),
                Role::Receiver => self.directory.record_received(peer, progress.moved),
            }
            log::debug!("map stream with {peer}: {} bytes", progress.moved);
        }
        if progress.completion.is_none() {
            return;
        }
        let map = match &mut stream.engine {
            Engine::Sending(_) => None,
            Engine::Receiving(rx) => rx.take_buffer(),
        };
        log::info!("map stream with {peer} complete ({role:?})");
        events.push(DispatchEvent::TransferDone { peer, role, map });
    }

    /// Readiness itself failed on one stream. Only that transfer fails.
    fn on_stream_failed(&mut self, token: StreamToken, e: io::Error, events: &mut Vec<DispatchEvent>) {
        let Some(peer) = self.directory.identity_for(token) else {
            return;
        };
        let Some(stream) = self.streams.get_mut(token.0) else {
            return;
        };
        let role = stream.role();
        let err = match &mut stream.engine {
            Engine::Sending(tx) => tx.on_stream_error(e),
            Engine::Receiving(rx) => rx.on_stream_error(e),
        };
        log::warn!("{err}");
        events.push(DispatchEvent::TransferFailed { peer, role });
    }

    /// Start accepting map connections on the rendezvous port.
    pub fn listen(&mut self) -> Result<(), DispatchError> {
        self.transport.listen().map_err(DispatchError::Listen)
    }

    /// Connect to `peer`'s rendezvous port and receive `size` bytes.
    /// The outcome shows up in a later `poll_once`.
    pub fn fetch(&mut self, peer: PeerId, size: u32) -> Result<(), TransferError> {
        let busy = self.directory.stream_for(peer).is_some()
            || self.connecting.iter().any(|c| c.peer == peer);
        if busy {
            return Err(TransferError::AlreadyStarted(peer));
        }
        let mut receiver = MapReceiver::new(peer, size as usize)?;
        receiver.begin_connect()?;
        let Some(ip) = self.directory.get(peer).map(|p| p.addr.ip()) else {
            return Err(receiver.on_connect_failed(io::Error::new(
                io::ErrorKind::NotFound,
                "peer address unknown",
            )));
        };
        let fut = match self.transport.connect(ip) {
            Ok(f) => f,
            Err(e) => return Err(receiver.on_connect_failed(e)),
        };
        log::info!(
            "fetching {size} map bytes from {peer} at {}",
            self.transport.rendezvous_of(ip)
        );
        self.connecting.push(Connect { peer, receiver, fut });
        Ok(())
    }

    /// Send one packet: to the broadcast address, or to the learned address of its destination.
    /// A full socket buffer or an unknown destination loses the datagram, as UDP would.
    pub fn send(&mut self, pkt: &Packet) -> Result<(), DispatchError> {
        let bytes = encode_packet(pkt)?;
        let to = match pkt.dest {
            None => self.transport.broadcast_addr(),
            Some(id) => match self.directory.get(id) {
                Some(p) => p.addr,
                None => {
                    log::debug!("no address for {id}, dropping {:?}", pkt.opcode());
                    return Ok(());
                }
            },
        };
        match self.transport.udp.try_send_to(&bytes, to) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("send buffer full, dropped {:?} to {to}", pkt.opcode());
            }
            Err(e) => log::warn!("send to {to} failed: {e}"),
        }
        Ok(())
    }

    /// Close every socket: broadcast, rendezvous, pending connects and peer streams.
    /// Consumes the dispatcher, so it can only happen once.
    pub fn destroy(self) {
        log::info!(
            "closing {} map streams and {} pending connects",
            self.streams.len(),
            self.connecting.len()
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
    #[error("cannot listen for map connections: {0}")]
    Listen(#[source] io::Error),
    #[error(transparent)]
    Encode(#[from] PacketEncodeError),
}
