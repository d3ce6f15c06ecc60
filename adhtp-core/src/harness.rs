//! Test doubles: a flaky in-memory byte pipe and a lossy in-memory cluster.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::directory::PeerDirectory;
use crate::protocol::{Message, Motion, PeerId, Phase};
use crate::session::{Action, Event, Session};
use crate::transfer::{MapReceiver, MapSender, Role};
use crate::wire::{decode_packet, encode_packet};

/// Deterministic, non-repeating-looking byte pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

/// Always fails with the given kind.
pub struct Broken(pub io::ErrorKind);

impl Read for Broken {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(self.0))
    }
}

impl Write for Broken {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(self.0))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Bounded byte pipe that behaves like a non-blocking socket: short writes, short reads,
/// random `WouldBlock` and `Interrupted`.
pub struct FlakyPipe {
    rng: StdRng,
    buf: VecDeque<u8>,
    capacity: usize,
    max_chunk: usize,
    pub would_blocks: usize,
    /// Every accepted write, in order.
    pub written: Vec<Vec<u8>>,
}

impl FlakyPipe {
    pub fn new(seed: u64, capacity: usize, max_chunk: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            buf: VecDeque::new(),
            capacity,
            max_chunk,
            would_blocks: 0,
            written: Vec::new(),
        }
    }

    fn hiccup(&mut self) -> Option<io::Error> {
        let roll: f64 = self.rng.gen();
        if roll < 0.30 {
            self.would_blocks += 1;
            Some(io::ErrorKind::WouldBlock.into())
        } else if roll < 0.35 {
            Some(io::ErrorKind::Interrupted.into())
        } else {
            None
        }
    }

    fn chunk(&mut self, limit: usize) -> usize {
        self.rng.gen_range(1..=limit.min(self.max_chunk))
    }
}

impl Write for FlakyPipe {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if let Some(e) = self.hiccup() {
            return Err(e);
        }
        let room = self.capacity - self.buf.len();
        if room == 0 {
            self.would_blocks += 1;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.chunk(room.min(data.len()));
        self.buf.extend(&data[..n]);
        self.written.push(data[..n].to_vec());
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FlakyPipe {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if let Some(e) = self.hiccup() {
            return Err(e);
        }
        if self.buf.is_empty() {
            self.would_blocks += 1;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.chunk(self.buf.len().min(out.len()));
        for (slot, b) in out.iter_mut().zip(self.buf.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

struct Node {
    session: Session,
    directory: PeerDirectory,
    map: Vec<u8>,
    listening: bool,
    phases: Vec<Phase>,
    /// First round this node broadcasts Hello in.
    start: usize,
}

struct Datagram {
    from: usize,
    dest: Option<PeerId>,
    bytes: [u8; crate::wire::PACKET_SIZE],
}

/// One map stream between two nodes of the cluster.
struct Link {
    source: usize,
    receiver: usize,
    pipe: FlakyPipe,
    tx: MapSender,
    rx: MapReceiver,
}

/// In-memory session of several processes. Datagrams are lost, duplicated and reordered,
/// map streams go through flaky pipes.
pub struct Cluster {
    rng: StdRng,
    nodes: Vec<Node>,
    outbox: Vec<Datagram>,
    links: Vec<Link>,
    /// Datagrams the sequence filter rejected.
    pub dropped_duplicates: usize,
    /// Deliveries lost on the way, directed Acks included.
    pub lost: usize,
}

impl Cluster {
    /// Nodes start announcing one after another, in the order given.
    pub fn new(maps: &[(u8, Vec<u8>)], seed: u64) -> Self {
        let nodes = maps
            .iter()
            .enumerate()
            .map(|(i, (raw, map))| {
                let id = PeerId::new(*raw).expect("valid identity");
                Node {
                    session: Session::new(id, Some(map.len() as u32)),
                    directory: PeerDirectory::new(),
                    map: map.clone(),
                    listening: false,
                    phases: Vec::new(),
                    start: i * 4,
                }
            })
            .collect();
        Self {
            rng: StdRng::seed_from_u64(seed),
            nodes,
            outbox: Vec::new(),
            links: Vec::new(),
            dropped_duplicates: 0,
            lost: 0,
        }
    }

    pub fn session(&self, raw: u8) -> &Session {
        &self.nodes[self.index(raw)].session
    }

    pub fn phases(&self, raw: u8) -> Vec<Phase> {
        self.nodes[self.index(raw)].phases.clone()
    }

    fn index(&self, raw: u8) -> usize {
        self.nodes
            .iter()
            .position(|n| n.session.local().get() == raw)
            .expect("no such node")
    }

    fn addr(&self, idx: usize) -> SocketAddr {
        SocketAddr::from(([15, 0, 0, self.nodes[idx].session.local().get()], 2113))
    }

    /// Run until every node is Active and has served or received the map, or `max_rounds` pass.
    pub fn run(&mut self, max_rounds: usize) {
        for round in 0..max_rounds {
            let settled = self.nodes.iter().all(|n| {
                n.session.phase() == Phase::Active
                    && (n.session.is_listening() || n.session.completed_map().is_some())
            });
            if settled {
                return;
            }
            self.tick(round);
            self.deliver();
            self.stream();
        }
    }

    fn tick(&mut self, round: usize) {
        for idx in 0..self.nodes.len() {
            let node = &mut self.nodes[idx];
            let message = if node.session.phase() == Phase::Active {
                Message::Coord(Motion::new((round as i32, idx as i32), (1, 0)))
            } else if node.session.needs_hello() && round >= node.start {
                Message::Hello
            } else {
                continue;
            };
            let pkt = node.session.packet(None, message);
            self.apply(idx, vec![Action::Send(pkt)]);
        }
    }

    fn deliver(&mut self) {
        let mut batch = std::mem::take(&mut self.outbox);
        let dups: Vec<usize> = (0..batch.len())
            .filter(|_| self.rng.gen_bool(0.2))
            .collect();
        for i in dups {
            let d = &batch[i];
            let copy = Datagram {
                from: d.from,
                dest: d.dest,
                bytes: d.bytes,
            };
            batch.push(copy);
        }
        batch.shuffle(&mut self.rng);

        for d in batch {
            let from_addr = self.addr(d.from);
            for to in 0..self.nodes.len() {
                if to == d.from {
                    continue;
                }
                let local = self.nodes[to].session.local();
                if d.dest.is_some_and(|dest| dest != local) {
                    continue;
                }
                if self.rng.gen_bool(0.1) {
                    self.lost += 1;
                    continue;
                }
                let node = &mut self.nodes[to];
                let pkt = decode_packet(&d.bytes).expect("cluster only sends valid packets");
                node.directory.learn(pkt.sender, from_addr);
                if !node.directory.accept_sequence(pkt.sender, pkt.seq) {
                    self.dropped_duplicates += 1;
                    continue;
                }
                let actions = node.session.on_packet(&pkt);
                self.apply(to, actions);
            }
        }
    }

    fn stream(&mut self) {
        let mut done = Vec::new();
        for link in &mut self.links {
            let map = &self.nodes[link.source].map;
            let sent = link.tx.on_writable(&mut link.pipe, map).expect("pipe never fails");
            if sent.completion.is_some() {
                done.push((link.source, link.tx.peer(), Role::Sender, None));
            }
            let got = link.rx.on_readable(&mut link.pipe).expect("pipe never fails");
            if got.completion.is_some() {
                done.push((link.receiver, link.rx.peer(), Role::Receiver, link.rx.take_buffer()));
            }
        }
        for (idx, peer, role, buf) in done {
            let actions = self.nodes[idx].session.on_transfer_done(peer, role, buf);
            self.apply(idx, actions);
        }
    }

    fn apply(&mut self, idx: usize, actions: Vec<Action>) {
        let me = self.nodes[idx].session.local();
        for action in actions {
            match action {
                Action::Send(pkt) => {
                    let bytes = encode_packet(&pkt).expect("encodable");
                    self.outbox.push(Datagram {
                        from: idx,
                        dest: pkt.dest,
                        bytes,
                    });
                }
                Action::Listen => self.nodes[idx].listening = true,
                Action::Fetch { from, size } => {
                    let source = self.index(from.get());
                    assert!(
                        self.nodes[source].listening,
                        "{me} fetches from {from} before it listens"
                    );
                    let mut tx = MapSender::new(me);
                    tx.start().expect("fresh sender");
                    let mut rx = MapReceiver::new(from, size as usize).expect("map fits");
                    rx.begin_connect().expect("fresh receiver");
                    let seed = self.rng.gen();
                    self.links.push(Link {
                        source,
                        receiver: idx,
                        pipe: FlakyPipe::new(seed, 64 * 1024, 8 * 1024),
                        tx,
                        rx,
                    });
                }
                Action::Notify(Event::PhaseChanged(p)) => self.nodes[idx].phases.push(p),
                Action::Notify(_) => {}
            }
        }
    }
}
