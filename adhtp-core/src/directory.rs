//! Peer directory: identity -> address, map stream handle, transfer counters, sequence filter.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use crate::protocol::PeerId;

/// Opaque handle the dispatcher uses for a per-peer map stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken(pub usize);

/// One known peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    /// Learned from the first datagram; never updated afterwards.
    pub addr: SocketAddr,
    pub stream: Option<StreamToken>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// `None` until the first packet from this peer is accepted.
    pub last_seen_seq: Option<u32>,
}

/// All peers seen this session. Peers are never removed.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<PeerId, Peer>,
    streams: HashMap<StreamToken, PeerId>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` at `addr` if unknown. Returns true if the peer is new.
    /// A known peer keeps its original address.
    pub fn learn(&mut self, id: PeerId, addr: SocketAddr) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(
            id,
            Peer {
                id,
                addr,
                stream: None,
                bytes_sent: 0,
                bytes_received: 0,
                last_seen_seq: None,
            },
        );
        true
    }

    /// Sequence filter. The first packet from a peer is always accepted; after that
    /// only strictly greater sequence numbers pass, so duplicates and stale
    /// reordered packets are dropped. Unknown peers are rejected.
    pub fn accept_sequence(&mut self, id: PeerId, seq: u32) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        match peer.last_seen_seq {
            Some(last) if seq <= last => false,
            _ => {
                peer.last_seen_seq = Some(seq);
                true
            }
        }
    }

    /// Associate the peer's (single) map stream.
    pub fn attach_stream(&mut self, id: PeerId, token: StreamToken) -> Result<(), DirectoryError> {
        if self.streams.contains_key(&token) {
            return Err(DirectoryError::TokenInUse(token));
        }
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(DirectoryError::UnknownPeer(id))?;
        if peer.stream.is_some() {
            return Err(DirectoryError::StreamExists(id));
        }
        peer.stream = Some(token);
        self.streams.insert(token, id);
        Ok(())
    }

    pub fn stream_for(&self, id: PeerId) -> Option<StreamToken> {
        self.peers.get(&id).and_then(|p| p.stream)
    }

    pub fn identity_for(&self, token: StreamToken) -> Option<PeerId> {
        self.streams.get(&token).copied()
    }

    /// Resolve an incoming TCP connection to the peer that announced itself from that IP.
    pub fn identity_by_ip(&self, ip: IpAddr) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.addr.ip() == ip)
            .map(|p| p.id)
    }

    pub fn record_sent(&mut self, id: PeerId, n: usize) {
        if let Some(p) = self.peers.get_mut(&id) {
            p.bytes_sent += n as u64;
        }
    }

    pub fn record_received(&mut self, id: PeerId, n: usize) {
        if let Some(p) = self.peers.get_mut(&id) {
            p.bytes_received += n as u64;
        }
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Peers in identity order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("peer {0} is unknown")]
    UnknownPeer(PeerId),
    #[error("peer {0} already has a map stream")]
    StreamExists(PeerId),
    #[error("stream token {0:?} is already attached")]
    TokenInUse(StreamToken),
}
