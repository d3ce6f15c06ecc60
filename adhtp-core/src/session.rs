//! Session bootstrap: Discovering → Negotiating → Streaming → Ready → Active → Ending.
//! Host-driven: the host feeds packets and transfer completions, the session returns actions.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::{Message, Motion, Packet, PeerId, Phase};
use crate::transfer::{Role, MAX_MAP_SIZE};

/// The authoritative map source: the smallest identity among this process and the
/// Hello/Ack senders it knows about. Pure and order-independent.
pub fn map_source(local: PeerId, candidates: impl IntoIterator<Item = PeerId>) -> PeerId {
    candidates
        .into_iter()
        .fold(local, |min, id| if id < min { id } else { min })
}

/// Something the game loop may want to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerJoined(PeerId),
    Position { peer: PeerId, motion: Motion },
    PhaseChanged(Phase),
    MapReceived { from: PeerId, len: usize },
    TransferFailed { peer: PeerId, role: Role },
    /// The rendezvous listener could not be started. No map will be served.
    ListenFailed,
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send this (directed) packet.
    Send(Packet),
    /// Start listening on the rendezvous port and serve the local map to whoever connects.
    Listen,
    /// Connect to `from` on the rendezvous port and receive `size` bytes.
    Fetch { from: PeerId, size: u32 },
    /// Pass to the game loop.
    Notify(Event),
}

/// One process's view of the session.
#[derive(Debug)]
pub struct Session {
    local: PeerId,
    local_map_len: Option<u32>,
    phase: Phase,
    observed: BTreeMap<PeerId, Phase>,
    candidates: BTreeSet<PeerId>,
    listening: bool,
    listen_failed: bool,
    fetching: Option<PeerId>,
    received_map: Option<Vec<u8>>,
    failed: BTreeSet<PeerId>,
    next_seq: u32,
}

impl Session {
    /// `local_map_len` is the size of the map this process could serve, if any.
    pub fn new(local: PeerId, local_map_len: Option<u32>) -> Self {
        Self {
            local,
            local_map_len,
            phase: Phase::Discovering,
            observed: BTreeMap::new(),
            candidates: BTreeSet::new(),
            listening: false,
            listen_failed: false,
            fetching: None,
            received_map: None,
            failed: BTreeSet::new(),
            next_seq: 0,
        }
    }

    /// Build an outgoing packet with the next sequence number.
    pub fn packet(&mut self, dest: Option<PeerId>, message: Message) -> Packet {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        Packet {
            sender: self.local,
            dest,
            seq,
            message,
        }
    }

    /// Process one packet that already passed the codec and the sequence filter.
    pub fn on_packet(&mut self, pkt: &Packet) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase == Phase::Ending || pkt.sender == self.local || !pkt.is_for(self.local) {
            return actions;
        }
        let from = pkt.sender;
        match &pkt.message {
            Message::Hello => {
                self.add_candidate(from, &mut actions);
                self.observe(from, Phase::Discovering);
                self.advance(Phase::Negotiating, &mut actions);
                self.listen_if_source(&mut actions);
                let map_size = if self.is_source() && !self.listen_failed {
                    self.local_map_len
                } else {
                    None
                };
                let ack = self.packet(Some(from), Message::Ack { map_size });
                actions.push(Action::Send(ack));
            }
            Message::Ack { map_size } => {
                if pkt.dest.is_none() {
                    return actions;
                }
                self.add_candidate(from, &mut actions);
                self.observe(from, Phase::Negotiating);
                self.advance(Phase::Streaming, &mut actions);
                self.listen_if_source(&mut actions);
                if let Some(size) = *map_size {
                    self.fetch_if_source(from, size, &mut actions);
                }
            }
            Message::Coord(motion) => {
                actions.push(Action::Notify(Event::Position {
                    peer: from,
                    motion: *motion,
                }));
                self.observe(from, Phase::Active);
                self.advance(Phase::Active, &mut actions);
            }
            Message::Done => {}
        }
        actions
    }

    /// A map stream with `peer` finished. For the receiving role `map` is the completed buffer.
    pub fn on_transfer_done(&mut self, peer: PeerId, role: Role, map: Option<Vec<u8>>) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase == Phase::Ending {
            return actions;
        }
        self.observe(peer, Phase::Ready);
        match role {
            Role::Sender => self.activate_if_served(&mut actions),
            Role::Receiver => {
                let map = map.unwrap_or_default();
                self.store_map(peer, map, &mut actions);
            }
        }
        actions
    }

    /// A map stream with `peer` failed. Recorded, surfaced, never retried.
    /// A source stops waiting for that peer.
    pub fn on_transfer_failed(&mut self, peer: PeerId, role: Role) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase == Phase::Ending {
            return actions;
        }
        self.failed.insert(peer);
        actions.push(Action::Notify(Event::TransferFailed { peer, role }));
        if role == Role::Sender {
            self.activate_if_served(&mut actions);
        }
        actions
    }

    /// The host could not carry out `Action::Listen`. Later Acks stop advertising the map.
    pub fn on_listen_failed(&mut self) -> Vec<Action> {
        if self.listen_failed {
            return Vec::new();
        }
        self.listen_failed = true;
        vec![Action::Notify(Event::ListenFailed)]
    }

    /// Local quit. The only way into Ending.
    pub fn end(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.advance(Phase::Ending, &mut actions);
        actions
    }

    fn add_candidate(&mut self, id: PeerId, actions: &mut Vec<Action>) {
        if self.candidates.insert(id) {
            actions.push(Action::Notify(Event::PeerJoined(id)));
        }
    }

    fn observe(&mut self, id: PeerId, phase: Phase) {
        let seen = self.observed.entry(id).or_insert(phase);
        if phase > *seen {
            *seen = phase;
        }
    }

    fn advance(&mut self, to: Phase, actions: &mut Vec<Action>) {
        if to > self.phase {
            self.phase = to;
            actions.push(Action::Notify(Event::PhaseChanged(to)));
        }
    }

    fn listen_if_source(&mut self, actions: &mut Vec<Action>) {
        if self.listening || !self.is_source() {
            return;
        }
        self.listening = true;
        actions.push(Action::Listen);
        self.advance(Phase::Streaming, actions);
    }

    fn fetch_if_source(&mut self, from: PeerId, size: u32, actions: &mut Vec<Action>) {
        if self.fetching.is_some() || self.received_map.is_some() {
            return;
        }
        if from != map_source(self.local, self.candidates.iter().copied()) {
            return;
        }
        self.fetching = Some(from);
        self.advance(Phase::Streaming, actions);
        if size as usize > MAX_MAP_SIZE {
            self.failed.insert(from);
            actions.push(Action::Notify(Event::TransferFailed {
                peer: from,
                role: Role::Receiver,
            }));
        } else if size == 0 {
            self.observe(from, Phase::Ready);
            self.store_map(from, Vec::new(), actions);
        } else {
            actions.push(Action::Fetch { from, size });
        }
    }

    fn store_map(&mut self, from: PeerId, map: Vec<u8>, actions: &mut Vec<Action>) {
        actions.push(Action::Notify(Event::MapReceived {
            from,
            len: map.len(),
        }));
        self.received_map = Some(map);
        self.advance(Phase::Ready, actions);
    }

    /// Source only: Active once every candidate either holds the map or failed.
    fn activate_if_served(&mut self, actions: &mut Vec<Action>) {
        let served = self.candidates.iter().all(|id| {
            self.failed.contains(id) || self.observed.get(id).is_some_and(|&p| p >= Phase::Ready)
        });
        if self.listening && served {
            self.advance(Phase::Active, actions);
        }
    }

    /// True if this process holds a map and is the smallest identity it knows of.
    pub fn is_source(&self) -> bool {
        self.local_map_len.is_some()
            && !self.candidates.is_empty()
            && map_source(self.local, self.candidates.iter().copied()) == self.local
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_phase_at_least(&self, phase: Phase) -> bool {
        self.phase >= phase
    }

    pub fn observed_phase(&self, id: PeerId) -> Option<Phase> {
        self.observed.get(&id).copied()
    }

    pub fn candidates(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.candidates.iter().copied()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn listen_failed(&self) -> bool {
        self.listen_failed
    }

    /// True while Hello should still go out: this process neither serves nor fetches the
    /// map yet, so a lost Hello or Ack has to be repeated.
    pub fn needs_hello(&self) -> bool {
        self.phase < Phase::Active
            && !self.listening
            && self.fetching.is_none()
            && self.received_map.is_none()
    }

    pub fn fetching_from(&self) -> Option<PeerId> {
        self.fetching
    }

    /// The map received from the source, once the transfer completed.
    pub fn completed_map(&self) -> Option<&[u8]> {
        self.received_map.as_deref()
    }

    pub fn failed_transfers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.failed.iter().copied()
    }
}
