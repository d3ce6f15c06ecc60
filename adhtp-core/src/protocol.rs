//! Protocol vocabulary: peer identities, opcodes, messages, session phases.

use std::fmt;

/// Identity of a process in the session. Valid identities are 1..=254;
/// 0 is reserved for "broadcast" in the destination field and 255 is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u8);

impl PeerId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 254;

    /// Returns `None` for 0 and 255.
    pub fn new(raw: u8) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&raw) {
            Some(PeerId(raw))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opcode byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Hello = 0,
    Ack = 1,
    Coord = 3,
    /// Local-only: synthesized when a map transfer finishes, never sent.
    Done = 4,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Opcode::Hello),
            1 => Some(Opcode::Ack),
            3 => Some(Opcode::Coord),
            4 => Some(Opcode::Done),
            _ => None,
        }
    }
}

/// Position and velocity of a player, in map pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Motion {
    pub x: i32,
    pub y: i32,
    pub dx: i32,
    pub dy: i32,
}

impl Motion {
    pub fn new(position: (i32, i32), velocity: (i32, i32)) -> Self {
        Motion {
            x: position.0,
            y: position.1,
            dx: velocity.0,
            dy: velocity.1,
        }
    }
}

/// Packet body, keyed by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Discovery: "I am here and want to join".
    Hello,
    /// Directed reply to a Hello. `map_size` is set only by the designated map source.
    Ack { map_size: Option<u32> },
    /// Live player state.
    Coord(Motion),
    /// Map transfer with the sender finished (local-only).
    Done,
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Hello => Opcode::Hello,
            Message::Ack { .. } => Opcode::Ack,
            Message::Coord(_) => Opcode::Coord,
            Message::Done => Opcode::Done,
        }
    }
}

/// One unit of wire communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sender: PeerId,
    /// `None` means broadcast.
    pub dest: Option<PeerId>,
    /// Strictly increasing per sender.
    pub seq: u32,
    pub message: Message,
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        self.message.opcode()
    }

    /// True if the packet is a broadcast or addressed to `me`.
    pub fn is_for(&self, me: PeerId) -> bool {
        self.dest.map_or(true, |d| d == me)
    }
}

/// Session bootstrap phase. Totally ordered; a process only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Discovering,
    Negotiating,
    Streaming,
    Ready,
    Active,
    Ending,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Discovering => "discovering",
            Phase::Negotiating => "negotiating",
            Phase::Streaming => "streaming",
            Phase::Ready => "ready",
            Phase::Active => "active",
            Phase::Ending => "ending",
        };
        f.write_str(s)
    }
}
