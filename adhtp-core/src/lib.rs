//! Ad-hoc peer sync protocol reference implementation.
//! Host-driven: no I/O; the host feeds packets and transfer completions and receives actions.

pub mod directory;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod wire;

#[cfg(test)]
mod harness;

pub use directory::{DirectoryError, Peer, PeerDirectory, StreamToken};
pub use protocol::{Message, Motion, Opcode, Packet, PeerId, Phase};
pub use session::{map_source, Action, Event, Session};
pub use transfer::{
    Completion, MapReceiver, MapSender, Progress, Role, TransferError, MAX_MAP_SIZE,
};
pub use wire::{decode_packet, encode_packet, PacketDecodeError, PacketEncodeError, PACKET_SIZE};
