//! Framing: fixed 24-byte datagram, every multi-byte field big-endian.
//!
//! ```text
//! 0      1       2     3    4        8                        24
//! | op | sender | dest | 0 | seq u32 | payload i32 x 4        |
//! ```

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::protocol::{Message, Motion, Opcode, Packet, PeerId};

/// Size of every packet on the wire, whatever the opcode.
pub const PACKET_SIZE: usize = 24;

/// On-wire record. Field order is the wire order.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawPacket {
    opcode: u8,
    sender: u8,
    dest: u8,
    padding: u8,
    seq: u32,
    payload: [i32; 4],
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Encode a packet into its fixed-size wire form.
pub fn encode_packet(pkt: &Packet) -> Result<[u8; PACKET_SIZE], PacketEncodeError> {
    let payload = match &pkt.message {
        Message::Hello => [0; 4],
        Message::Ack { map_size } => [map_size.unwrap_or(0) as i32, 0, 0, 0],
        Message::Coord(m) => [m.x, m.y, m.dx, m.dy],
        Message::Done => return Err(PacketEncodeError::LocalOnly),
    };
    let raw = RawPacket {
        opcode: pkt.opcode() as u8,
        sender: pkt.sender.get(),
        dest: pkt.dest.map_or(0, PeerId::get),
        padding: 0,
        seq: pkt.seq,
        payload,
    };
    let mut out = [0u8; PACKET_SIZE];
    options().serialize_into(&mut out[..], &raw)?;
    Ok(out)
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketEncodeError {
    #[error("opcode is local-only and never sent")]
    LocalOnly,
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Decode one datagram. Anything that is not exactly one valid packet is rejected;
/// callers treat a rejection as "no event", not as a failure.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, PacketDecodeError> {
    if bytes.len() != PACKET_SIZE {
        return Err(PacketDecodeError::WrongSize(bytes.len()));
    }
    let raw: RawPacket = options().deserialize(bytes)?;
    let opcode = Opcode::from_byte(raw.opcode).ok_or(PacketDecodeError::UnknownOpcode(raw.opcode))?;
    let sender = PeerId::new(raw.sender).ok_or(PacketDecodeError::BadSender(raw.sender))?;
    let dest = match raw.dest {
        0 => None,
        d => Some(PeerId::new(d).ok_or(PacketDecodeError::BadDestination(d))?),
    };
    let [a, b, c, d] = raw.payload;
    let message = match opcode {
        Opcode::Hello => Message::Hello,
        Opcode::Ack => Message::Ack {
            map_size: match a as u32 {
                0 => None,
                n => Some(n),
            },
        },
        Opcode::Coord => Message::Coord(Motion {
            x: a,
            y: b,
            dx: c,
            dy: d,
        }),
        Opcode::Done => return Err(PacketDecodeError::LocalOnly),
    };
    Ok(Packet {
        sender,
        dest,
        seq: raw.seq,
        message,
    })
}

/// Reason a datagram was not accepted as a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("datagram is {0} bytes, expected {}", PACKET_SIZE)]
    WrongSize(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("local-only opcode received from the network")]
    LocalOnly,
    #[error("invalid sender identity {0}")]
    BadSender(u8),
    #[error("invalid destination identity {0}")]
    BadDestination(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        PeerId::new(n).unwrap()
    }

    #[test]
    fn every_opcode_has_the_same_size() {
        let packets = [
            Packet {
                sender: id(1),
                dest: None,
                seq: 1,
                message: Message::Hello,
            },
            Packet {
                sender: id(1),
                dest: Some(id(2)),
                seq: 2,
                message: Message::Ack {
                    map_size: Some(480_000),
                },
            },
            Packet {
                sender: id(1),
                dest: None,
                seq: 3,
                message: Message::Coord(Motion::new((-5, 7), (1, -1))),
            },
        ];
        for p in &packets {
            let bytes = encode_packet(p).unwrap();
            assert_eq!(bytes.len(), PACKET_SIZE);
            assert_eq!(&decode_packet(&bytes).unwrap(), p);
        }
    }

    #[test]
    fn fields_are_network_byte_order() {
        let p = Packet {
            sender: id(9),
            dest: Some(id(2)),
            seq: 0x0102_0304,
            message: Message::Coord(Motion::new((0x0A0B_0C0D, -1), (0, 1))),
        };
        let bytes = encode_packet(&p).unwrap();
        assert_eq!(&bytes[..4], &[Opcode::Coord as u8, 9, 2, 0]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[12..16], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 1]);
    }

    #[test]
    fn ack_without_map_encodes_zero() {
        let p = Packet {
            sender: id(4),
            dest: Some(id(1)),
            seq: 0,
            message: Message::Ack { map_size: None },
        };
        let bytes = encode_packet(&p).unwrap();
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]);
        assert_eq!(decode_packet(&bytes).unwrap().message, Message::Ack { map_size: None });
    }

    #[test]
    fn short_and_long_datagrams_rejected() {
        let p = Packet {
            sender: id(1),
            dest: None,
            seq: 1,
            message: Message::Hello,
        };
        let bytes = encode_packet(&p).unwrap();
        assert!(matches!(
            decode_packet(&bytes[..PACKET_SIZE - 1]),
            Err(PacketDecodeError::WrongSize(23))
        ));
        let mut long = bytes.to_vec();
        long.push(0);
        assert!(matches!(
            decode_packet(&long),
            Err(PacketDecodeError::WrongSize(25))
        ));
        assert!(matches!(
            decode_packet(&[]),
            Err(PacketDecodeError::WrongSize(0))
        ));
    }

    #[test]
    fn done_never_crosses_the_wire() {
        let p = Packet {
            sender: id(1),
            dest: None,
            seq: 1,
            message: Message::Done,
        };
        assert!(matches!(encode_packet(&p), Err(PacketEncodeError::LocalOnly)));

        let mut forged = [0u8; PACKET_SIZE];
        forged[0] = Opcode::Done as u8;
        forged[1] = 1;
        assert!(matches!(
            decode_packet(&forged),
            Err(PacketDecodeError::LocalOnly)
        ));
    }

    #[test]
    fn garbage_header_rejected() {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[0] = 99;
        bytes[1] = 1;
        assert!(matches!(
            decode_packet(&bytes),
            Err(PacketDecodeError::UnknownOpcode(99))
        ));
        bytes[0] = 0;
        bytes[1] = 0;
        assert!(matches!(
            decode_packet(&bytes),
            Err(PacketDecodeError::BadSender(0))
        ));
        bytes[1] = 3;
        bytes[2] = 255;
        assert!(matches!(
            decode_packet(&bytes),
            Err(PacketDecodeError::BadDestination(255))
        ));
    }

    #[test]
    fn padding_is_ignored() {
        let p = Packet {
            sender: id(7),
            dest: None,
            seq: 11,
            message: Message::Hello,
        };
        let mut bytes = encode_packet(&p).unwrap();
        bytes[3] = 0xAA;
        assert_eq!(decode_packet(&bytes).unwrap(), p);
    }
}
