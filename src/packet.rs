use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;

use crate::endpoint::Endpoint;

/// Leading constant on every datagram, mostly so captures are easy to pick
/// out in tools like Wireshark.
pub(crate) const MAGIC: u16 = 0x1234;
pub(crate) const VERSION: u8 = 1;

/// Serialized header size in bytes.
pub(crate) const HEADER_BYTES: usize = 16;

/// Maximum payload bytes carried by a single packet.
pub(crate) const MAX_DATA_BYTES: usize = 1024;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub(crate) struct PacketFlags: u8 {
        const SYN = 1 << 0;
        const ACK = 1 << 1;
        /// Reserved; graceful teardown is not implemented.
        const FIN = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PacketHeader {
    pub(crate) flags: PacketFlags,
    pub(crate) seqnum: u32,
    pub(crate) acknum: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct Packet {
    pub(crate) header: PacketHeader,
    pub(crate) payload: Bytes,
}

impl Packet {
    /// A flags-only packet stamped with the current sequence numbers.
    pub(crate) fn control(flags: PacketFlags, seqnum: u32, acknum: u32) -> Self {
        Self {
            header: PacketHeader {
                flags,
                seqnum,
                acknum,
            },
            payload: Bytes::new(),
        }
    }

    /// A payload-carrying packet. Data always carries the sender's current
    /// cumulative acknowledgment so a receiver mid-handshake can complete it
    /// even when the dedicated acknowledgment packet was coalesced away.
    pub(crate) fn data(seqnum: u32, acknum: u32, payload: Bytes) -> Self {
        assert!(
            payload.len() <= MAX_DATA_BYTES,
            "a packet's payload must fit the wire cap"
        );
        assert!(!payload.is_empty(), "a data packet must carry bytes");
        Self {
            header: PacketHeader {
                flags: PacketFlags::ACK,
                seqnum,
                acknum,
            },
            payload,
        }
    }

    /// The number of sequence slots this packet consumes: one per SYN or
    /// FIN, plus one per payload byte. Pure acknowledgments consume none.
    pub(crate) fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.header.flags.contains(PacketFlags::SYN) {
            len += 1;
        }
        if self.header.flags.contains(PacketFlags::FIN) {
            len += 1;
        }
        len
    }

    /// Whether the peer must acknowledge this packet, i.e. whether it enters
    /// the retransmission map. Exactly the packets that consume sequence
    /// slots need acknowledgment.
    pub(crate) fn needs_ack(&self) -> bool {
        self.seq_len() > 0
    }

    fn encode(&self) -> BytesMut {
        let mut wire = BytesMut::with_capacity(HEADER_BYTES + self.payload.len());
        wire.put_u16(MAGIC);
        wire.put_u8(VERSION);
        wire.put_u8(self.header.flags.bits());
        wire.put_u32(self.header.seqnum);
        wire.put_u32(self.header.acknum);
        wire.put_u32(self.payload.len() as u32);
        wire.extend_from_slice(&self.payload);
        wire
    }

    /// Parses one datagram. Returns `None` for anything that cannot be a
    /// packet of ours: short input, wrong magic or version, unknown flag
    /// bits, or a length field inconsistent with the datagram.
    fn decode(mut wire: &[u8]) -> Option<Self> {
        if wire.len() < HEADER_BYTES {
            return None;
        }
        if wire.get_u16() != MAGIC {
            return None;
        }
        if wire.get_u8() != VERSION {
            return None;
        }
        let flags = PacketFlags::from_bits(wire.get_u8())?;
        let seqnum = wire.get_u32();
        let acknum = wire.get_u32();
        let length = wire.get_u32() as usize;
        if length > MAX_DATA_BYTES || length > wire.remaining() {
            return None;
        }
        Some(Self {
            header: PacketHeader {
                flags,
                seqnum,
                acknum,
            },
            payload: Bytes::copy_from_slice(&wire[..length]),
        })
    }
}

/// Serializes `packet` and performs a single nonblocking send.
pub(crate) fn send_datagram(
    endpoint: &Endpoint,
    packet: &Packet,
    to: SocketAddrV4,
) -> io::Result<()> {
    let wire = packet.encode();
    endpoint.send_to(&wire, SocketAddr::V4(to)).map(|_| ())
}

/// Performs nonblocking receives until a datagram decodes as a packet.
/// Returns `Ok(None)` once the endpoint would block (or was interrupted), so
/// a malformed datagram can never end a drain early.
pub(crate) fn recv_datagram(endpoint: &Endpoint) -> io::Result<Option<(Packet, SocketAddr)>> {
    let mut buf = [0u8; HEADER_BYTES + MAX_DATA_BYTES];
    loop {
        match endpoint.recv_from(&mut buf) {
            Ok((len, from)) => match Packet::decode(&buf[..len]) {
                Some(packet) => return Ok(Some((packet, from))),
                None => {
                    trace!("discarding {len} undecodable bytes from {from}");
                    continue;
                }
            },
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err),
        }
    }
}
