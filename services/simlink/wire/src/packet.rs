//! Fixed-size packet and the simulation record layout.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Number of logic words carried after the control word
pub const DATA_WORDS: usize = 4;

/// Encoded size of one logic word (aval + bval)
pub const LOGIC_WORD_SIZE: usize = 8;

/// Size of every packet exchanged by the transport, in bytes
pub const PACKET_LEN: usize = 4 + DATA_WORDS * LOGIC_WORD_SIZE;

/// One packet's worth of bytes.
///
/// The transport never looks inside; it only relies on the length.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet([u8; PACKET_LEN]);

impl Packet {
    /// Create an all-zero packet, typically used as a receive buffer
    pub const fn zeroed() -> Self {
        Self([0u8; PACKET_LEN])
    }

    /// Wrap an existing byte array
    pub const fn from_bytes(bytes: [u8; PACKET_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy a slice that must be exactly [`PACKET_LEN`] bytes long
    pub fn from_slice(slice: &[u8]) -> Result<Self, WireError> {
        let bytes: [u8; PACKET_LEN] = slice.try_into().map_err(|_| WireError::Length {
            expected: PACKET_LEN,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Packet length (always [`PACKET_LEN`])
    pub const fn len(&self) -> usize {
        PACKET_LEN
    }

    /// Always false; present for clippy's `len_without_is_empty`
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Mutably borrow the raw bytes
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Consume the packet, returning the byte array
    pub fn into_bytes(self) -> [u8; PACKET_LEN] {
        self.0
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet(")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Packet {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Four-state logic value: each bit is 0/1 when `bval` is clear, Z/X otherwise
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicWord {
    /// Value plane
    pub aval: u32,
    /// Unknown/high-impedance plane
    pub bval: u32,
}

impl LogicWord {
    /// A fully known two-state word
    pub const fn from_bits(bits: u32) -> Self {
        Self { aval: bits, bval: 0 }
    }

    /// True when no bit is X or Z
    pub const fn is_known(&self) -> bool {
        self.bval == 0
    }

    /// Two-state value, failing if any bit is X or Z
    pub fn to_bits(&self) -> Result<u32, WireError> {
        if self.is_known() {
            Ok(self.aval)
        } else {
            Err(WireError::Unknown(self.bval))
        }
    }
}

/// Record layout exchanged by the simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimPacket {
    /// Two-state control word
    pub control: u32,
    /// Payload words
    pub data: [LogicWord; DATA_WORDS],
}

impl SimPacket {
    /// Create a record with all data words known
    pub fn new(control: u32, data: [u32; DATA_WORDS]) -> Self {
        Self {
            control,
            data: data.map(LogicWord::from_bits),
        }
    }

    /// Encode into the fixed-size packet (little-endian, matching x86 peers)
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::with_capacity(PACKET_LEN);
        buf.put_u32_le(self.control);
        for word in &self.data {
            buf.put_u32_le(word.aval);
            buf.put_u32_le(word.bval);
        }
        let mut packet = Packet::zeroed();
        packet.as_mut_bytes().copy_from_slice(&buf);
        packet
    }

    /// Decode from a packet. Cannot fail: every bit pattern is a valid record.
    pub fn decode(packet: &Packet) -> Self {
        let mut buf = packet.as_bytes();
        let control = buf.get_u32_le();
        let mut data = [LogicWord::default(); DATA_WORDS];
        for word in data.iter_mut() {
            word.aval = buf.get_u32_le();
            word.bval = buf.get_u32_le();
        }
        Self { control, data }
    }
}

impl From<SimPacket> for Packet {
    fn from(record: SimPacket) -> Self {
        record.encode()
    }
}

impl From<&Packet> for SimPacket {
    fn from(packet: &Packet) -> Self {
        SimPacket::decode(packet)
    }
}
