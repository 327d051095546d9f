//! Core protocol types for dronelink's wire format.
//!
//! Every datagram exchanged with the vehicle is a [`Packet`]: one header
//! byte that carries the routing address, a variable-length payload, and
//! (on the wire only) a checksum byte. This module defines the address
//! types and the packet itself; [`crate::codec`] turns them into bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// The subsystem a packet belongs to (0–15).
///
/// Ports are pure routing: there is no ordering relation between packets
/// on different ports. The well-known values below are the subsystems the
/// vehicle firmware exposes; anything else in range is still a valid port.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Port(u8);

impl Port {
    /// Highest valid port number.
    pub const MAX: u8 = 15;

    /// Text console output from the vehicle.
    pub const CONSOLE: Port = Port(0);
    /// Parameter table and values.
    pub const PARAM: Port = Port(2);
    /// Attitude/thrust setpoints.
    pub const COMMANDER: Port = Port(3);
    /// Memory subsystem (EEPROM, decks, trajectories).
    pub const MEMORY: Port = Port(4);
    /// Log table and log blocks.
    pub const LOGGING: Port = Port(5);
    /// External position / localization.
    pub const LOCALIZATION: Port = Port(6);
    /// Generic setpoints (high level commander and friends).
    pub const GENERIC_SETPOINT: Port = Port(7);
    /// Platform information queries.
    pub const PLATFORM: Port = Port(13);
    /// Link control (echo, source, sink).
    pub const LINK_CONTROL: Port = Port(15);

    /// Creates a port, rejecting values above [`Self::MAX`].
    pub fn new(port: u8) -> Result<Self, ProtocolError> {
        if port > Self::MAX {
            return Err(ProtocolError::InvalidPort(port));
        }
        Ok(Self(port))
    }

    /// Returns the raw port number.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Port {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Port> for u8 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// The sub-stream within a port (0–3).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    /// Highest valid channel number.
    pub const MAX: u8 = 3;

    /// Creates a channel, rejecting values above [`Self::MAX`].
    pub fn new(channel: u8) -> Result<Self, ProtocolError> {
        if channel > Self::MAX {
            return Err(ProtocolError::InvalidChannel(channel));
        }
        Ok(Self(channel))
    }

    /// Returns the raw channel number.
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The first byte of every packet.
///
/// ```text
///   7   6   5   4   3   2   1   0
/// +---+---+---+---+---+---+---+---+
/// |     port      | reserved | ch |
/// +---+---+---+---+---+---+---+---+
/// ```
///
/// The two reserved bits are carried verbatim: a header built from a raw
/// byte gives back the same byte, whatever those bits hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(u8);

impl Header {
    const PORT_SHIFT: u8 = 4;
    const RESERVED_SHIFT: u8 = 2;
    const CHANNEL_MASK: u8 = 0b0000_0011;
    const RESERVED_MASK: u8 = 0b0000_1100;

    /// Builds a header from a port and channel, reserved bits cleared.
    pub const fn new(port: Port, channel: Channel) -> Self {
        Self((port.0 << Self::PORT_SHIFT) | channel.0)
    }

    /// Wraps a raw header byte. Never fails: every byte is a valid header.
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Returns the raw byte as it appears on the wire.
    pub const fn byte(self) -> u8 {
        self.0
    }

    pub const fn port(self) -> Port {
        Port(self.0 >> Self::PORT_SHIFT)
    }

    pub const fn channel(self) -> Channel {
        Channel(self.0 & Self::CHANNEL_MASK)
    }

    /// The two reserved bits (3–2), shifted down to 0–3.
    pub const fn reserved(self) -> u8 {
        (self.0 & Self::RESERVED_MASK) >> Self::RESERVED_SHIFT
    }

    /// Returns a copy with the reserved bits replaced by the low two bits
    /// of `bits`.
    pub const fn with_reserved(self, bits: u8) -> Self {
        Self((self.0 & !Self::RESERVED_MASK) | ((bits & 0b11) << Self::RESERVED_SHIFT))
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}({}/{})", self.0, self.port(), self.channel())
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A framed packet: header plus payload.
///
/// Packets are immutable once built. The checksum is not stored, it is
/// derived from the header and payload when the packet is encoded, and
/// verified when bytes are decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Packet {
    header: Header,
    payload: Vec<u8>,
}

impl Packet {
    /// Creates a packet from a header and payload.
    pub fn new(header: Header, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Creates a packet addressed to `port`/`channel` with reserved bits
    /// cleared.
    pub fn with_address(port: Port, channel: Channel, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Header::new(port, channel), payload)
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn port(&self) -> Port {
        self.header.port()
    }

    pub fn channel(&self) -> Channel {
        self.header.channel()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The checksum this packet carries on the wire.
    pub fn checksum(&self) -> u8 {
        checksum(self.header.byte(), &self.payload)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} bytes]", self.header, self.payload.len())
    }
}

/// `(header + sum(payload)) mod 256`.
pub fn checksum(header: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(header, |acc, byte| acc.wrapping_add(*byte))
}

// ---------------------------------------------------------------------------
// Setpoint
// ---------------------------------------------------------------------------

/// An attitude/thrust command for the commander port.
///
/// Payload layout, little-endian: `roll: f32, pitch: f32, yaw: f32,
/// thrust: u16` (14 bytes), sent on [`Port::COMMANDER`] channel 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Setpoint {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub thrust: u16,
}

impl Setpoint {
    const PAYLOAD_LEN: usize = 14;

    /// The neutral command: no attitude, no thrust. Sent before a link is
    /// closed so the vehicle does not keep acting on the last setpoint.
    pub const fn zero() -> Self {
        Self {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            thrust: 0,
        }
    }

    /// Encodes the setpoint as a commander packet.
    pub fn to_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(Self::PAYLOAD_LEN);
        payload.extend_from_slice(&self.roll.to_le_bytes());
        payload.extend_from_slice(&self.pitch.to_le_bytes());
        payload.extend_from_slice(&self.yaw.to_le_bytes());
        payload.extend_from_slice(&self.thrust.to_le_bytes());
        Packet::with_address(Port::COMMANDER, Channel(0), payload)
    }

    /// Parses a setpoint back out of a commander packet.
    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.port() != Port::COMMANDER || packet.channel().value() != 0 {
            return Err(ProtocolError::InvalidMessage(format!(
                "setpoint must be on {}/ch-0, got {}",
                Port::COMMANDER,
                packet.header()
            )));
        }
        let p = packet.payload();
        if p.len() != Self::PAYLOAD_LEN {
            return Err(ProtocolError::InvalidMessage(format!(
                "setpoint payload must be {} bytes, got {}",
                Self::PAYLOAD_LEN,
                p.len()
            )));
        }
        let f32_at = |i: usize| f32::from_le_bytes([p[i], p[i + 1], p[i + 2], p[i + 3]]);
        Ok(Self {
            roll: f32_at(0),
            pitch: f32_at(4),
            yaw: f32_at(8),
            thrust: u16::from_le_bytes([p[12], p[13]]),
        })
    }
}
