//! Wire protocol for dronelink.
//!
//! This crate defines what travels between the ground station and the
//! vehicle:
//!
//! - **Types** ([`Packet`], [`Header`], [`Port`], [`Channel`],
//!   [`Setpoint`]): the addressed frames and the one message the link
//!   layer itself needs to send.
//! - **Codec** ([`Codec`] trait, [`ChecksumCodec`]): how packets become
//!   bytes and back.
//! - **Errors** ([`ProtocolError`]): what can go wrong while framing.
//!
//! # Architecture
//!
//! The protocol layer sits between the link driver (raw bytes) and the
//! session (lifecycle, dispatch, retries). It knows nothing about links or
//! timers.
//!
//! ```text
//! Link driver (bytes) → Protocol (Packet) → Session (dispatch, retries)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{ChecksumCodec, Codec};
pub use error::ProtocolError;
pub use types::{Channel, Header, Packet, Port, Setpoint, checksum};
