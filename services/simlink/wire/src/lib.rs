//! Fixed-size packet definitions shared by both ends of a simlink session.
//!
//! The transport core moves [`Packet`] values as opaque byte arrays. The
//! layout the simulation actually exchanges, a control word followed by
//! four-state logic words, lives in [`SimPacket`] and is encoded/decoded here
//! so the transport never has to know about it.
//!
//! ## Layout
//!
//! ```text
//! +----------------------+------------------------------+
//! | u32 control (LE)     | two-state control word       |
//! +----------------------+------------------------------+
//! | u32 aval | u32 bval  | logic word 0 (LE)            |
//! +----------------------+------------------------------+
//! | ...                  | DATA_WORDS logic words       |
//! +----------------------+------------------------------+
//! ```
//!
//! Both peers must be built with the same [`DATA_WORDS`]; the length is never
//! negotiated on the wire.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod packet;

pub use error::WireError;
pub use packet::{LogicWord, Packet, SimPacket, DATA_WORDS, LOGIC_WORD_SIZE, PACKET_LEN};
