//! Wire layer error types.

use thiserror::Error;

/// Packet encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer does not hold exactly one packet
    #[error("packet length mismatch: expected {expected} bytes, got {actual}")]
    Length {
        /// Fixed packet length
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Logic word carries X/Z bits and has no two-state value
    #[error("logic word has unknown bits (bval={0:#010x})")]
    Unknown(u32),
}
