//! Error types for multi-node coordination
//!
//! Errors fall into three families:
//!
//! - Configuration errors (unknown communicator kind, missing capability,
//!   invalid binding ranks) — raised at construction/registration time.
//! - Transport and protocol errors (host discovery failure, shape mismatch
//!   between paired collectives) — fatal, surfaced immediately.
//! - `PayloadTooLarge` — the one condition a caller can recover from, by
//!   splitting the payload into `num_split()` partitions and retrying.
//!
//! No error is retried inside this crate; everything propagates to the caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction or registration input. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The underlying transport failed (peer disconnected, discovery failed).
    #[error("transport error: {0}")]
    Transport(String),

    /// Peers disagreed about the wire contract (shape, dtype, framing).
    /// Indicates a topology or registration bug, not a transient fault.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single message exceeded the transport's size limit. The caller may
    /// retry with the payload split into [`Error::num_split`] partitions.
    #[error("payload of {size} bytes exceeds the single-message limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl Error {
    /// Minimum number of equal partitions that would each fit within the
    /// limit, for [`Error::PayloadTooLarge`]. `None` for other variants.
    pub fn num_split(&self) -> Option<usize> {
        match self {
            Error::PayloadTooLarge { size, limit } => Some(size.div_ceil(*limit)),
            _ => None,
        }
    }
}
