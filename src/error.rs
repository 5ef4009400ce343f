//! Error types for Bindu
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Transient Errors (Count and Continue)
//!
//! - **`Busy`**: A resource is held or a conversion has not finished yet.
//!   Callers poll or retry on the next loop iteration.
//! - **`Timeout`**: A bounded wait expired. This is a normal control-flow
//!   signal on the receive path, not a failure.
//! - **`LinkDown`**: The data path is unavailable. Sends are dropped and
//!   counted; the network task re-enters link recovery.
//! - **`NetError`** / **`NoMemory`**: The underlying stack refused a send or
//!   a pool/queue is exhausted. Counted; the affected packet is dropped.
//!
//! ## Protocol Errors (Log and Drop)
//!
//! - **`InvalidMessage`**: A received datagram violated framing rules (short,
//!   bad magic, truncated payload). Logged at warning level and discarded;
//!   the socket remains usable.
//!
//! ## Caller Errors (Report, Don't Retry)
//!
//! - **`InvalidArgument`**: An out-of-range parameter (threshold, batch size,
//!   channel, oversized payload). Reported to the caller; configuration
//!   commands carrying such values are silently ignored on the wire.
//! - **`BufferTooSmall`**: The output buffer cannot hold the packet. The
//!   caller resizes and retries.
//!
//! ## Fatal Errors (Exit)
//!
//! - **`Config`** and bring-up **`Io`** failures propagate to `main`, which
//!   logs the diagnostic and exits non-zero.

use thiserror::Error;

/// Errors that can occur in Bindu
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Resource busy")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Out of buffers: {0}")]
    NoMemory(&'static str),

    #[error("Network error: {0}")]
    NetError(String),

    #[error("Link down")]
    LinkDown,
}

pub type Result<T> = std::result::Result<T, Error>;
