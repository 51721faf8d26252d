//! Error types for TaalIO
//!
//! Only the startup path surfaces errors to the caller: socket or listener
//! creation, a broadcast bind refused with a permission or address conflict,
//! and a malformed configuration file all abort the daemon with exit code 1.
//! Everything that can go wrong once the run loop is started is resolved
//! locally to a state transition (drop a child, fall back to `Disconnected`,
//! skip a tick's transfer) and never propagates out of the loop.

use thiserror::Error;

use crate::protocol::packet::FrameError;

/// Errors that can occur in TaalIO
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Address error: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
