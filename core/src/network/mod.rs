//! Network layer between the engine and the raw `Transport`
//!
//! - `SendQueue`: the single outbound sender (time ordered, bandwidth limited)
//! - `PacketBatch`: one request/response round over many peers
//! - `PacketDispatcher`: inbound loop, protocol version checks, routing

pub mod batch;
pub mod dispatcher;
pub mod send_queue;

pub use batch::PacketBatch;
pub use dispatcher::{PacketDispatcher, PacketListener};
pub use send_queue::{SendHandle, SendQueue};

use crate::packet::PacketError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendQueueError {
    #[error("Packet encoding failed: {0}")]
    Packet(#[from] PacketError),

    #[error("Transmission failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Send queue stopped before the packet was sent")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, SendQueueError>;
