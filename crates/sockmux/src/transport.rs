//! Transport seam between the multiplexer and the socket.
//!
//! A transport is a reliable duplex message channel: it owns the physical
//! connection, its retry policy and framing, and surfaces inbound frames and
//! open/close transitions as [`TransportEvent`]s over an mpsc channel.

use tokio::sync::mpsc;

use crate::wire::Frame;
use crate::Error;

/// Connection state, as tracked from open/close transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection is established
    Open,
    /// The connection is down
    Closed,
}

/// Connection lifecycle and inbound traffic, as seen by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection (re)opened
    Open,
    /// The connection dropped
    Close,
    /// An inbound frame arrived
    Frame(Frame),
}

/// Receiving end of a transport's event stream.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Outbound half of a reliable duplex message channel.
///
/// Sends are fire-and-forget: no acknowledgement is awaited, and a frame
/// submitted while disconnected may be queued or dropped at the
/// implementation's discretion.
pub trait Transport: Send + Sync + 'static {
    /// Write one frame to the connection.
    fn send(&self, frame: Frame) -> Result<(), Error>;
}
