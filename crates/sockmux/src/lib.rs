//! Multiplexes many logical publish/subscribe topics over one long-lived
//! socket connection.
//!
//! Consumers subscribe to a topic, optionally narrowed by a [`wire::Filter`],
//! and have a callback invoked for every matching inbound frame. Duplicate
//! interest in the same (topic, filter) pair is coalesced into a single
//! wire-level subscription, late joiners are replayed the cached last value,
//! UNSUBSCRIBE is debounced by a grace window to absorb drop/re-add churn,
//! and wire subscriptions rebuild themselves after the transport reconnects.
//!
//! The socket itself lives behind the [`transport::Transport`] seam; the
//! `sockmux-ws` crate provides the WebSocket implementation.

mod error;
pub mod mux;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wire;

pub use error::Error;
pub use mux::{Multiplexer, Subscription};
