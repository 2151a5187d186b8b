//! Peer Module
//!
//! Pairs a source peer with a display peer and streams orientation between
//! them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        PeerService                       │
//! │   (one tokio task per role: ticks, sensor, transport)    │
//! └──────────────┬─────────────────────────────┬─────────────┘
//!                │                             │
//!                ▼                             ▼
//!        ┌───────────────┐            ┌──────────────────┐
//!        │ BrowserDriver │            │ AdvertiserDriver │
//!        │ - discovery   │            │ - accept invite  │
//!        │ - calibrate   │            │ - read stream    │
//!        │ - send ticks  │            │ - decode, render │
//!        └───────┬───────┘            └────────┬─────────┘
//!                │   Transport (substrate)     │
//!                └──────────────┬──────────────┘
//!                               ▼
//!                      ┌──────────────────┐
//!                      │ Protocol / codec │
//!                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service and stream labels, 12-byte orientation codec
//! - [`browser`] - Source-side driver
//! - [`advertiser`] - Display-side driver
//! - [`loopback`] - In-process transport substrate
//! - [`notifier`] - Status events for the presentation layer
//! - [`service`] - Async loops binding drivers to a substrate

pub mod advertiser;
pub mod browser;
pub mod loopback;
pub mod notifier;
pub mod protocol;
pub mod service;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::domain::models::PeerId;

pub use advertiser::AdvertiserDriver;
pub use browser::{BrowserDriver, BrowserEvent};

/// Session state as reported by the transport substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    NotConnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {0} is not reachable")]
    PeerUnavailable(PeerId),
    #[error("No connected session with {0}")]
    NotConnected(PeerId),
    #[error("Stream is closed")]
    StreamClosed,
}

/// Outbound half of a byte stream. Never blocks.
pub trait OutputStream: Send {
    /// Whether a write would currently be accepted.
    fn has_space_available(&self) -> bool;

    /// Write as many bytes as fit; returns the number accepted.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;
}

/// Inbound half of a byte stream. Never blocks.
pub trait InputStream: Send {
    /// Bytes ready to be read right now.
    fn bytes_available(&self) -> usize;

    /// Read up to `buf.len()` bytes; returns the number read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Connect/accept and stream-open primitives of the discovery substrate.
///
/// Notifications flow the other way as [`TransportEvent`]s.
pub trait Transport: Send {
    type Output: OutputStream;

    /// Ask `peer` to join a session. The substrate may give up after `timeout`.
    fn invite(&mut self, peer: &PeerId, timeout: Duration) -> Result<(), TransportError>;

    /// Answer an invitation received from `peer`.
    fn respond_to_invitation(&mut self, peer: &PeerId, accept: bool)
        -> Result<(), TransportError>;

    /// Open a named outbound stream to a connected peer.
    fn start_stream(&mut self, name: &str, peer: &PeerId) -> Result<Self::Output, TransportError>;
}

/// Notifications delivered by the substrate, in order, on one control context.
pub enum TransportEvent {
    PeerFound(PeerId),
    PeerLost(PeerId),
    InvitationReceived(PeerId),
    SessionStateChanged {
        peer: PeerId,
        state: LinkState,
    },
    StreamReceived {
        peer: PeerId,
        name: String,
        stream: Box<dyn InputStream>,
    },
    BytesAvailable(PeerId),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerFound(peer) => f.debug_tuple("PeerFound").field(peer).finish(),
            Self::PeerLost(peer) => f.debug_tuple("PeerLost").field(peer).finish(),
            Self::InvitationReceived(peer) => {
                f.debug_tuple("InvitationReceived").field(peer).finish()
            }
            Self::SessionStateChanged { peer, state } => f
                .debug_struct("SessionStateChanged")
                .field("peer", peer)
                .field("state", state)
                .finish(),
            Self::StreamReceived { peer, name, .. } => f
                .debug_struct("StreamReceived")
                .field("peer", peer)
                .field("name", name)
                .finish_non_exhaustive(),
            Self::BytesAvailable(peer) => f.debug_tuple("BytesAvailable").field(peer).finish(),
        }
    }
}
