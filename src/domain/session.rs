//! Session State Machine
//!
//! One logical pairing with a remote peer and the stream that belongs to it.
//!
//! ```text
//! ┌──────────────┐  begin_connect  ┌────────────┐  mark_connected  ┌───────────┐
//! │ Disconnected │───────────────>│ Connecting │────────────────>│ Connected │
//! └──────────────┘                 └────────────┘                  └───────────┘
//!        ▲                               │ timeout / loss                │
//!        └───────────────────────────────┴───────────────────────────────┘
//!                                  disconnect
//! ```
//!
//! The machine never reconnects on its own. Time is passed in by the caller,
//! so nothing here touches a clock.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::domain::models::PeerId;

/// Default bound on a connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Local side started a connection attempt (discovery or accepted invite).
    ConnectAttempt,
    /// Transport acknowledged the session.
    Acknowledged,
    /// No acknowledgment inside the connect window.
    ConnectionTimeout,
    /// Transport reported the peer gone.
    PeerLost,
    /// Transport reported the session as not connected.
    TransportClosed,
    /// Local teardown.
    Teardown,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransitionReason::ConnectAttempt => "connect attempt",
            TransitionReason::Acknowledged => "acknowledged",
            TransitionReason::ConnectionTimeout => "connection timeout",
            TransitionReason::PeerLost => "peer lost",
            TransitionReason::TransportClosed => "transport closed",
            TransitionReason::Teardown => "teardown",
        };
        f.write_str(text)
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTransition {
    pub peer: PeerId,
    pub from: SessionState,
    pub to: SessionState,
    pub reason: TransitionReason,
}

impl fmt::Display for SessionTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} ({})",
            self.peer, self.from, self.to, self.reason
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid operation '{operation}' in state {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
    #[error("a stream is already attached to this session")]
    StreamAlreadyOpen,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on Connecting before reverting to Disconnected.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A peer pairing, generic over the stream handle it owns.
///
/// Invariant: `stream` is `Some` only while `state == Connected`.
#[derive(Debug)]
pub struct Session<S> {
    peer: PeerId,
    state: SessionState,
    config: SessionConfig,
    connect_deadline: Option<Instant>,
    stream: Option<S>,
}

impl<S> Session<S> {
    pub fn new(peer: PeerId, config: SessionConfig) -> Self {
        Self {
            peer,
            state: SessionState::Disconnected,
            config,
            connect_deadline: None,
            stream: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Disconnected -> Connecting. Arms the connect deadline.
    pub fn begin_connect(&mut self, now: Instant) -> Result<SessionTransition, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "begin_connect",
            });
        }

        self.connect_deadline = now.checked_add(self.config.connect_timeout);
        if self.connect_deadline.is_none() {
            tracing::warn!(
                "Connect timeout {:?} for {} is out of range, attempt will not expire",
                self.config.connect_timeout,
                self.peer
            );
        }
        Ok(self.transition(SessionState::Connecting, TransitionReason::ConnectAttempt))
    }

    /// Connecting -> Connected, on transport acknowledgment.
    pub fn mark_connected(&mut self, now: Instant) -> Result<SessionTransition, SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "mark_connected",
            });
        }

        // An acknowledgment racing the deadline loses.
        if let Some(elapsed) = self.check_timeout(now) {
            tracing::debug!(
                "Acknowledgment from {} arrived {:?} into attempt, too late",
                self.peer,
                elapsed
            );
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "mark_connected",
            });
        }

        self.connect_deadline = None;
        Ok(self.transition(SessionState::Connected, TransitionReason::Acknowledged))
    }

    /// Any state -> Disconnected. Drops the stream handle immediately.
    ///
    /// Returns `None` when already disconnected.
    pub fn disconnect(&mut self, reason: TransitionReason) -> Option<SessionTransition> {
        self.stream = None;
        self.connect_deadline = None;
        if self.state == SessionState::Disconnected {
            return None;
        }
        Some(self.transition(SessionState::Disconnected, reason))
    }

    /// Elapsed time since the attempt started, if the connect window has passed.
    pub fn check_timeout(&self, now: Instant) -> Option<Duration> {
        if self.state != SessionState::Connecting {
            return None;
        }
        let deadline = self.connect_deadline?;
        if now > deadline {
            let started = deadline - self.config.connect_timeout;
            Some(now.duration_since(started))
        } else {
            None
        }
    }

    /// Revert a stale Connecting attempt to Disconnected. No retry follows.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<SessionTransition> {
        let elapsed = self.check_timeout(now)?;
        tracing::warn!("Connection attempt to {} timed out after {:?}", self.peer, elapsed);
        self.disconnect(TransitionReason::ConnectionTimeout)
    }

    /// Record the stream for this session. Only legal while Connected.
    pub fn attach_stream(&mut self, stream: S) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "attach_stream",
            });
        }
        if self.stream.is_some() {
            return Err(SessionError::StreamAlreadyOpen);
        }
        self.stream = Some(stream);
        Ok(())
    }

    /// The stream, guarded by the Connected state.
    pub fn stream_mut(&mut self) -> Option<&mut S> {
        if self.state != SessionState::Connected {
            return None;
        }
        self.stream.as_mut()
    }

    fn transition(&mut self, to: SessionState, reason: TransitionReason) -> SessionTransition {
        let from = self.state;
        self.state = to;
        tracing::debug!("Session {}: {} -> {} ({})", self.peer, from, to, reason);
        SessionTransition {
            peer: self.peer.clone(),
            from,
            to,
            reason,
        }
    }
}
