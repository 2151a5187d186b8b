//! Browser (Source) Driver
//!
//! Discovers a display peer, connects, and on every tick sends the current
//! calibrated orientation if the stream can take it. Samples that do not fit
//! are dropped: freshness wins over completeness.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::domain::calibration::Calibration;
use crate::domain::models::{AppEvent, MessageSeverity, Orientation, PeerId, Role};
use crate::domain::session::{Session, SessionConfig, SessionState, TransitionReason};
use crate::infrastructure::peer::notifier::Notifier;
use crate::infrastructure::peer::protocol::{self, PACKET_LEN, STREAM_NAME};
use crate::infrastructure::peer::{LinkState, OutputStream, Transport, TransportEvent};

/// Everything the source loop reacts to.
#[derive(Debug)]
pub enum BrowserEvent {
    Transport(TransportEvent),
    /// Latest raw reading from the sensor.
    SensorReading(Orientation),
    /// Frame clock.
    Tick,
}

impl From<TransportEvent> for BrowserEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

/// Counters for one driver lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub sent: u64,
    pub dropped: u64,
    pub open_failures: u64,
}

/// The peer being streamed to, with its session-scoped calibration.
struct StreamTarget<O> {
    session: Session<O>,
    calibration: Calibration,
}

pub struct BrowserDriver<T: Transport> {
    transport: T,
    config: SessionConfig,
    target: Option<StreamTarget<T::Output>>,
    latest_reading: Option<Orientation>,
    stats: StreamStats,
    notifier: Notifier,
}

impl<T: Transport> BrowserDriver<T> {
    pub fn new(
        transport: T,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            target: None,
            latest_reading: None,
            stats: StreamStats::default(),
            notifier: Notifier::new(Role::Browser, event_sender),
        }
    }

    /// Single entry point for every event. Callers serialize calls.
    pub fn handle(&mut self, event: BrowserEvent, now: Instant) {
        match event {
            BrowserEvent::Tick => self.on_tick(now),
            BrowserEvent::SensorReading(raw) => self.latest_reading = Some(raw),
            BrowserEvent::Transport(event) => match event {
                TransportEvent::PeerFound(peer) => self.on_peer_discovered(peer, now),
                TransportEvent::PeerLost(peer) => self.on_peer_lost(&peer),
                TransportEvent::SessionStateChanged { peer, state } => {
                    self.on_link_state(&peer, state, now)
                }
                TransportEvent::InvitationReceived(peer) => {
                    debug!("Source does not accept invitations, declining {}", peer);
                    if let Err(e) = self.transport.respond_to_invitation(&peer, false) {
                        debug!("Failed to decline invitation from {}: {}", peer, e);
                    }
                }
                other => trace!("Source ignoring {:?}", other),
            },
        }
    }

    /// Record `peer` as the target, start connecting, and arm the send loop.
    pub fn on_peer_discovered(&mut self, peer: PeerId, now: Instant) {
        if let Some(target) = &self.target {
            if target.session.state() != SessionState::Disconnected {
                debug!(
                    "Already paired with {}, ignoring {}",
                    target.session.peer(),
                    peer
                );
                return;
            }
        }

        info!("Found peer: {}", peer);
        self.notifier
            .log(format!("Found Peer! {}", peer), MessageSeverity::Info);

        let mut session = Session::new(peer.clone(), self.config.clone());
        match session.begin_connect(now) {
            Ok(transition) => self.notifier.transition(transition),
            Err(e) => {
                warn!("Could not start connecting to {}: {}", peer, e);
                return;
            }
        }

        if let Err(e) = self.transport.invite(&peer, self.config.connect_timeout) {
            warn!("Failed to invite {}: {}", peer, e);
            if let Some(transition) = session.disconnect(TransitionReason::TransportClosed) {
                self.notifier.transition(transition);
            }
        }

        self.target = Some(StreamTarget {
            session,
            calibration: Calibration::new(),
        });
    }

    /// Open the outbound stream if the session allows it and none exists yet.
    ///
    /// Returns whether a stream is open afterwards. Failures are retried on
    /// the next tick.
    pub fn ensure_stream_open(&mut self) -> bool {
        let Some(target) = self.target.as_mut() else {
            return false;
        };
        if target.session.has_stream() {
            return true;
        }
        if !target.session.is_connected() {
            trace!("Session with {} not connected yet", target.session.peer());
            return false;
        }

        match self
            .transport
            .start_stream(STREAM_NAME, target.session.peer())
        {
            Ok(stream) => match target.session.attach_stream(stream) {
                Ok(()) => {
                    info!("Opened stream '{}' to {}", STREAM_NAME, target.session.peer());
                    self.notifier.log(
                        format!("Streaming to {}", target.session.peer()),
                        MessageSeverity::Success,
                    );
                    true
                }
                Err(e) => {
                    warn!("Could not attach stream: {}", e);
                    false
                }
            },
            Err(e) => {
                self.stats.open_failures += 1;
                warn!("Unable to start stream to {}: {}", target.session.peer(), e);
                self.notifier.log(
                    format!("Unable to start stream: {}", e),
                    MessageSeverity::Warning,
                );
                false
            }
        }
    }

    /// One frame: calibrate the latest reading and write it if there is room.
    pub fn on_tick(&mut self, now: Instant) {
        if let Some(target) = self.target.as_mut() {
            if let Some(transition) = target.session.poll_timeout(now) {
                self.notifier.log(
                    format!("Connection to {} timed out", transition.peer),
                    MessageSeverity::Warning,
                );
                self.notifier.transition(transition);
            }
        }

        if !self.ensure_stream_open() {
            return;
        }

        let Some(target) = self.target.as_mut() else {
            return;
        };
        let Some(stream) = target.session.stream_mut() else {
            trace!("No stream");
            return;
        };
        let Some(raw) = self.latest_reading else {
            trace!("No sensor reading yet");
            return;
        };

        let calibrated = target.calibration.observe(raw);

        if !stream.has_space_available() {
            self.stats.dropped += 1;
            debug!("No space available, dropping sample");
            return;
        }

        let packet = protocol::encode(&calibrated);
        match stream.write(&packet) {
            Ok(written) if written == PACKET_LEN => {
                self.stats.sent += 1;
                self.notifier.sent(calibrated);
            }
            Ok(written) => {
                self.stats.dropped += 1;
                warn!("Short write: {} of {} bytes", written, PACKET_LEN);
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!("Stream write failed: {}", e);
            }
        }
    }

    /// Forget the target. A later discovery starts calibration over.
    pub fn on_peer_lost(&mut self, peer: &PeerId) {
        match &self.target {
            Some(target) if target.session.peer() == peer => {}
            _ => {
                debug!("Lost unrelated peer {}", peer);
                return;
            }
        }

        if let Some(mut target) = self.target.take() {
            if let Some(transition) = target.session.disconnect(TransitionReason::PeerLost) {
                self.notifier.transition(transition);
            }
        }
        info!(
            "Lost peer {} ({} sent, {} dropped)",
            peer, self.stats.sent, self.stats.dropped
        );
        self.notifier.log("Lost Peer!", MessageSeverity::Warning);
    }

    /// Local shutdown of whatever session is active.
    pub fn teardown(&mut self) {
        if let Some(mut target) = self.target.take() {
            if let Some(transition) = target.session.disconnect(TransitionReason::Teardown) {
                self.notifier.transition(transition);
            }
        }
        info!(
            "Source stopped ({} sent, {} dropped, {} stream open failures)",
            self.stats.sent, self.stats.dropped, self.stats.open_failures
        );
    }

    fn on_link_state(&mut self, peer: &PeerId, state: LinkState, now: Instant) {
        let Some(target) = self.target.as_mut() else {
            return;
        };
        if target.session.peer() != peer {
            return;
        }

        match state {
            LinkState::Connecting => trace!("{} is connecting", peer),
            LinkState::Connected => match target.session.mark_connected(now) {
                Ok(transition) => self.notifier.transition(transition),
                Err(e) => warn!("Ignoring acknowledgment from {}: {}", peer, e),
            },
            LinkState::NotConnected => {
                let closed = target.session.disconnect(TransitionReason::TransportClosed);
                if let Some(transition) = closed {
                    self.notifier.transition(transition);
                }
            }
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.target.as_ref().map(|t| t.session.state())
    }

    pub fn target_peer(&self) -> Option<&PeerId> {
        self.target.as_ref().map(|t| t.session.peer())
    }

    pub fn has_stream(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.session.has_stream())
    }

    pub fn calibration_reference(&self) -> Option<Orientation> {
        self.target.as_ref().and_then(|t| t.calibration.reference())
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
