//! Advertiser (Display) Driver
//!
//! Accepts the source's invitation, takes the orientation stream it opens,
//! and decodes whole packets out of it for the rendering sink.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::domain::models::{AppEvent, MessageSeverity, PeerId, Role};
use crate::domain::session::{Session, SessionConfig, SessionState, TransitionReason};
use crate::infrastructure::peer::notifier::Notifier;
use crate::infrastructure::peer::protocol::{self, PACKET_LEN, STREAM_NAME};
use crate::infrastructure::peer::{
    InputStream, LinkState, Transport, TransportError, TransportEvent,
};

pub struct AdvertiserDriver<T: Transport> {
    transport: T,
    config: SessionConfig,
    session: Option<Session<Box<dyn InputStream>>>,
    decoded: u64,
    notifier: Notifier,
}

impl<T: Transport> AdvertiserDriver<T> {
    pub fn new(
        transport: T,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            session: None,
            decoded: 0,
            notifier: Notifier::new(Role::Advertiser, event_sender),
        }
    }

    /// Single entry point for substrate notifications. Callers serialize calls.
    pub fn handle(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::InvitationReceived(peer) => self.on_connection_request(peer, now),
            TransportEvent::SessionStateChanged { peer, state } => {
                self.on_link_state(&peer, state, now)
            }
            TransportEvent::StreamReceived { peer, name, stream } => {
                self.on_stream_opened(&peer, &name, stream)
            }
            TransportEvent::BytesAvailable(peer) => {
                self.on_bytes_available(&peer);
            }
            TransportEvent::PeerLost(peer) => self.on_peer_lost(&peer),
            TransportEvent::PeerFound(peer) => trace!("Display ignoring discovered peer {}", peer),
        }
    }

    /// Expire a connection attempt that never got acknowledged.
    pub fn poll(&mut self, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            if let Some(transition) = session.poll_timeout(now) {
                self.notifier.transition(transition);
            }
        }
    }

    /// Accept every invitation. A new invitation replaces the current session.
    pub fn on_connection_request(&mut self, peer: PeerId, now: Instant) {
        info!("Invitation from {}", peer);

        if let Some(mut previous) = self.session.take() {
            if let Some(transition) = previous.disconnect(TransitionReason::Teardown) {
                self.notifier.transition(transition);
            }
        }

        let mut session = Session::new(peer.clone(), self.config.clone());
        match session.begin_connect(now) {
            Ok(transition) => self.notifier.transition(transition),
            Err(e) => {
                warn!("Could not start session with {}: {}", peer, e);
                return;
            }
        }

        if let Err(e) = self.transport.respond_to_invitation(&peer, true) {
            warn!("Failed to accept invitation from {}: {}", peer, e);
            if let Some(transition) = session.disconnect(TransitionReason::TransportClosed) {
                self.notifier.transition(transition);
            }
        }

        self.session = Some(session);
    }

    /// Take the inbound stream. Only the orientation channel is accepted.
    pub fn on_stream_opened(&mut self, peer: &PeerId, name: &str, stream: Box<dyn InputStream>) {
        if name != STREAM_NAME {
            warn!("Rejecting unexpected stream '{}' from {}", name, peer);
            return;
        }

        let Some(session) = self.session.as_mut().filter(|s| s.peer() == peer) else {
            warn!("Stream from {} without a session, dropping it", peer);
            return;
        };

        match session.attach_stream(stream) {
            Ok(()) => {
                info!("Receiving stream '{}' from {}", name, peer);
                self.notifier
                    .log(format!("Receiving from {}", peer), MessageSeverity::Success);
            }
            Err(e) => {
                warn!("Dropping stream from {}: {}", peer, e);
                return;
            }
        }

        self.on_bytes_available(peer);
    }

    /// Decode every whole packet currently buffered. Returns how many.
    ///
    /// A partial packet stays in the stream until the rest arrives.
    pub fn on_bytes_available(&mut self, peer: &PeerId) -> usize {
        let Some(session) = self.session.as_mut().filter(|s| s.peer() == peer) else {
            trace!("Bytes from {} outside the active session", peer);
            return 0;
        };
        let Some(stream) = session.stream_mut() else {
            trace!("Bytes from {} without an open stream", peer);
            return 0;
        };

        let mut packet = [0u8; PACKET_LEN];
        let mut count = 0;
        let mut broken = false;
        while stream.bytes_available() >= PACKET_LEN {
            if let Err(e) = read_packet(&mut **stream, &mut packet) {
                // Part of a packet may be consumed, so the stream is no longer aligned.
                warn!("Stream read from {} failed: {}", peer, e);
                broken = true;
                break;
            }

            match protocol::decode(&packet) {
                Ok(orientation) => {
                    trace!("stream: {}", orientation);
                    self.decoded += 1;
                    count += 1;
                    self.notifier.received(orientation);
                }
                Err(e) => {
                    warn!("Discarding packet from {}: {}", peer, e);
                    break;
                }
            }
        }

        if broken {
            if let Some(transition) = session.disconnect(TransitionReason::TransportClosed) {
                self.notifier.transition(transition);
            }
            self.notifier.log(
                format!("Stream from {} broke off", peer),
                MessageSeverity::Error,
            );
        }
        count
    }

    pub fn on_peer_lost(&mut self, peer: &PeerId) {
        if !self.session.as_ref().is_some_and(|s| s.peer() == peer) {
            debug!("Lost unrelated peer {}", peer);
            return;
        }
        if let Some(mut session) = self.session.take() {
            if let Some(transition) = session.disconnect(TransitionReason::PeerLost) {
                self.notifier.transition(transition);
            }
        }
        info!("Lost peer {} after {} packets", peer, self.decoded);
        self.notifier.log("Lost Peer!", MessageSeverity::Warning);
    }

    /// Local shutdown of whatever session is active.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(transition) = session.disconnect(TransitionReason::Teardown) {
                self.notifier.transition(transition);
            }
        }
        info!("Display stopped ({} packets decoded)", self.decoded);
    }

    fn on_link_state(&mut self, peer: &PeerId, state: LinkState, now: Instant) {
        let Some(session) = self.session.as_mut().filter(|s| s.peer() == peer) else {
            return;
        };

        match state {
            LinkState::Connecting => trace!("{} is connecting", peer),
            LinkState::Connected => match session.mark_connected(now) {
                Ok(transition) => self.notifier.transition(transition),
                Err(e) => warn!("Ignoring acknowledgment from {}: {}", peer, e),
            },
            LinkState::NotConnected => {
                if let Some(transition) = session.disconnect(TransitionReason::TransportClosed) {
                    self.notifier.transition(transition);
                }
            }
        }
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| s.state())
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.session.as_ref().map(|s| s.peer())
    }

    pub fn has_stream(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.has_stream())
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }
}

/// Fill `packet` completely, however the stream chooses to chunk its reads.
fn read_packet(
    stream: &mut dyn InputStream,
    packet: &mut [u8; PACKET_LEN],
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < PACKET_LEN {
        match stream.read(&mut packet[filled..])? {
            0 => return Err(TransportError::StreamClosed),
            n => filled += n,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Orientation;
    use crate::infrastructure::peer::OutputStream;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct AcceptingTransport {
        accepted: Vec<PeerId>,
    }

    struct NullOutput;

    impl OutputStream for NullOutput {
        fn has_space_available(&self) -> bool {
            false
        }

        fn write(&mut self, _bytes: &[u8]) -> Result<usize, TransportError> {
            Ok(0)
        }
    }

    impl Transport for AcceptingTransport {
        type Output = NullOutput;

        fn invite(&mut self, peer: &PeerId, _timeout: Duration) -> Result<(), TransportError> {
            Err(TransportError::PeerUnavailable(peer.clone()))
        }

        fn respond_to_invitation(
            &mut self,
            peer: &PeerId,
            accept: bool,
        ) -> Result<(), TransportError> {
            assert!(accept);
            self.accepted.push(peer.clone());
            Ok(())
        }

        fn start_stream(
            &mut self,
            _name: &str,
            peer: &PeerId,
        ) -> Result<Self::Output, TransportError> {
            Err(TransportError::NotConnected(peer.clone()))
        }
    }

    /// Inbound stream whose buffer the test fills directly.
    #[derive(Clone, Default)]
    struct SharedInput(Arc<Mutex<VecDeque<u8>>>);

    impl SharedInput {
        fn push(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend(bytes);
        }
    }

    impl InputStream for SharedInput {
        fn bytes_available(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let mut buffer = self.0.lock().unwrap();
            let n = buf.len().min(buffer.len());
            for (slot, byte) in buf.iter_mut().zip(buffer.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    fn source() -> PeerId {
        PeerId::new("source")
    }

    /// Hands out at most `chunk` bytes per read.
    struct ChunkedInput {
        inner: SharedInput,
        chunk: usize,
    }

    impl InputStream for ChunkedInput {
        fn bytes_available(&self) -> usize {
            self.inner.bytes_available()
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    /// Claims a full packet but runs dry after three bytes.
    struct StallingInput {
        served: bool,
    }

    impl InputStream for StallingInput {
        fn bytes_available(&self) -> usize {
            PACKET_LEN
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            if self.served {
                return Ok(0);
            }
            self.served = true;
            let n = buf.len().min(3);
            buf[..n].fill(0);
            Ok(n)
        }
    }

    fn connected_driver() -> (
        AdvertiserDriver<AcceptingTransport>,
        mpsc::UnboundedReceiver<AppEvent>,
        SharedInput,
    ) {
        let input = SharedInput::default();
        let (driver, rx) = connected_driver_with(Box::new(input.clone()));
        (driver, rx, input)
    }

    fn connected_driver_with(
        stream: Box<dyn InputStream>,
    ) -> (
        AdvertiserDriver<AcceptingTransport>,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut driver =
            AdvertiserDriver::new(AcceptingTransport::default(), SessionConfig::default(), tx);
        let t0 = Instant::now();
        driver.handle(TransportEvent::InvitationReceived(source()), t0);
        driver.handle(
            TransportEvent::SessionStateChanged {
                peer: source(),
                state: LinkState::Connected,
            },
            t0,
        );
        driver.handle(
            TransportEvent::StreamReceived {
                peer: source(),
                name: STREAM_NAME.to_string(),
                stream,
            },
            t0,
        );
        (driver, rx)
    }

    fn remote_orientations(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<Orientation> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::RemoteOrientation(o) = event {
                out.push(o);
            }
        }
        out
    }

    #[test]
    fn test_invitation_is_accepted() {
        let (driver, _rx, _input) = connected_driver();
        assert_eq!(driver.transport.accepted, vec![source()]);
        assert_eq!(driver.session_state(), Some(SessionState::Connected));
        assert!(driver.has_stream());
    }

    #[test]
    fn test_whole_packets_are_decoded_in_order() {
        let (mut driver, mut rx, input) = connected_driver();
        let a = Orientation::new(0.0, 0.0, 0.0);
        let b = Orientation::new(-0.05, -0.05, -0.05);
        input.push(&protocol::encode(&a));
        input.push(&protocol::encode(&b));

        assert_eq!(driver.on_bytes_available(&source()), 2);
        assert_eq!(remote_orientations(&mut rx), vec![a, b]);
        assert_eq!(driver.decoded(), 2);
    }

    #[test]
    fn test_partial_packet_is_deferred() {
        let (mut driver, mut rx, input) = connected_driver();
        let o = Orientation::new(1.5, -2.5, 3.5);
        let packet = protocol::encode(&o);

        input.push(&packet[..7]);
        driver.handle(TransportEvent::BytesAvailable(source()), Instant::now());
        assert!(remote_orientations(&mut rx).is_empty());
        assert_eq!(input.bytes_available(), 7);

        input.push(&packet[7..]);
        driver.handle(TransportEvent::BytesAvailable(source()), Instant::now());
        assert_eq!(remote_orientations(&mut rx), vec![o]);
        assert_eq!(input.bytes_available(), 0);
    }

    #[test]
    fn test_trailing_bytes_wait_for_next_notification() {
        let (mut driver, mut rx, input) = connected_driver();
        let o = Orientation::new(0.25, 0.5, 0.75);
        let packet = protocol::encode(&o);
        input.push(&packet);
        input.push(&packet[..4]);

        assert_eq!(driver.on_bytes_available(&source()), 1);
        assert_eq!(remote_orientations(&mut rx), vec![o]);
        assert_eq!(input.bytes_available(), 4);
    }

    #[test]
    fn test_chunked_reads_are_reassembled() {
        let input = SharedInput::default();
        let (mut driver, mut rx) = connected_driver_with(Box::new(ChunkedInput {
            inner: input.clone(),
            chunk: 5,
        }));
        let a = Orientation::new(0.1, 0.2, 0.3);
        let b = Orientation::new(-1.0, 2.0, -3.0);
        input.push(&protocol::encode(&a));
        input.push(&protocol::encode(&b));

        assert_eq!(driver.on_bytes_available(&source()), 2);
        assert_eq!(remote_orientations(&mut rx), vec![a, b]);
        assert_eq!(input.bytes_available(), 0);
    }

    #[test]
    fn test_short_read_tears_session_down() {
        let (mut driver, mut rx) = connected_driver_with(Box::new(StallingInput { served: false }));
        assert!(remote_orientations(&mut rx).is_empty());
        assert_eq!(driver.session_state(), Some(SessionState::Disconnected));
        assert!(!driver.has_stream());
        assert_eq!(driver.decoded(), 0);
        assert_eq!(driver.on_bytes_available(&source()), 0);
    }

    #[test]
    fn test_unexpected_stream_name_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut driver =
            AdvertiserDriver::new(AcceptingTransport::default(), SessionConfig::default(), tx);
        let t0 = Instant::now();
        driver.handle(TransportEvent::InvitationReceived(source()), t0);
        driver.handle(
            TransportEvent::SessionStateChanged {
                peer: source(),
                state: LinkState::Connected,
            },
            t0,
        );
        driver.handle(
            TransportEvent::StreamReceived {
                peer: source(),
                name: "SomethingElse".to_string(),
                stream: Box::new(SharedInput::default()),
            },
            t0,
        );
        assert!(!driver.has_stream());
    }

    #[test]
    fn test_stream_before_connected_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut driver =
            AdvertiserDriver::new(AcceptingTransport::default(), SessionConfig::default(), tx);
        driver.handle(TransportEvent::InvitationReceived(source()), Instant::now());
        driver.handle(
            TransportEvent::StreamReceived {
                peer: source(),
                name: STREAM_NAME.to_string(),
                stream: Box::new(SharedInput::default()),
            },
            Instant::now(),
        );
        assert_eq!(driver.session_state(), Some(SessionState::Connecting));
        assert!(!driver.has_stream());
    }

    #[test]
    fn test_peer_lost_stops_reading() {
        let (mut driver, mut rx, input) = connected_driver();
        driver.handle(TransportEvent::PeerLost(source()), Instant::now());
        assert_eq!(driver.session_state(), None);

        input.push(&protocol::encode(&Orientation::new(1.0, 1.0, 1.0)));
        assert_eq!(driver.on_bytes_available(&source()), 0);
        assert!(remote_orientations(&mut rx).is_empty());
    }

    #[test]
    fn test_unacknowledged_session_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(2),
        };
        let mut driver = AdvertiserDriver::new(AcceptingTransport::default(), config, tx);
        let t0 = Instant::now();
        driver.handle(TransportEvent::InvitationReceived(source()), t0);
        driver.poll(t0 + Duration::from_secs(1));
        assert_eq!(driver.session_state(), Some(SessionState::Connecting));
        driver.poll(t0 + Duration::from_secs(3));
        assert_eq!(driver.session_state(), Some(SessionState::Disconnected));
    }
}
