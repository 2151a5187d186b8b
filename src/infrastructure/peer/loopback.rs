//! Loopback Substrate
//!
//! In-process stand-in for a peer-to-peer discovery framework. Peers join a
//! shared [`LoopbackNetwork`] under a service type; browsers are told about
//! advertisers, invitations and session state are relayed as
//! [`TransportEvent`]s, and streams are bounded byte pipes so that a slow
//! reader produces real backpressure on the writer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::domain::models::{PeerId, Role};
use crate::infrastructure::peer::protocol::PACKET_LEN;
use crate::infrastructure::peer::{
    InputStream, LinkState, OutputStream, Transport, TransportError, TransportEvent,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Node {
    role: Role,
    service_type: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Node {
    fn notify(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

struct Link {
    state: LinkState,
    pipes: Vec<Arc<Mutex<Pipe>>>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<PeerId, Node>,
    links: HashMap<(PeerId, PeerId), Link>,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct Pipe {
    buffer: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

/// Shared medium all loopback peers join.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    stream_capacity: usize,
}

impl LoopbackNetwork {
    /// `stream_capacity` bounds each pipe in bytes, rounded up to whole packets.
    pub fn new(stream_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner::default())),
            stream_capacity: stream_capacity.max(1).div_ceil(PACKET_LEN) * PACKET_LEN,
        }
    }

    /// Join as `peer`. Advertisers become visible to browsers of the same
    /// service type and browsers are told about existing advertisers.
    pub fn join(
        &self,
        peer: PeerId,
        role: Role,
        service_type: &str,
    ) -> (LoopbackTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let node = Node {
            role,
            service_type: service_type.to_string(),
            events,
        };

        let mut inner = lock(&self.inner);
        for (other_id, other) in inner.nodes.iter() {
            if other.service_type != service_type || other.role == role {
                continue;
            }
            match role {
                Role::Advertiser => other.notify(TransportEvent::PeerFound(peer.clone())),
                Role::Browser => node.notify(TransportEvent::PeerFound(other_id.clone())),
            }
        }
        info!("{} joined '{}' as {}", peer, service_type, role);
        inner.nodes.insert(peer.clone(), node);

        let transport = LoopbackTransport {
            local: peer,
            inner: self.inner.clone(),
            stream_capacity: self.stream_capacity,
        };
        (transport, receiver)
    }

    /// Take `peer` off the network: its pipes close, its sessions end, and
    /// every remaining peer of the same service type is told it is gone.
    ///
    /// Dropping the node also closes its own event channel.
    pub fn drop_peer(&self, peer: &PeerId) {
        let mut inner = lock(&self.inner);
        let Some(node) = inner.nodes.remove(peer) else {
            return;
        };

        let keys: Vec<_> = inner
            .links
            .keys()
            .filter(|(a, b)| a == peer || b == peer)
            .cloned()
            .collect();
        for key in keys {
            if let Some(link) = inner.links.remove(&key) {
                for pipe in &link.pipes {
                    lock(pipe).closed = true;
                }
            }
            let other = if &key.0 == peer { &key.1 } else { &key.0 };
            if let Some(other_node) = inner.nodes.get(other) {
                other_node.notify(TransportEvent::SessionStateChanged {
                    peer: peer.clone(),
                    state: LinkState::NotConnected,
                });
            }
        }

        for other in inner.nodes.values() {
            if other.service_type == node.service_type {
                other.notify(TransportEvent::PeerLost(peer.clone()));
            }
        }
        info!("{} left the network", peer);
    }

    pub fn link_state(&self, a: &PeerId, b: &PeerId) -> LinkState {
        lock(&self.inner)
            .links
            .get(&link_key(a, b))
            .map_or(LinkState::NotConnected, |link| link.state)
    }
}

/// One peer's handle on the network.
pub struct LoopbackTransport {
    local: PeerId,
    inner: Arc<Mutex<NetworkInner>>,
    stream_capacity: usize,
}

impl LoopbackTransport {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

impl Transport for LoopbackTransport {
    type Output = LoopbackOutput;

    fn invite(&mut self, peer: &PeerId, timeout: Duration) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        match inner.nodes.get(peer) {
            Some(node) if node.role == Role::Advertiser => {
                node.notify(TransportEvent::InvitationReceived(self.local.clone()))
            }
            _ => return Err(TransportError::PeerUnavailable(peer.clone())),
        }
        if let Some(local) = inner.nodes.get(&self.local) {
            local.notify(TransportEvent::SessionStateChanged {
                peer: peer.clone(),
                state: LinkState::Connecting,
            });
        }
        inner.links.insert(
            link_key(&self.local, peer),
            Link {
                state: LinkState::Connecting,
                pipes: Vec::new(),
            },
        );
        debug!("{} invited {} (timeout {:?})", self.local, peer, timeout);
        Ok(())
    }

    fn respond_to_invitation(&mut self, peer: &PeerId, accept: bool) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        let key = link_key(&self.local, peer);
        let state = if accept {
            let link = inner
                .links
                .get_mut(&key)
                .filter(|link| link.state == LinkState::Connecting)
                .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;
            link.state = LinkState::Connected;
            LinkState::Connected
        } else {
            inner.links.remove(&key);
            LinkState::NotConnected
        };

        if let Some(remote) = inner.nodes.get(peer) {
            remote.notify(TransportEvent::SessionStateChanged {
                peer: self.local.clone(),
                state,
            });
        }
        if let Some(local) = inner.nodes.get(&self.local) {
            local.notify(TransportEvent::SessionStateChanged {
                peer: peer.clone(),
                state,
            });
        }
        debug!("{} answered {}: {:?}", self.local, peer, state);
        Ok(())
    }

    fn start_stream(
        &mut self,
        name: &str,
        peer: &PeerId,
    ) -> Result<LoopbackOutput, TransportError> {
        let mut inner = lock(&self.inner);
        let remote = inner
            .nodes
            .get(peer)
            .map(|node| node.events.clone())
            .ok_or_else(|| TransportError::PeerUnavailable(peer.clone()))?;
        let link = inner
            .links
            .get_mut(&link_key(&self.local, peer))
            .filter(|link| link.state == LinkState::Connected)
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;

        let pipe = Arc::new(Mutex::new(Pipe {
            buffer: VecDeque::with_capacity(self.stream_capacity),
            capacity: self.stream_capacity,
            closed: false,
        }));
        link.pipes.push(pipe.clone());

        let _ = remote.send(TransportEvent::StreamReceived {
            peer: self.local.clone(),
            name: name.to_string(),
            stream: Box::new(LoopbackInput { pipe: pipe.clone() }),
        });
        debug!("{} opened stream '{}' to {}", self.local, name, peer);

        Ok(LoopbackOutput {
            local: self.local.clone(),
            pipe,
            remote,
        })
    }
}

/// Writing end of a pipe. Closes the pipe when dropped.
pub struct LoopbackOutput {
    local: PeerId,
    pipe: Arc<Mutex<Pipe>>,
    remote: mpsc::UnboundedSender<TransportEvent>,
}

impl OutputStream for LoopbackOutput {
    fn has_space_available(&self) -> bool {
        let pipe = lock(&self.pipe);
        !pipe.closed && pipe.capacity - pipe.buffer.len() >= PACKET_LEN
    }

    /// All or nothing: a write that does not fit leaves the pipe untouched.

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let written = {
            let mut pipe = lock(&self.pipe);
            if pipe.closed {
                return Err(TransportError::StreamClosed);
            }
            if pipe.capacity - pipe.buffer.len() < bytes.len() {
                0
            } else {
                pipe.buffer.extend(bytes);
                bytes.len()
            }
        };
        if written > 0 {
            let _ = self
                .remote
                .send(TransportEvent::BytesAvailable(self.local.clone()));
        }
        trace!("{} wrote {} bytes", self.local, written);
        Ok(written)
    }
}

impl Drop for LoopbackOutput {
    fn drop(&mut self) {
        lock(&self.pipe).closed = true;
    }
}

/// Reading end of a pipe. Buffered bytes stay readable after close.
pub struct LoopbackInput {
    pipe: Arc<Mutex<Pipe>>,
}

impl InputStream for LoopbackInput {
    fn bytes_available(&self) -> usize {
        lock(&self.pipe).buffer.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut pipe = lock(&self.pipe);
        if pipe.buffer.is_empty() && pipe.closed {
            return Err(TransportError::StreamClosed);
        }
        let n = buf.len().min(pipe.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::peer::protocol::{PACKET_LEN, SERVICE_TYPE, STREAM_NAME};

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn display() -> PeerId {
        PeerId::new("display")
    }

    fn source() -> PeerId {
        PeerId::new("source")
    }

    #[test]
    fn test_browser_discovers_existing_advertiser() {
        let network = LoopbackNetwork::new(24);
        let (_adv, _adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);
        let (_src, mut src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);

        let events = drain(&mut src_rx);
        assert!(matches!(&events[..], [TransportEvent::PeerFound(p)] if *p == display()));
    }

    #[test]
    fn test_advertiser_announced_to_waiting_browser() {
        let network = LoopbackNetwork::new(24);
        let (_src, mut src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);
        let (_adv, _adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);

        let events = drain(&mut src_rx);
        assert!(matches!(&events[..], [TransportEvent::PeerFound(p)] if *p == display()));
    }

    #[test]
    fn test_other_service_types_are_invisible() {
        let network = LoopbackNetwork::new(24);
        let (_adv, _adv_rx) = network.join(display(), Role::Advertiser, "other-service");
        let (mut src, mut src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);

        assert!(drain(&mut src_rx).is_empty());
        assert!(src.invite(&PeerId::new("nobody"), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_invite_accept_and_stream() {
        let network = LoopbackNetwork::new(2 * PACKET_LEN);
        let (mut adv, mut adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);
        let (mut src, mut src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);
        drain(&mut src_rx);

        assert!(src.start_stream(STREAM_NAME, &display()).is_err());

        src.invite(&display(), Duration::from_secs(10)).unwrap();
        assert!(matches!(
            &drain(&mut adv_rx)[..],
            [TransportEvent::InvitationReceived(p)] if *p == source()
        ));
        assert_eq!(network.link_state(&source(), &display()), LinkState::Connecting);

        adv.respond_to_invitation(&source(), true).unwrap();
        assert_eq!(network.link_state(&display(), &source()), LinkState::Connected);
        let src_events = drain(&mut src_rx);
        assert!(matches!(
            src_events.last(),
            Some(TransportEvent::SessionStateChanged { state: LinkState::Connected, .. })
        ));
        drain(&mut adv_rx);

        let mut out = src.start_stream(STREAM_NAME, &display()).unwrap();
        let mut input = match drain(&mut adv_rx).pop() {
            Some(TransportEvent::StreamReceived { name, stream, .. }) => {
                assert_eq!(name, STREAM_NAME);
                stream
            }
            other => panic!("expected stream, got {:?}", other),
        };

        assert!(out.has_space_available());
        assert_eq!(out.write(&[1u8; PACKET_LEN]).unwrap(), PACKET_LEN);
        assert_eq!(out.write(&[2u8; PACKET_LEN]).unwrap(), PACKET_LEN);
        assert!(!out.has_space_available());
        assert_eq!(out.write(&[3u8; PACKET_LEN]).unwrap(), 0);
        assert_eq!(drain(&mut adv_rx).len(), 2);

        let mut buf = [0u8; PACKET_LEN];
        assert_eq!(input.bytes_available(), 2 * PACKET_LEN);
        assert_eq!(input.read(&mut buf).unwrap(), PACKET_LEN);
        assert_eq!(buf, [1u8; PACKET_LEN]);
        assert!(out.has_space_available());
    }

    #[test]
    fn test_capacity_rounds_up_to_whole_packets() {
        let network = LoopbackNetwork::new(20);
        let (mut adv, mut adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);
        let (mut src, _src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);
        src.invite(&display(), Duration::from_secs(10)).unwrap();
        adv.respond_to_invitation(&source(), true).unwrap();
        let mut out = src.start_stream(STREAM_NAME, &display()).unwrap();

        assert_eq!(out.write(&[1u8; PACKET_LEN]).unwrap(), PACKET_LEN);
        assert!(out.has_space_available());
        assert_eq!(out.write(&[2u8; PACKET_LEN]).unwrap(), PACKET_LEN);
        assert!(!out.has_space_available());
        assert_eq!(out.write(&[3u8; PACKET_LEN]).unwrap(), 0);

        let input = drain(&mut adv_rx)
            .into_iter()
            .find_map(|e| match e {
                TransportEvent::StreamReceived { stream, .. } => Some(stream),
                _ => None,
            })
            .unwrap();
        assert_eq!(input.bytes_available(), 2 * PACKET_LEN);
    }

    #[test]
    fn test_write_that_does_not_fit_leaves_pipe_untouched() {
        let network = LoopbackNetwork::new(PACKET_LEN);
        let (mut adv, mut adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);
        let (mut src, _src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);
        src.invite(&display(), Duration::from_secs(10)).unwrap();
        adv.respond_to_invitation(&source(), true).unwrap();
        let mut out = src.start_stream(STREAM_NAME, &display()).unwrap();

        assert_eq!(out.write(&[1u8; 4]).unwrap(), 4);
        assert!(!out.has_space_available());
        assert_eq!(out.write(&[2u8; PACKET_LEN]).unwrap(), 0);

        let input = drain(&mut adv_rx)
            .into_iter()
            .find_map(|e| match e {
                TransportEvent::StreamReceived { stream, .. } => Some(stream),
                _ => None,
            })
            .unwrap();
        assert_eq!(input.bytes_available(), 4);
    }

    #[test]
    fn test_drop_peer_closes_stream_and_notifies() {
        let network = LoopbackNetwork::new(PACKET_LEN);
        let (mut adv, mut adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);
        let (mut src, mut src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);
        src.invite(&display(), Duration::from_secs(10)).unwrap();
        adv.respond_to_invitation(&source(), true).unwrap();
        let mut out = src.start_stream(STREAM_NAME, &display()).unwrap();
        drain(&mut src_rx);
        drain(&mut adv_rx);

        network.drop_peer(&display());

        assert!(!out.has_space_available());
        assert_eq!(out.write(&[0u8; 4]), Err(TransportError::StreamClosed));
        let events = drain(&mut src_rx);
        assert!(events.iter().any(
            |e| matches!(e, TransportEvent::PeerLost(p) if *p == display())
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::SessionStateChanged { state: LinkState::NotConnected, .. }
        )));
        assert_eq!(network.link_state(&source(), &display()), LinkState::NotConnected);

        // Once the writer that still points at it is gone, the dropped
        // node's channel is closed.
        drop(out);
        assert!(matches!(
            adv_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_input_reports_closed_after_drain() {
        let network = LoopbackNetwork::new(PACKET_LEN);
        let (mut adv, mut adv_rx) = network.join(display(), Role::Advertiser, SERVICE_TYPE);
        let (mut src, _src_rx) = network.join(source(), Role::Browser, SERVICE_TYPE);
        src.invite(&display(), Duration::from_secs(10)).unwrap();
        adv.respond_to_invitation(&source(), true).unwrap();
        let mut out = src.start_stream(STREAM_NAME, &display()).unwrap();
        out.write(&[7u8; 4]).unwrap();
        drop(out);

        let mut input = drain(&mut adv_rx)
            .into_iter()
            .find_map(|e| match e {
                TransportEvent::StreamReceived { stream, .. } => Some(stream),
                _ => None,
            })
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).unwrap(), 4);
        assert_eq!(input.read(&mut buf), Err(TransportError::StreamClosed));
    }
}
