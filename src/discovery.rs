//! Peer discovery via (broadcast) search packets, and the handshake that lets two nodes learn
//!  each other's identity before exchanging data.
//!
//! All packets in here are sent as raw datagrams, outside of the container framing and without
//!  acknowledgement: a lost search or response is compensated by searching again, a lost
//!  handshake by the handshake timeout.

use crate::error::{JuiceNetError, JuiceNetResult};
use crate::events::TransportEvent;
use crate::identity::{IdentityTokenProvider, PeerIdentity};
use crate::packet::token::{ClientHandshakePacket, PeerResponsePacket, SearchPeersPacket, ServerHandshakePacket};
use crate::packet::WirePacket;
use crate::send_socket::SendSocket;
use rustc_hash::{FxHashMap, FxHashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio::select;
use tracing::{debug, info, trace, warn};

/// A peer that answered a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub addr: SocketAddr,
    pub identity: PeerIdentity,
}

type HandshakeCompletion = oneshot::Sender<JuiceNetResult<PeerIdentity>>;

pub struct DiscoveryService {
    local_identity: PeerIdentity,
    local_token: String,
    discovery_allowed: bool,
    discovery_target: SocketAddr,
    token_provider: Arc<dyn IdentityTokenProvider>,
    socket: Arc<dyn SendSocket>,
    events: broadcast::Sender<TransportEvent>,
    /// every running search holds a receiver
    responses: broadcast::Sender<DiscoveredPeer>,
    pending_handshakes: Mutex<FxHashMap<SocketAddr, Vec<HandshakeCompletion>>>,
}

impl DiscoveryService {
    pub fn new(
        local_identity: PeerIdentity,
        discovery_allowed: bool,
        discovery_target: SocketAddr,
        token_provider: Arc<dyn IdentityTokenProvider>,
        socket: Arc<dyn SendSocket>,
        events: broadcast::Sender<TransportEvent>,
    ) -> JuiceNetResult<DiscoveryService> {
        let local_token = token_provider.sign_identity(&local_identity)?;
        let (responses, _) = broadcast::channel(256);

        Ok(DiscoveryService {
            local_identity,
            local_token,
            discovery_allowed,
            discovery_target,
            token_provider,
            socket,
            events,
            responses,
            pending_handshakes: Default::default(),
        })
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local_identity
    }

    pub fn local_token(&self) -> &str {
        &self.local_token
    }

    /// Searches the configured discovery target, see [DiscoveryService::search_at]
    pub async fn search(&self, timeout: Duration) -> Vec<DiscoveredPeer> {
        self.search_at(self.discovery_target, timeout).await
    }

    /// Sends a search packet to `target` (typically a broadcast address) and collects the
    ///  responses that arrive within `timeout`, one per peer id.
    pub async fn search_at(&self, target: SocketAddr, timeout: Duration) -> Vec<DiscoveredPeer> {
        let deadline = Instant::now() + timeout;
        let mut responses = self.responses.subscribe();

        debug!("searching for peers at {:?}", target);
        self.socket.do_send_packet(target, &SearchPeersPacket::new(self.local_token.clone()).encode()).await;

        let mut result = Vec::new();
        let mut seen_peer_ids = FxHashSet::default();
        loop {
            select! {
                _ = sleep_until(deadline) => break,
                response = responses.recv() => match response {
                    Ok(peer) => {
                        if seen_peer_ids.insert(peer.identity.peer_id) {
                            trace!("search found peer {} at {:?}", peer.identity.peer_id, peer.addr);
                            result.push(peer);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("search result buffer overflow - {} responses were lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("search at {:?} found {} peer(s)", target, result.len());
        result
    }

    /// Exchanges identities with a peer, returning the peer's identity
    pub async fn connect(&self, peer: SocketAddr, timeout: Duration) -> JuiceNetResult<PeerIdentity> {
        let (completion, result) = oneshot::channel();
        self.pending_handshakes.lock()
            .expect("lock is poisoned")
            .entry(peer)
            .or_default()
            .push(completion);

        debug!("starting handshake with {:?}", peer);
        self.socket.do_send_packet(peer, &ClientHandshakePacket::new(self.local_token.clone()).encode()).await;

        match tokio::time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JuiceNetError::NotRunning),
            Err(_) => {
                debug!("handshake with {:?} timed out", peer);
                self.discard_closed_handshakes(peer);
                Err(JuiceNetError::HandshakeTimeout(peer))
            }
        }
    }

    fn discard_closed_handshakes(&self, peer: SocketAddr) {
        let mut pending = self.pending_handshakes.lock().expect("lock is poisoned");
        if let Some(completions) = pending.get_mut(&peer) {
            completions.retain(|c| !c.is_closed());
            if completions.is_empty() {
                pending.remove(&peer);
            }
        }
    }

    /// Fails all handshakes that are still waiting for a response
    pub fn cancel_handshakes(&self) {
        self.pending_handshakes.lock()
            .expect("lock is poisoned")
            .clear();
    }

    pub async fn on_search(&self, from: SocketAddr, packet: SearchPeersPacket) {
        if !self.discovery_allowed {
            trace!("discovery is disabled - ignoring search from {:?}", from);
            return;
        }

        let identity = match self.verify(from, &packet.token) {
            Ok(identity) => identity,
            Err(_) => return,
        };
        if identity.peer_id == self.local_identity.peer_id {
            trace!("ignoring own search");
            return;
        }

        debug!("answering search from peer {} at {:?}", identity.peer_id, from);
        self.socket.do_send_packet(from, &PeerResponsePacket::new(self.local_token.clone()).encode()).await;
    }

    pub fn on_response(&self, from: SocketAddr, packet: PeerResponsePacket) {
        let identity = match self.verify(from, &packet.token) {
            Ok(identity) => identity,
            Err(_) => return,
        };
        if identity.peer_id == self.local_identity.peer_id {
            trace!("ignoring own response");
            return;
        }

        if self.responses.send(DiscoveredPeer { addr: from, identity }).is_err() {
            debug!("response from {:?} while no search is running - ignoring", from);
        }
    }

    /// Answers a handshake, returning the peer's identity if the handshake succeeded
    pub async fn on_client_handshake(&self, from: SocketAddr, packet: ClientHandshakePacket) -> Option<PeerIdentity> {
        let identity = self.verify(from, &packet.token).ok()?;

        debug!("handshake from peer {} at {:?}", identity.peer_id, from);
        self.socket.do_send_packet(from, &ServerHandshakePacket::new(self.local_token.clone()).encode()).await;
        Some(identity)
    }

    /// Completes pending handshakes with the sender, returning the peer's identity if the
    ///  handshake succeeded
    pub fn on_server_handshake(&self, from: SocketAddr, packet: ServerHandshakePacket) -> Option<PeerIdentity> {
        let completions = self.pending_handshakes.lock()
            .expect("lock is poisoned")
            .remove(&from);
        let Some(completions) = completions else {
            debug!("unsolicited handshake response from {:?} - ignoring", from);
            return None;
        };

        let result = self.verify(from, &packet.token);
        let identity = result.as_ref().ok().cloned();
        for completion in completions {
            let _ = completion.send(match &result {
                Ok(identity) => Ok(identity.clone()),
                Err(JuiceNetError::ProtocolVersionMismatch { local_major, remote_major }) => Err(JuiceNetError::ProtocolVersionMismatch { local_major: *local_major, remote_major: *remote_major }),
                Err(e) => Err(JuiceNetError::InvalidToken(e.to_string())),
            });
        }
        identity
    }

    /// Verifies a token and its protocol version, publishing an event if either is not OK
    fn verify(&self, from: SocketAddr, token: &str) -> JuiceNetResult<PeerIdentity> {
        let identity = match self.token_provider.verify_identity(token) {
            Ok(identity) => identity,
            Err(e) => {
                debug!("invalid identity token from {:?}: {}", from, e);
                let _ = self.events.send(TransportEvent::MalformedPacket { from, reason: e.to_string() });
                return Err(e);
            }
        };

        if let Err(e) = identity.check_compatible() {
            debug!("peer {} at {:?} has incompatible protocol version {}", identity.peer_id, from, identity.protocol_major);
            let _ = self.events.send(TransportEvent::ProtocolVersionMismatch { from, remote_major: identity.protocol_major });
            return Err(e);
        }
        Ok(identity)
    }
}
