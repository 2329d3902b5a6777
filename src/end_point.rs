use crate::config::JuiceNetConfig;
use crate::discovery::{DiscoveredPeer, DiscoveryService};
use crate::dispatcher::{ChannelDispatcher, ChannelHandler};
use crate::error::{JuiceNetError, JuiceNetResult};
use crate::events::TransportEvent;
use crate::identity::{IdentityTokenProvider, PeerIdentity};
use crate::packet::ack::AckPacket;
use crate::packet::container::{ContainerPacket, FragmentHeader, ReliabilityHeader, ReliabilityType};
use crate::packet::{JuiceNetPacket, WirePacket};
use crate::peer::PeerTable;
use crate::reliability::SendReceipt;
use crate::send_socket::{bind_udp_socket, SendSocket};
use crate::util::safe_converter::PrecheckedCast;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EndPointState {
    Stopped = 0,
    Running = 1,
    /// startup failed, the endpoint needs to be stopped before it can be started again
    Crashed = 2,
}

struct RunningEndPoint {
    core: Arc<EndPointCore>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningEndPoint {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// EndPoint is the place where all other parts of the protocol come together: It listens on a
///  UdpSocket, dispatching incoming packets to their corresponding channels, and has an API for
///  application code to send messages and to find peers.
///
/// An endpoint is created in state [EndPointState::Stopped], and it starts receiving packets
///  when it is started. It can be stopped and started again, each start binding a fresh socket.
pub struct EndPoint {
    config: Arc<JuiceNetConfig>,
    token_provider: Arc<dyn IdentityTokenProvider>,
    peer_id: u64,
    state: AtomicU8,
    dispatcher: Arc<ChannelDispatcher>,
    events: broadcast::Sender<TransportEvent>,
    running: Mutex<Option<RunningEndPoint>>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.as_mut() {
                running.abort_tasks();
            }
        }
    }
}

impl EndPoint {
    pub fn new(config: JuiceNetConfig, token_provider: Arc<dyn IdentityTokenProvider>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let peer_id = rand::random();
        debug!("creating endpoint with peer id {}", peer_id);

        Ok(EndPoint {
            config: Arc::new(config),
            token_provider,
            peer_id,
            state: AtomicU8::new(EndPointState::Stopped.into()),
            dispatcher: Arc::new(ChannelDispatcher::new()),
            events,
            running: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EndPointState {
        EndPointState::try_from(self.state.load(Ordering::Acquire))
            .expect("only valid states are stored")
    }

    fn set_state(&self, state: EndPointState) {
        self.state.store(state.into(), Ordering::Release);
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn config(&self) -> &JuiceNetConfig {
        &self.config
    }

    /// the address the socket is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core().ok()
            .map(|core| core.socket.local_addr())
    }

    /// the identity advertised to peers while running
    pub fn local_identity(&self) -> Option<PeerIdentity> {
        self.core().ok()
            .map(|core| core.discovery.local_identity().clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Handlers are called one at a time from the receive loop. They may send, including to
    ///  the sender, but awaiting the outcome of a reliable send blocks the receive loop that
    ///  would process the ack.
    pub fn register_channel_handler(&self, channel_id: u8, handler: Arc<dyn ChannelHandler>) {
        self.dispatcher.register(channel_id, handler);
    }

    pub fn remove_channel_handler(&self, channel_id: u8) {
        self.dispatcher.remove(channel_id);
    }

    /// The handler for payloads on channels without a registered handler. Without one, those
    ///  payloads are dropped.
    pub fn set_unhandled_handler(&self, handler: Option<Arc<dyn ChannelHandler>>) {
        self.dispatcher.set_unhandled(handler);
    }

    fn core(&self) -> JuiceNetResult<Arc<EndPointCore>> {
        self.running.lock()
            .expect("lock is poisoned")
            .as_ref()
            .map(|r| r.core.clone())
            .ok_or(JuiceNetError::NotRunning)
    }

    /// Binds the socket and starts receiving. This must be called from inside a tokio runtime.
    pub async fn start(&self) -> JuiceNetResult<()> {
        let mut running = self.running.lock().expect("lock is poisoned");
        if self.state() != EndPointState::Stopped {
            return Err(JuiceNetError::InvalidState("start"));
        }

        let socket = match bind_udp_socket(&self.config) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("endpoint could not start: {}", e);
                self.set_state(EndPointState::Crashed);
                return Err(e);
            }
        };

        let core = match EndPointCore::new(
            self.config.clone(),
            Arc::new(socket.clone()),
            self.token_provider.clone(),
            self.peer_id,
            self.dispatcher.clone(),
            self.events.clone(),
        ) {
            Ok(core) => Arc::new(core),
            Err(e) => {
                error!("endpoint could not start: {}", e);
                self.set_state(EndPointState::Crashed);
                return Err(e);
            }
        };

        let local_addr = core.socket.local_addr();
        let tasks = vec![
            tokio::spawn(core.clone().recv_loop(socket)),
            tokio::spawn(core.clone().sweep_loop()),
        ];
        *running = Some(RunningEndPoint { core, tasks });
        self.set_state(EndPointState::Running);

        info!("endpoint {} started on {:?}", self.peer_id, local_addr);
        let _ = self.events.send(TransportEvent::Started { local_addr });
        Ok(())
    }

    /// Stops receiving and discards all peer state. Pending reliable sends resolve as
    ///  [JuiceNetError::DeliveryCancelled].
    pub async fn stop(&self) -> JuiceNetResult<()> {
        let running = self.running.lock()
            .expect("lock is poisoned")
            .take();

        match running {
            Some(mut running) => {
                running.abort_tasks();
                running.core.shutdown().await;
                self.set_state(EndPointState::Stopped);
                info!("endpoint {} stopped", self.peer_id);
                let _ = self.events.send(TransportEvent::Stopped);
            }
            None => {
                if self.state() == EndPointState::Crashed {
                    debug!("resetting crashed endpoint");
                }
                self.set_state(EndPointState::Stopped);
            }
        }
        Ok(())
    }

    /// Sends a payload, fragmenting it if it does not fit into a single datagram.
    ///
    /// This returns as soon as the packets are handed to the socket. For reliable sends, the
    ///  returned receipt resolves when the peer acknowledged all packets.
    pub async fn send(&self, to: SocketAddr, payload: &[u8], reliability: ReliabilityType, channel_id: u8) -> JuiceNetResult<SendReceipt> {
        self.core()?
            .send(to, payload, reliability, channel_id).await
    }

    /// Searches the configured discovery target for peers
    pub async fn search(&self, timeout: Duration) -> JuiceNetResult<Vec<DiscoveredPeer>> {
        Ok(self.core()?.discovery.search(timeout).await)
    }

    pub async fn search_at(&self, target: SocketAddr, timeout: Duration) -> JuiceNetResult<Vec<DiscoveredPeer>> {
        Ok(self.core()?.discovery.search_at(target, timeout).await)
    }

    /// Performs a handshake with a peer, returning its identity
    pub async fn connect(&self, peer: SocketAddr, timeout: Duration) -> JuiceNetResult<PeerIdentity> {
        self.core()?.connect(peer, timeout).await
    }

    /// the identity a peer presented in a handshake, if there was one
    pub async fn peer_identity(&self, peer: SocketAddr) -> Option<PeerIdentity> {
        let core = self.core().ok()?;
        let peer = core.peers.get(&peer)?;
        let identity = peer.lock().await.identity.clone();
        identity
    }

    /// number of sent reliable packets that are not acknowledged yet
    pub async fn pending_ack_count(&self) -> usize {
        match self.core() {
            Ok(core) => core.pending_ack_count().await,
            Err(_) => 0,
        }
    }
}

/// The part of an endpoint that exists while it is running
pub(crate) struct EndPointCore {
    config: Arc<JuiceNetConfig>,
    socket: Arc<dyn SendSocket>,
    dispatcher: Arc<ChannelDispatcher>,
    events: broadcast::Sender<TransportEvent>,
    discovery: DiscoveryService,
    peers: PeerTable,
    /// Serializes dispatch to handlers between the receive loop and the sweep loop. Acquired
    ///  before a peer's lock, and held while the peer's released payloads are dispatched.
    delivery: AsyncMutex<()>,
    next_packet_id: AtomicU32,
    next_fragmentation_id: AtomicU32,
}

impl EndPointCore {
    pub(crate) fn new(
        config: Arc<JuiceNetConfig>,
        socket: Arc<dyn SendSocket>,
        token_provider: Arc<dyn IdentityTokenProvider>,
        peer_id: u64,
        dispatcher: Arc<ChannelDispatcher>,
        events: broadcast::Sender<TransportEvent>,
    ) -> JuiceNetResult<EndPointCore> {
        let local_identity = PeerIdentity::local(peer_id, socket.local_addr().port(), config.host_version.as_deref());
        let discovery = DiscoveryService::new(
            local_identity,
            config.discovery_allowed,
            config.discovery_target,
            token_provider,
            socket.clone(),
            events.clone(),
        )?;

        Ok(EndPointCore {
            config,
            socket,
            dispatcher,
            events,
            discovery,
            peers: PeerTable::default(),
            delivery: AsyncMutex::new(()),
            next_packet_id: AtomicU32::new(0),
            next_fragmentation_id: AtomicU32::new(0),
        })
    }

    fn emit(&self, event: TransportEvent) {
        trace!("event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut sweep_interval = interval(self.config.sweep_interval);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            sweep_interval.tick().await;
            self.sweep(Instant::now()).await;
        }
    }

    pub(crate) async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        trace!("received {} bytes from {:?}", buf.len(), from);

        let packet = match JuiceNetPacket::decode(buf) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("unknown packet id {:?} from {:?} - dropping", JuiceNetPacket::peek_packet_id(buf).ok(), from);
                return;
            }
            Err(e) => {
                debug!("malformed packet from {:?}: {} - dropping", from, e);
                self.emit(TransportEvent::MalformedPacket { from, reason: e.to_string() });
                return;
            }
        };

        match packet {
            JuiceNetPacket::Container(packet) => self.on_container(from, packet).await,
            JuiceNetPacket::Ack(packet) => self.on_ack(from, packet).await,
            JuiceNetPacket::SearchPeers(packet) => self.discovery.on_search(from, packet).await,
            JuiceNetPacket::PeerResponse(packet) => self.discovery.on_response(from, packet),
            JuiceNetPacket::ClientHandshake(packet) => {
                if let Some(identity) = self.discovery.on_client_handshake(from, packet).await {
                    self.on_peer_connected(from, identity).await;
                }
            }
            JuiceNetPacket::ServerHandshake(packet) => {
                // the identity is registered by the waiting `connect` call
                self.discovery.on_server_handshake(from, packet);
            }
        }
    }

    async fn on_peer_connected(&self, addr: SocketAddr, identity: PeerIdentity) {
        let previous_peer_id = {
            let mut peer = self.peers.lock(addr, &self.config).await;
            peer.last_seen = Instant::now();

            let previous_peer_id = peer.identity.as_ref()
                .map(|prev| prev.peer_id)
                .filter(|&prev| prev != identity.peer_id);
            if let Some(previous_peer_id) = previous_peer_id {
                debug!("peer {:?} restarted (peer id {} -> {}), re-initializing local per-peer state", addr, previous_peer_id, identity.peer_id);
                let num_cancelled = peer.reset_for_restarted_peer(&self.config);
                if num_cancelled > 0 {
                    info!("cancelled {} pending reliable sends to the previous incarnation of {:?}", num_cancelled, addr);
                }
            }
            peer.identity = Some(identity.clone());
            previous_peer_id
        };

        if let Some(previous_peer_id) = previous_peer_id {
            self.emit(TransportEvent::PeerRestarted { addr, previous_peer_id, peer_id: identity.peer_id });
        }
        self.emit(TransportEvent::PeerConnected { addr, identity });
    }

    async fn on_container(&self, from: SocketAddr, packet: ContainerPacket) {
        let channel_id = packet.channel_id;
        let _delivery = self.delivery.lock().await;

        let released = self.accept_container(from, packet).await;
        for payload in released {
            self.dispatcher.dispatch(from, channel_id, &payload).await;
        }
    }

    /// Runs a container through duplicate suppression, reassembly and ordering, returning the
    ///  payloads that are ready for dispatch
    async fn accept_container(&self, from: SocketAddr, packet: ContainerPacket) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut peer = self.peers.lock(from, &self.config).await;
        peer.last_seen = now;

        if let Some((packet_id, packet_counter)) = packet.reliability.tracking() {
            // duplicates are acknowledged as well, the first ack may have been lost
            self.socket.do_send_packet(from, &AckPacket::single(packet_id).encode()).await;

            if !peer.received.record(packet_counter) {
                debug!("duplicate packet counter {} from {:?} - dropping", packet_counter, from);
                return Vec::new();
            }
        }

        let payload = match &packet.fragment {
            None => packet.payload,
            Some(fragment) => {
                let (completed, evicted) = peer.reassembler.on_fragment(fragment, &packet.payload, now);
                for fragmentation_id in evicted {
                    self.emit(TransportEvent::ReassemblyTimedOut { peer: from, fragmentation_id });
                }
                match completed {
                    Some(payload) => payload,
                    None => return Vec::new(),
                }
            }
        };

        match packet.reliability.order_id() {
            None => vec![payload],
            Some(order_id) => peer.ordering_window(packet.channel_id, &self.config)
                .on_packet(order_id, payload, now),
        }
    }

    async fn on_ack(&self, from: SocketAddr, packet: AckPacket) {
        let peer = match self.peers.get(&from) {
            Some(peer) => peer,
            None => {
                debug!("ack from unknown peer {:?} - ignoring", from);
                return;
            }
        };

        let mut peer = peer.lock().await;
        peer.last_seen = Instant::now();
        for packet_id in packet.packet_ids {
            peer.send.on_ack(packet_id);
        }
    }

    pub(crate) async fn send(&self, to: SocketAddr, payload: &[u8], reliability: ReliabilityType, channel_id: u8) -> JuiceNetResult<SendReceipt> {
        if payload.len() > self.config.max_message_size {
            return Err(JuiceNetError::PayloadTooLarge { len: payload.len(), max: self.config.max_message_size });
        }

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        }
        else {
            payload.chunks(self.config.max_payload_per_packet()).collect()
        };
        let num_chunks = chunks.len();
        let fragmentation_id = if num_chunks > 1 {
            let fragmentation_id = self.next_fragmentation_id.fetch_add(1, Ordering::Relaxed);
            trace!("sending {} bytes to {:?} in {} fragments with fragmentation id {}", payload.len(), to, num_chunks, fragmentation_id);
            Some(fragmentation_id)
        }
        else {
            None
        };
        let fragment_header = |index: usize| fragmentation_id.map(|fragmentation_id| FragmentHeader {
            fragmentation_id,
            index: index.prechecked_cast(),
            is_last: index + 1 == num_chunks,
        });

        if reliability == ReliabilityType::Unreliable {
            for (index, chunk) in chunks.into_iter().enumerate() {
                let packet = ContainerPacket {
                    reliability: ReliabilityHeader::Unreliable,
                    channel_id,
                    fragment: fragment_header(index),
                    payload: chunk.to_vec(),
                };
                self.socket.do_send_packet(to, &packet.encode()).await;
            }
            return Ok(SendReceipt::untracked());
        }

        let now = Instant::now();
        let mut peer = self.peers.lock(to, &self.config).await;
        let order_id = match reliability {
            ReliabilityType::ReliableOrdered => Some(peer.send.next_order_id(channel_id)),
            _ => None,
        };

        let mut completions = Vec::with_capacity(num_chunks);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            let packet_counter = peer.send.next_packet_counter();
            let reliability = match order_id {
                Some(order_id) => ReliabilityHeader::ReliableOrdered { packet_id, packet_counter, order_id },
                None => ReliabilityHeader::Reliable { packet_id, packet_counter },
            };

            let datagram = ContainerPacket {
                reliability,
                channel_id,
                fragment: fragment_header(index),
                payload: chunk.to_vec(),
            }.encode().freeze();

            completions.push((to, packet_id, peer.send.register(packet_id, datagram.clone(), now, &self.config.retry)));
            self.socket.do_send_packet(to, &datagram).await;
        }
        Ok(SendReceipt::tracked(completions))
    }

    async fn connect(&self, peer: SocketAddr, timeout: Duration) -> JuiceNetResult<PeerIdentity> {
        let identity = self.discovery.connect(peer, timeout).await?;
        self.on_peer_connected(peer, identity.clone()).await;
        Ok(identity)
    }

    /// Time-driven work for all peers: retransmissions, timeouts and idle peers
    pub(crate) async fn sweep(&self, now: Instant) {
        for peer in self.peers.snapshot() {
            let _delivery = self.delivery.lock().await;
            let mut peer = peer.lock().await;
            let addr = peer.addr;

            let retransmit = peer.send.poll_retransmissions(now, &self.config.retry);
            for datagram in &retransmit.resend {
                self.socket.do_send_packet(addr, datagram).await;
            }
            for packet_id in retransmit.failed {
                warn!("delivery of packet #{} to {:?} failed", packet_id, addr);
                self.emit(TransportEvent::DeliveryFailed { peer: addr, packet_id });
            }

            for fragmentation_id in peer.reassembler.expire(now, self.config.reassembly_timeout) {
                self.emit(TransportEvent::ReassemblyTimedOut { peer: addr, fragmentation_id });
            }

            let mut flushed = Vec::new();
            for (channel_id, window) in peer.ordering_windows_mut() {
                for payload in window.flush_expired(now) {
                    flushed.push((channel_id, payload));
                }
            }

            if peer.is_idle(now, self.config.peer_timeout) {
                debug!("peer {:?} is idle - discarding its state", addr);
                self.peers.evict(&mut peer);
                self.emit(TransportEvent::PeerEvicted { addr });
            }
            drop(peer);

            for (channel_id, payload) in flushed {
                self.dispatcher.dispatch(addr, channel_id, &payload).await;
            }
        }
    }

    pub(crate) async fn pending_ack_count(&self) -> usize {
        let mut result = 0;
        for peer in self.peers.snapshot() {
            result += peer.lock().await.send.num_pending();
        }
        result
    }

    async fn shutdown(&self) {
        self.discovery.cancel_handshakes();

        let mut num_cancelled = 0;
        for peer in self.peers.clear() {
            num_cancelled += peer.lock().await.send.cancel_all();
        }
        if num_cancelled > 0 {
            info!("cancelled {} pending reliable sends", num_cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockChannelHandler;
    use crate::identity::HmacTokenProvider;
    use crate::packet::token::ClientHandshakePacket;
    use crate::send_socket::MockSendSocket;
    use crate::test_util::{localhost_config, RecordingHandler};
    use rstest::rstest;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::Weak;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn local_addr() -> SocketAddr {
        SocketAddr::from(([127,0,0,1], 5005))
    }
    fn remote_addr() -> SocketAddr {
        SocketAddr::from(([127,0,0,2], 6006))
    }

    fn token_provider() -> Arc<dyn IdentityTokenProvider> {
        Arc::new(HmacTokenProvider::new(b"end point test"))
    }

    fn core_with(mut socket: MockSendSocket, config: JuiceNetConfig, dispatcher: ChannelDispatcher) -> (Arc<EndPointCore>, broadcast::Receiver<TransportEvent>) {
        socket.expect_local_addr().return_const(local_addr());
        let (events, events_receiver) = broadcast::channel(64);

        let core = EndPointCore::new(
            Arc::new(config),
            Arc::new(socket),
            token_provider(),
            1,
            Arc::new(dispatcher),
            events,
        ).unwrap();
        (Arc::new(core), events_receiver)
    }

    /// a socket that records all sent datagrams
    fn recording_socket() -> (MockSendSocket, Arc<StdMutex<Vec<(SocketAddr, Vec<u8>)>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let mut socket = MockSendSocket::new();
        let sent_clone = sent.clone();
        socket.expect_do_send_packet()
            .returning(move |to, buf| sent_clone.lock().unwrap().push((to, buf.to_vec())));
        (socket, sent)
    }

    fn decode_containers(sent: &[(SocketAddr, Vec<u8>)]) -> Vec<ContainerPacket> {
        sent.iter()
            .filter_map(|(_, buf)| match JuiceNetPacket::decode(buf).unwrap() {
                Some(JuiceNetPacket::Container(p)) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn reliable_packet(packet_id: u32, packet_counter: u32, payload: Vec<u8>) -> ContainerPacket {
        ContainerPacket {
            reliability: ReliabilityHeader::Reliable { packet_id, packet_counter },
            channel_id: 0,
            fragment: None,
            payload,
        }
    }

    #[tokio::test]
    async fn test_duplicate_is_delivered_once_and_acked_twice() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .times(2)
            .withf(|to, buf| *to == SocketAddr::from(([127,0,0,2], 6006)) && AckPacket::decode(buf).unwrap() == AckPacket::single(5))
            .return_const(());

        let mut handler = MockChannelHandler::new();
        handler.expect_on_message()
            .once()
            .withf(|_, c, p| *c == 0 && p == [1, 2, 3])
            .return_const(());
        let dispatcher = ChannelDispatcher::new();
        dispatcher.register(0, Arc::new(handler));

        let (core, _) = core_with(socket, localhost_config(), dispatcher);

        let datagram = reliable_packet(5, 0, vec![1, 2, 3]).encode();
        core.on_datagram(remote_addr(), &datagram).await;
        core.on_datagram(remote_addr(), &datagram).await;
    }

    #[tokio::test]
    async fn test_unreliable_is_not_acked_and_not_deduplicated() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().never();

        let mut handler = MockChannelHandler::new();
        handler.expect_on_message()
            .times(2)
            .return_const(());
        let dispatcher = ChannelDispatcher::new();
        dispatcher.register(9, Arc::new(handler));

        let (core, _) = core_with(socket, localhost_config(), dispatcher);

        let datagram = ContainerPacket {
            reliability: ReliabilityHeader::Unreliable,
            channel_id: 9,
            fragment: None,
            payload: vec![1],
        }.encode();
        core.on_datagram(remote_addr(), &datagram).await;
        core.on_datagram(remote_addr(), &datagram).await;
    }

    #[tokio::test]
    async fn test_fragmented_ordered_messages() {
        let (socket, _) = recording_socket();
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = ChannelDispatcher::new();
        dispatcher.register(3, handler.clone());
        let (core, _) = core_with(socket, localhost_config(), dispatcher);

        let ordered = |packet_id: u32, order_id: u32, fragment: Option<FragmentHeader>, payload: Vec<u8>| ContainerPacket {
            reliability: ReliabilityHeader::ReliableOrdered { packet_id, packet_counter: packet_id, order_id },
            channel_id: 3,
            fragment,
            payload,
        }.encode();
        let fragment = |index: u16, is_last: bool| Some(FragmentHeader { fragmentation_id: 77, index, is_last });

        // order id 1 overtakes the fragments of order id 0
        core.on_datagram(remote_addr(), &ordered(3, 1, None, vec![9])).await;
        core.on_datagram(remote_addr(), &ordered(2, 0, fragment(2, true), vec![5, 6])).await;
        core.on_datagram(remote_addr(), &ordered(0, 0, fragment(0, false), vec![1, 2])).await;
        assert!(handler.received().is_empty());

        core.on_datagram(remote_addr(), &ordered(1, 0, fragment(1, false), vec![3, 4])).await;
        assert_eq!(handler.payloads(), vec![vec![1, 2, 3, 4, 5, 6], vec![9]]);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_reported() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().never();
        let (core, mut events) = core_with(socket, localhost_config(), ChannelDispatcher::new());

        core.on_datagram(remote_addr(), &[0xCB, 0x12, 7]).await;
        assert!(matches!(events.try_recv().unwrap(), TransportEvent::MalformedPacket { from, .. } if from == remote_addr()));

        // unknown packet ids are dropped silently
        core.on_datagram(remote_addr(), &[0x99, 0x99, 1, 2]).await;
        assert!(events.try_recv().is_err());
    }

    #[rstest]
    #[case::unreliable(ReliabilityType::Unreliable, 0)]
    #[case::reliable(ReliabilityType::Reliable, 3)]
    #[case::reliable_ordered(ReliabilityType::ReliableOrdered, 3)]
    #[tokio::test]
    async fn test_send_fragments(#[case] reliability: ReliabilityType, #[case] expected_pending: usize) {
        let mut config = localhost_config();
        config.max_datagram_size = ContainerPacket::MAX_HEADER_LEN + 4;

        let (socket, sent) = recording_socket();
        let (core, _) = core_with(socket, config, ChannelDispatcher::new());

        let receipt = core.send(remote_addr(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], reliability, 2).await.unwrap();
        assert_eq!(receipt.is_tracked(), expected_pending > 0);
        assert_eq!(core.pending_ack_count().await, expected_pending);

        let sent = sent.lock().unwrap().clone();
        assert!(sent.iter().all(|(to, _)| *to == remote_addr()));
        let packets = decode_containers(&sent);

        let fragments: Vec<(u16, bool, Vec<u8>)> = packets.iter()
            .map(|p| {
                let fragment = p.fragment.unwrap();
                assert_eq!(p.channel_id, 2);
                assert_eq!(p.reliability.reliability_type(), reliability);
                assert_eq!(fragment.fragmentation_id, packets[0].fragment.unwrap().fragmentation_id);
                (fragment.index, fragment.is_last, p.payload.clone())
            })
            .collect();
        assert_eq!(fragments, vec![
            (0, false, vec![1, 2, 3, 4]),
            (1, false, vec![5, 6, 7, 8]),
            (2, true, vec![9, 10]),
        ]);

        if reliability == ReliabilityType::ReliableOrdered {
            assert!(packets.iter().all(|p| p.reliability.order_id() == Some(0)));
        }
        let counters: Vec<u32> = packets.iter()
            .filter_map(|p| p.reliability.tracking())
            .map(|(_, counter)| counter)
            .collect();
        assert_eq!(counters, if expected_pending > 0 { vec![0, 1, 2] } else { vec![] });
    }

    #[tokio::test]
    async fn test_send_unfragmented() {
        let (socket, sent) = recording_socket();
        let (core, _) = core_with(socket, localhost_config(), ChannelDispatcher::new());

        core.send(remote_addr(), &[], ReliabilityType::ReliableOrdered, 0).await.unwrap();
        core.send(remote_addr(), &[1], ReliabilityType::ReliableOrdered, 0).await.unwrap();

        let packets = decode_containers(&sent.lock().unwrap());
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].fragment, None);
        assert_eq!(packets[0].reliability, ReliabilityHeader::ReliableOrdered { packet_id: 0, packet_counter: 0, order_id: 0 });
        assert_eq!(packets[1].reliability, ReliabilityHeader::ReliableOrdered { packet_id: 1, packet_counter: 1, order_id: 1 });
    }

    #[tokio::test]
    async fn test_send_too_large() {
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet().never();
        let mut config = localhost_config();
        config.max_message_size = 10;
        let (core, _) = core_with(socket, config, ChannelDispatcher::new());

        let result = core.send(remote_addr(), &[0; 11], ReliabilityType::Reliable, 0).await;
        assert!(matches!(result, Err(JuiceNetError::PayloadTooLarge { len: 11, max: 10 })));
    }

    #[tokio::test]
    async fn test_ack_retires_pending_send() {
        let (socket, _) = recording_socket();
        let (core, _) = core_with(socket, localhost_config(), ChannelDispatcher::new());

        let receipt = core.send(remote_addr(), &[1], ReliabilityType::Reliable, 0).await.unwrap();
        assert_eq!(core.pending_ack_count().await, 1);

        // acks from other addresses do not count
        core.on_datagram(local_addr(), &AckPacket::single(0).encode()).await;
        assert_eq!(core.pending_ack_count().await, 1);

        core.on_datagram(remote_addr(), &AckPacket::single(0).encode()).await;
        assert_eq!(core.pending_ack_count().await, 0);
        receipt.delivered().await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_once() {
        let mut config = localhost_config();
        config.retry.max_retries = 2;

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .times(3)
            .return_const(());
        let (core, mut events) = core_with(socket, config, ChannelDispatcher::new());

        let receipt = core.send(remote_addr(), &[1], ReliabilityType::Reliable, 0).await.unwrap();

        let start = Instant::now();
        for seconds in 1..=5 {
            core.sweep(start + Duration::from_secs(seconds)).await;
        }

        assert_eq!(core.pending_ack_count().await, 0);
        assert_eq!(events.try_recv().unwrap(), TransportEvent::DeliveryFailed { peer: remote_addr(), packet_id: 0 });
        assert!(events.try_recv().is_err());
        assert!(matches!(receipt.delivered().await, Err(JuiceNetError::DeliveryFailure { packet_id: 0, retries: 2, .. })));
    }

    #[tokio::test]
    async fn test_sweep_expires_reassembly_and_evicts_idle_peer() {
        let mut config = localhost_config();
        config.reassembly_timeout = Duration::from_millis(100);
        config.peer_timeout = Duration::from_secs(1);
        let (socket, _) = recording_socket();
        let (core, mut events) = core_with(socket, config, ChannelDispatcher::new());

        let datagram = ContainerPacket {
            reliability: ReliabilityHeader::Unreliable,
            channel_id: 0,
            fragment: Some(FragmentHeader { fragmentation_id: 4, index: 0, is_last: false }),
            payload: vec![1],
        }.encode();
        core.on_datagram(remote_addr(), &datagram).await;

        let start = Instant::now();
        core.sweep(start + Duration::from_millis(500)).await;
        assert_eq!(events.try_recv().unwrap(), TransportEvent::ReassemblyTimedOut { peer: remote_addr(), fragmentation_id: 4 });
        assert_eq!(core.peers.len(), 1);

        core.sweep(start + Duration::from_secs(2)).await;
        assert_eq!(events.try_recv().unwrap(), TransportEvent::PeerEvicted { addr: remote_addr() });
        assert_eq!(core.peers.len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_flushes_ordering_window() {
        let mut config = localhost_config();
        config.ordering_flush_timeout = Some(Duration::from_millis(50));
        let (socket, _) = recording_socket();
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = ChannelDispatcher::new();
        dispatcher.set_unhandled(Some(handler.clone()));
        let (core, _) = core_with(socket, config, dispatcher);

        for order_id in [2u32, 1] {
            let datagram = ContainerPacket {
                reliability: ReliabilityHeader::ReliableOrdered { packet_id: order_id, packet_counter: order_id, order_id },
                channel_id: 4,
                fragment: None,
                payload: vec![order_id as u8],
            }.encode();
            core.on_datagram(remote_addr(), &datagram).await;
        }
        assert!(handler.received().is_empty());

        core.sweep(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(handler.payloads(), vec![vec![1], vec![2]]);
        assert!(handler.received().iter().all(|m| m.channel_id == 4));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_sends() {
        let (socket, _) = recording_socket();
        let (core, _) = core_with(socket, localhost_config(), ChannelDispatcher::new());

        let receipt = core.send(remote_addr(), &[1], ReliabilityType::Reliable, 0).await.unwrap();
        core.shutdown().await;

        assert!(matches!(receipt.delivered().await, Err(JuiceNetError::DeliveryCancelled { packet_id: 0, .. })));
        assert_eq!(core.pending_ack_count().await, 0);
    }

    fn client_handshake(peer_id: u64) -> Vec<u8> {
        let identity = PeerIdentity::local(peer_id, remote_addr().port(), Some("test"));
        let token = token_provider().sign_identity(&identity).unwrap();
        ClientHandshakePacket::new(token).encode().to_vec()
    }

    #[tokio::test]
    async fn test_restarted_peer_starts_from_scratch() {
        let (socket, sent) = recording_socket();
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = ChannelDispatcher::new();
        dispatcher.set_unhandled(Some(handler.clone()));
        let (core, mut events) = core_with(socket, localhost_config(), dispatcher);

        core.on_datagram(remote_addr(), &client_handshake(2)).await;
        for counter in 0..3u32 {
            core.on_datagram(remote_addr(), &reliable_packet(counter, counter, vec![counter as u8]).encode()).await;
        }
        let pending_receipt = core.send(remote_addr(), &[5], ReliabilityType::ReliableOrdered, 0).await.unwrap();

        core.on_datagram(remote_addr(), &client_handshake(3)).await;
        assert!(matches!(pending_receipt.delivered().await, Err(JuiceNetError::DeliveryCancelled { .. })));

        sent.lock().unwrap().clear();
        core.on_datagram(remote_addr(), &reliable_packet(0, 0, vec![42]).encode()).await;
        assert_eq!(handler.payloads(), vec![vec![0], vec![1], vec![2], vec![42]]);
        assert_eq!(AckPacket::decode(&sent.lock().unwrap()[0].1).unwrap(), AckPacket::single(0));

        // order ids towards the restarted peer start from scratch as well
        core.send(remote_addr(), &[6], ReliabilityType::ReliableOrdered, 0).await.unwrap();
        let sent_containers = decode_containers(&sent.lock().unwrap());
        assert!(matches!(sent_containers.last().unwrap().reliability, ReliabilityHeader::ReliableOrdered { order_id: 0, packet_counter: 0, .. }));

        assert!(matches!(events.try_recv().unwrap(), TransportEvent::PeerConnected { identity, .. } if identity.peer_id == 2));
        assert_eq!(events.try_recv().unwrap(), TransportEvent::PeerRestarted { addr: remote_addr(), previous_peer_id: 2, peer_id: 3 });
        assert!(matches!(events.try_recv().unwrap(), TransportEvent::PeerConnected { identity, .. } if identity.peer_id == 3));
    }

    #[tokio::test]
    async fn test_repeated_handshake_keeps_peer_state() {
        let (socket, _) = recording_socket();
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = ChannelDispatcher::new();
        dispatcher.set_unhandled(Some(handler.clone()));
        let (core, mut events) = core_with(socket, localhost_config(), dispatcher);

        core.on_datagram(remote_addr(), &client_handshake(2)).await;
        core.on_datagram(remote_addr(), &reliable_packet(0, 0, vec![1]).encode()).await;
        core.on_datagram(remote_addr(), &client_handshake(2)).await;
        core.on_datagram(remote_addr(), &reliable_packet(0, 0, vec![1]).encode()).await;

        assert_eq!(handler.payloads(), vec![vec![1]]);
        for _ in 0..2 {
            assert!(matches!(events.try_recv().unwrap(), TransportEvent::PeerConnected { .. }));
        }
        assert!(events.try_recv().is_err());
    }

    async fn started_end_point(config: JuiceNetConfig) -> (EndPoint, Arc<RecordingHandler>) {
        let end_point = EndPoint::new(config, token_provider()).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        end_point.set_unhandled_handler(Some(handler.clone()));
        end_point.start().await.unwrap();
        (end_point, handler)
    }

    #[rstest]
    #[case::unreliable(ReliabilityType::Unreliable, 0)]
    #[case::reliable(ReliabilityType::Reliable, 0)]
    #[case::reliable_ordered(ReliabilityType::ReliableOrdered, 255)]
    #[tokio::test]
    async fn test_send_over_localhost(#[case] reliability: ReliabilityType, #[case] channel_id: u8) {
        let (a, _) = started_end_point(localhost_config()).await;
        let (b, b_received) = started_end_point(localhost_config()).await;
        let b_addr = b.local_addr().unwrap();

        let receipt = a.send(b_addr, b"hello", reliability, channel_id).await.unwrap();
        receipt.delivered().await.unwrap();

        let received = b_received.wait_for(1, TIMEOUT).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, a.local_addr().unwrap());
        assert_eq!(received[0].channel_id, channel_id);
        assert_eq!(received[0].payload, b"hello".to_vec());
        assert_eq!(a.pending_ack_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_fragmented_over_localhost() {
        let (a, _) = started_end_point(localhost_config()).await;
        let (b, b_received) = started_end_point(localhost_config()).await;

        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let mut receipts = Vec::new();
        for _ in 0..3 {
            receipts.push(a.send(b.local_addr().unwrap(), &payload, ReliabilityType::ReliableOrdered, 1).await.unwrap());
        }
        for receipt in receipts {
            receipt.delivered().await.unwrap();
        }

        let received = b_received.wait_for(3, TIMEOUT).await;
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|m| m.payload == payload));
    }

    #[tokio::test]
    async fn test_reliable_send_without_receiver_fails() {
        let mut config = localhost_config();
        config.retry.max_retries = 2;
        config.retry.initial_retry_interval = Duration::from_millis(5);
        config.retry.max_retry_interval = Duration::from_millis(10);
        let (a, _) = started_end_point(config).await;
        let mut events = a.subscribe_events();

        // a socket that never acknowledges
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receipt = a.send(silent.local_addr().unwrap(), &[1], ReliabilityType::Reliable, 0).await.unwrap();

        assert!(matches!(receipt.delivered().await, Err(JuiceNetError::DeliveryFailure { retries: 2, .. })));
        assert_eq!(a.pending_ack_count().await, 0);

        let event = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, TransportEvent::DeliveryFailed { .. }));
    }

    #[rstest]
    #[case::enabled(true, 1)]
    #[case::disabled(false, 0)]
    #[tokio::test]
    async fn test_discovery_over_localhost(#[case] discovery_allowed: bool, #[case] expected_num_found: usize) {
        let (a, _) = started_end_point(localhost_config()).await;
        let mut b_config = localhost_config();
        b_config.discovery_allowed = discovery_allowed;
        let (b, _) = started_end_point(b_config).await;

        let found = a.search_at(b.local_addr().unwrap(), Duration::from_millis(300)).await.unwrap();
        assert_eq!(found.len(), expected_num_found);

        if let Some(peer) = found.first() {
            assert_eq!(peer.addr, b.local_addr().unwrap());
            assert_eq!(peer.identity.peer_id, b.peer_id());
            assert_eq!(peer.identity.port, b.local_addr().unwrap().port());
            assert_eq!(peer.identity.protocol_major, 1);
        }
    }

    #[tokio::test]
    async fn test_handshake_over_localhost() {
        let (a, _) = started_end_point(localhost_config()).await;
        let (b, _) = started_end_point(localhost_config()).await;
        let mut b_events = b.subscribe_events();

        let identity = a.connect(b.local_addr().unwrap(), TIMEOUT).await.unwrap();
        assert_eq!(identity.peer_id, b.peer_id());
        assert_eq!(a.peer_identity(b.local_addr().unwrap()).await.map(|i| i.peer_id), Some(b.peer_id()));

        let event = tokio::time::timeout(TIMEOUT, b_events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, TransportEvent::PeerConnected { identity, .. } if identity.peer_id == a.peer_id()));
    }

    /// sends every payload back to its sender from inside the handler
    struct ReplyingHandler {
        end_point: Weak<EndPoint>,
    }

    #[async_trait]
    impl ChannelHandler for ReplyingHandler {
        async fn on_message(&self, sender: SocketAddr, channel_id: u8, payload: &[u8]) {
            if let Some(end_point) = self.end_point.upgrade() {
                end_point.send(sender, payload, ReliabilityType::Reliable, channel_id).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_handler_can_reply_to_sender() {
        let (a, a_handler) = started_end_point(localhost_config()).await;
        let b = Arc::new(EndPoint::new(localhost_config(), token_provider()).unwrap());
        b.register_channel_handler(1, Arc::new(ReplyingHandler { end_point: Arc::downgrade(&b) }));
        b.start().await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(b_addr, &[7], ReliabilityType::Reliable, 1).await.unwrap();
        assert_eq!(a_handler.wait_for(1, TIMEOUT).await.len(), 1);

        // the receive loop of b is still alive
        a.send(b_addr, &[8], ReliabilityType::ReliableOrdered, 1).await.unwrap();
        let received = a_handler.wait_for(2, TIMEOUT).await;
        assert_eq!(received.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(), vec![vec![7], vec![8]]);
        assert!(received.iter().all(|m| m.sender == b_addr && m.channel_id == 1));
    }

    #[tokio::test]
    async fn test_handshake_with_untrusted_peer_fails() {
        let (a, _) = started_end_point(localhost_config()).await;
        let b = EndPoint::new(localhost_config(), Arc::new(HmacTokenProvider::random())).unwrap();
        b.start().await.unwrap();

        // b cannot verify a's token and does not answer
        let result = a.connect(b.local_addr().unwrap(), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(JuiceNetError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let end_point = EndPoint::new(localhost_config(), token_provider()).unwrap();
        assert_eq!(end_point.state(), EndPointState::Stopped);
        assert!(end_point.local_addr().is_none());
        assert!(matches!(end_point.send(remote_addr(), &[1], ReliabilityType::Unreliable, 0).await, Err(JuiceNetError::NotRunning)));

        end_point.start().await.unwrap();
        assert_eq!(end_point.state(), EndPointState::Running);
        assert!(end_point.local_addr().is_some());
        assert_eq!(end_point.local_identity().unwrap().peer_id, end_point.peer_id());
        assert!(matches!(end_point.start().await, Err(JuiceNetError::InvalidState(_))));

        end_point.stop().await.unwrap();
        assert_eq!(end_point.state(), EndPointState::Stopped);
        assert!(end_point.local_addr().is_none());

        end_point.start().await.unwrap();
        assert_eq!(end_point.state(), EndPointState::Running);
        end_point.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_crashes() {
        let mut config = localhost_config();
        // TEST-NET-1 is never assigned to a local interface
        config.bind_addr = SocketAddr::from(([192,0,2,1], 0));
        let end_point = EndPoint::new(config, token_provider()).unwrap();

        assert!(matches!(end_point.start().await, Err(JuiceNetError::BindFailure { .. })));
        assert_eq!(end_point.state(), EndPointState::Crashed);
        assert!(matches!(end_point.start().await, Err(JuiceNetError::InvalidState(_))));

        end_point.stop().await.unwrap();
        assert_eq!(end_point.state(), EndPointState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_sends() {
        let (a, _) = started_end_point(localhost_config()).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let receipt = a.send(silent.local_addr().unwrap(), &[1], ReliabilityType::Reliable, 0).await.unwrap();
        a.stop().await.unwrap();

        assert!(matches!(receipt.delivered().await, Err(JuiceNetError::DeliveryCancelled { .. })));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = localhost_config();
        config.sweep_interval = Duration::ZERO;
        assert!(EndPoint::new(config, token_provider()).is_err());
    }
}
