use crate::config::JuiceNetConfig;
use crate::identity::PeerIdentity;
use crate::ordering::OrderingWindow;
use crate::reassembly::FragmentReassembler;
use crate::reliability::{ReceivedCounterWindow, SendTracker};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Everything an endpoint keeps for one remote address
pub struct PeerState {
    pub addr: SocketAddr,
    pub send: SendTracker,
    pub received: ReceivedCounterWindow,
    pub reassembler: FragmentReassembler,
    ordering_windows: FxHashMap<u8, OrderingWindow>,
    pub last_seen: Instant,
    /// known after a handshake
    pub identity: Option<PeerIdentity>,
    evicted: bool,
}

impl PeerState {
    pub fn new(addr: SocketAddr, config: &JuiceNetConfig, now: Instant) -> PeerState {
        PeerState {
            addr,
            send: SendTracker::new(addr),
            received: ReceivedCounterWindow::new(config.max_counter_window),
            reassembler: FragmentReassembler::new(config.max_open_reassemblies),
            ordering_windows: FxHashMap::default(),
            last_seen: now,
            identity: None,
            evicted: false,
        }
    }

    pub fn ordering_window(&mut self, channel_id: u8, config: &JuiceNetConfig) -> &mut OrderingWindow {
        self.ordering_windows.entry(channel_id)
            .or_insert_with(|| OrderingWindow::new(config.effective_flush_timeout(channel_id)))
    }

    pub fn ordering_windows_mut(&mut self) -> impl Iterator<Item = (u8, &mut OrderingWindow)> {
        self.ordering_windows.iter_mut()
            .map(|(&channel_id, window)| (channel_id, window))
    }

    /// Discards all state exchanged with a previous incarnation of the peer: its packet
    ///  counters, order ids and fragmentation ids start from scratch. Pending sends are
    ///  cancelled, returning how many there were.
    pub fn reset_for_restarted_peer(&mut self, config: &JuiceNetConfig) -> usize {
        let num_cancelled = self.send.cancel_all();
        self.send = SendTracker::new(self.addr);
        self.received = ReceivedCounterWindow::new(config.max_counter_window);
        self.reassembler = FragmentReassembler::new(config.max_open_reassemblies);
        self.ordering_windows.clear();
        num_cancelled
    }

    /// A peer is idle if there was no traffic for `timeout` and there is nothing in flight
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
            && self.send.num_pending() == 0
            && self.reassembler.num_open_groups() == 0
            && self.ordering_windows.values().all(|w| w.num_buffered() == 0)
    }
}

/// The per-peer state of an endpoint. Each peer has its own lock, the table's lock is held
///  only for map operations.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<FxHashMap<SocketAddr, Arc<Mutex<PeerState>>>>,
}

impl PeerTable {
    pub fn len(&self) -> usize {
        self.peers.read().expect("lock is poisoned").len()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Mutex<PeerState>>> {
        self.peers.read()
            .expect("lock is poisoned")
            .get(addr)
            .cloned()
    }

    fn get_or_create(&self, addr: SocketAddr, config: &JuiceNetConfig) -> Arc<Mutex<PeerState>> {
        if let Some(peer) = self.get(&addr) {
            return peer;
        }

        self.peers.write()
            .expect("lock is poisoned")
            .entry(addr)
            .or_insert_with(|| {
                debug!("initializing state for peer {:?}", addr);
                Arc::new(Mutex::new(PeerState::new(addr, config, Instant::now())))
            })
            .clone()
    }

    /// Locks a peer's state, creating it if necessary. The returned state is guaranteed to be
    ///  part of the table, i.e. not concurrently evicted.
    pub async fn lock(&self, addr: SocketAddr, config: &JuiceNetConfig) -> OwnedMutexGuard<PeerState> {
        loop {
            let peer = self.get_or_create(addr, config).lock_owned().await;
            if !peer.evicted {
                return peer;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Mutex<PeerState>>> {
        self.peers.read()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Removes a peer while its lock is held, so that concurrent lockers re-create it
    pub fn evict(&self, peer: &mut PeerState) {
        peer.evicted = true;
        self.peers.write()
            .expect("lock is poisoned")
            .remove(&peer.addr);
    }

    pub fn clear(&self) -> Vec<Arc<Mutex<PeerState>>> {
        self.peers.write()
            .expect("lock is poisoned")
            .drain()
            .map(|(_, peer)| peer)
            .collect()
    }
}
