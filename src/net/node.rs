// P2P node
//
// Owns the listener, the peer table and the sync manager, and drives the
// network event loop: peer events in, consensus commands out, gossip to
// everyone else. Consensus state is never touched here; every block and
// transaction goes through the consensus task's queue.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::chain::consensus::{BlockDisposition, BlockSelector};
use crate::error::{ErrorKind, NodeError};
use crate::net::peer::{CloseReason, OUTBOUND_QUEUE, PeerEvent, PeerId, PeerTask};
use crate::net::protocol::{
    InvItem, InvKind, LocatorQuery, MAX_HEADERS_PER_MSG, Message, PROTOCOL_VERSION, RejectPayload,
    VersionPayload,
};
use crate::net::sync::{DEFAULT_GETDATA_WINDOW, SyncManager};
use crate::node::ConsensusHandle;
use crate::crypto::hash::Hash;
use crate::primitives::coin::ChainTag;

pub const DEFAULT_MAX_PEERS: usize = 125;
pub const DEFAULT_MIN_PEERS: usize = 8;
const BAN_DURATION: Duration = Duration::from_secs(600);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(15);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_KNOWN_ADDRS: usize = 1000;
const MAX_ADDRS_SHARED: usize = 100;

#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub listen_address: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,
    pub max_peers: usize,
    pub min_peers: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            listen_address: "0.0.0.0:7530".parse().expect("static address"),
            bootstrap_peers: Vec::new(),
            max_peers: DEFAULT_MAX_PEERS,
            min_peers: DEFAULT_MIN_PEERS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub address: PeerId,
    pub is_outbound: bool,
    pub ready: bool,
    pub golden_height: u64,
    pub silver_height: u64,
}

struct PeerMeta {
    outbound: mpsc::Sender<Message>,
    close: watch::Sender<bool>,
    is_outbound: bool,
    ready: bool,
    version: Option<VersionPayload>,
}

#[derive(Debug)]
pub enum P2pCommand {
    Connect(SocketAddr),
}

/// Cheaply cloneable handle other tasks use to reach the network.
#[derive(Clone)]
pub struct P2pHandle {
    commands: mpsc::Sender<P2pCommand>,
    peers: Arc<Mutex<HashMap<PeerId, PeerMeta>>>,
}

impl P2pHandle {
    pub async fn command(&self, cmd: P2pCommand) -> Result<(), ()> {
        self.commands.send(cmd).await.map_err(|_| ())
    }

    /// Queue a message to every Ready peer. Full queues drop the frame;
    /// a lagging peer must not stall gossip.
    pub async fn broadcast(&self, msg: Message) {
        let peers = self.peers.lock().await;
        for meta in peers.values().filter(|m| m.ready) {
            let _ = meta.outbound.try_send(msg.clone());
        }
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .map(|(id, meta)| PeerSummary {
                address: *id,
                is_outbound: meta.is_outbound,
                ready: meta.ready,
                golden_height: meta.version.as_ref().map_or(0, |v| v.golden_height),
                silver_height: meta.version.as_ref().map_or(0, |v| v.silver_height),
            })
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }
}

pub struct P2PNode {
    config: P2pConfig,
    consensus: ConsensusHandle,
    peers: Arc<Mutex<HashMap<PeerId, PeerMeta>>>,
    known_addrs: HashSet<SocketAddr>,
    banned: HashMap<IpAddr, tokio::time::Instant>,
    sync: SyncManager,
    our_nonce: u64,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    commands_rx: mpsc::Receiver<P2pCommand>,
    dialed_tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    dialed_rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    shutdown: watch::Receiver<bool>,
}

impl P2PNode {
    pub fn new(
        config: P2pConfig,
        consensus: ConsensusHandle,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, P2pHandle) {
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (dialed_tx, dialed_rx) = mpsc::channel(16);
        let known_addrs: HashSet<SocketAddr> = config.bootstrap_peers.iter().copied().collect();
        let node = P2PNode {
            config,
            consensus,
            peers: Arc::clone(&peers),
            known_addrs,
            banned: HashMap::new(),
            sync: SyncManager::new(DEFAULT_GETDATA_WINDOW),
            our_nonce: {
                let mut nonce = [0u8; 8];
                getrandom::getrandom(&mut nonce).expect("os rng available");
                u64::from_le_bytes(nonce)
            },
            events_tx,
            events_rx,
            commands_rx,
            dialed_tx,
            dialed_rx,
            shutdown,
        };
        let handle = P2pHandle {
            commands: commands_tx,
            peers,
        };
        (node, handle)
    }

    fn our_version(&self) -> VersionPayload {
        let snapshot = self.consensus.snapshot();
        VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            services: 1,
            timestamp: crate::chain::consensus::unix_now(),
            nonce: self.our_nonce,
            listen_addr: Some(self.config.listen_address),
            golden_height: snapshot
                .tips
                .get(&ChainTag::Golden)
                .map_or(0, |t| t.height),
            silver_height: snapshot
                .tips
                .get(&ChainTag::Silver)
                .map_or(0, |t| t.height),
        }
    }

    pub async fn run(mut self) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.config.listen_address)
            .await
            .map_err(|_| NodeError::ResourceExhausted("cannot bind listen address"))?;
        info!(target: "net", addr = %self.config.listen_address, "listening for peers");

        for seed in self.config.bootstrap_peers.clone() {
            self.dial(seed).await;
        }

        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!(target: "net", "network shutting down");
                    let peers = self.peers.lock().await;
                    for meta in peers.values() {
                        let _ = meta.close.send(true);
                    }
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.maybe_accept(stream, addr).await,
                        Err(err) => warn!(target: "net", %err, "accept failed"),
                    }
                }
                Some((stream, addr)) = self.dialed_rx.recv() => {
                    self.register_peer(stream, addr, true).await;
                }
                Some(cmd) = self.commands_rx.recv() => {
                    match cmd {
                        P2pCommand::Connect(addr) => self.dial(addr).await,
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    if let Err(err) = self.handle_event(event).await {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        warn!(target: "net", %err, "event handling failed");
                    }
                }
                _ = maintenance.tick() => {
                    self.maintain().await;
                }
            }
        }
        Ok(())
    }

    fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned
            .get(&addr.ip())
            .is_some_and(|until| tokio::time::Instant::now() < *until)
    }

    async fn maybe_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.is_banned(&addr) {
            debug!(target: "net", peer = %addr, "rejecting banned peer");
            return;
        }
        let peers = self.peers.lock().await;
        if peers.len() >= self.config.max_peers {
            debug!(target: "net", peer = %addr, "peer table full");
            return;
        }
        drop(peers);
        self.register_peer(stream, addr, false).await;
    }

    async fn register_peer(&mut self, stream: TcpStream, addr: SocketAddr, is_outbound: bool) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (close_tx, close_rx) = watch::channel(false);

        // Merge the global shutdown into the per-peer close signal
        let mut global = self.shutdown.clone();
        let close_for_merge = close_tx.clone();
        tokio::spawn(async move {
            if global.changed().await.is_ok() {
                let _ = close_for_merge.send(true);
            }
        });

        let task = PeerTask {
            id: addr,
            is_outbound,
            our_version: self.our_version(),
            our_nonce: self.our_nonce,
            ping_interval: crate::net::peer::PING_INTERVAL,
            events: self.events_tx.clone(),
            shutdown: close_rx,
        };
        tokio::spawn(task.run(stream, out_tx.clone(), out_rx));

        self.peers.lock().await.insert(
            addr,
            PeerMeta {
                outbound: out_tx,
                close: close_tx,
                is_outbound,
                ready: false,
                version: None,
            },
        );
        debug!(target: "net", peer = %addr, is_outbound, "peer registered");
    }

    async fn dial(&mut self, addr: SocketAddr) {
        if self.is_banned(&addr) || self.peers.lock().await.contains_key(&addr) {
            return;
        }
        if addr == self.config.listen_address {
            return;
        }
        let dialed = self.dialed_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = dialed.send((stream, addr)).await;
                }
                Ok(Err(err)) => debug!(target: "net", peer = %addr, %err, "dial failed"),
                Err(_) => debug!(target: "net", peer = %addr, "dial timed out"),
            }
        });
    }

    async fn send_to(&self, id: &PeerId, msg: Message) {
        let peers = self.peers.lock().await;
        if let Some(meta) = peers.get(id) {
            let _ = meta.outbound.try_send(msg);
        }
    }

    async fn relay_from(&self, origin: &PeerId, msg: Message) {
        let peers = self.peers.lock().await;
        for (id, meta) in peers.iter().filter(|(_, m)| m.ready) {
            if id != origin {
                let _ = meta.outbound.try_send(msg.clone());
            }
        }
    }

    async fn ready_peer_ids(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .await
            .iter()
            .filter(|(_, m)| m.ready)
            .map(|(id, _)| *id)
            .collect()
    }

    async fn flush_sync(&mut self) {
        let peers = self.ready_peer_ids().await;
        for (id, msg) in self.sync.schedule(&peers) {
            self.send_to(&id, msg).await;
        }
    }

    async fn close_peer(&mut self, id: &PeerId, ban: bool) {
        if ban {
            self.banned
                .insert(id.ip(), tokio::time::Instant::now() + BAN_DURATION);
        }
        let peers = self.peers.lock().await;
        if let Some(meta) = peers.get(id) {
            let _ = meta.close.send(true);
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) -> Result<(), NodeError> {
        match event {
            PeerEvent::Ready(id, version) => {
                {
                    let mut peers = self.peers.lock().await;
                    if let Some(meta) = peers.get_mut(&id) {
                        meta.ready = true;
                        meta.version = Some(version.clone());
                    }
                }
                if let Some(listen) = version.listen_addr {
                    self.learn_addr(listen);
                }
                info!(target: "net", peer = %id, "peer ready");
                // Catch up: ask for headers on both chains, and for more
                // peer addresses
                for chain in ChainTag::ALL {
                    let locator = self.consensus.locator(chain).await?;
                    self.send_to(
                        &id,
                        Message::GetHeaders(LocatorQuery {
                            chain,
                            locator,
                            stop: Hash::ZERO,
                        }),
                    )
                    .await;
                }
                self.send_to(&id, Message::GetAddr).await;
            }
            PeerEvent::Closed(id, reason) => {
                self.peers.lock().await.remove(&id);
                self.sync.on_peer_closed(&id);
                if let CloseReason::Misbehaved(why) = &reason {
                    warn!(target: "net", peer = %id, why, "banning misbehaving peer");
                    self.banned
                        .insert(id.ip(), tokio::time::Instant::now() + BAN_DURATION);
                }
                self.flush_sync().await;
            }
            PeerEvent::Message(id, msg) => {
                self.handle_message(id, msg).await?;
            }
        }
        Ok(())
    }

    fn learn_addr(&mut self, addr: SocketAddr) {
        if self.known_addrs.len() < MAX_KNOWN_ADDRS && addr != self.config.listen_address {
            self.known_addrs.insert(addr);
        }
    }

    async fn handle_message(&mut self, id: PeerId, msg: Message) -> Result<(), NodeError> {
        match msg {
            Message::Inv(items) => {
                let mut unknown_blocks = Vec::new();
                let mut wanted_txs = Vec::new();
                for item in items {
                    match item.kind {
                        InvKind::Block => {
                            if !self.consensus.has_block(item.chain, item.hash).await? {
                                unknown_blocks.push(item);
                            }
                        }
                        InvKind::Tx => {
                            let in_pool = self
                                .consensus
                                .get_mempool_transaction(item.hash)
                                .await?
                                .is_some();
                            let confirmed =
                                self.consensus.get_transaction(item.hash).await?.is_some();
                            if !in_pool && !confirmed {
                                wanted_txs.push(item);
                            }
                        }
                    }
                }
                self.sync.on_inv(&unknown_blocks, |_, _| false);
                if !wanted_txs.is_empty() {
                    self.send_to(&id, Message::GetData(wanted_txs)).await;
                }
                self.flush_sync().await;
            }
            Message::GetData(items) => {
                let mut not_found = Vec::new();
                for item in items {
                    match item.kind {
                        InvKind::Block => {
                            match self
                                .consensus
                                .get_block(item.chain, BlockSelector::Id(item.hash))
                                .await?
                            {
                                Some(block) => self.send_to(&id, Message::Block(block)).await,
                                None => not_found.push(item),
                            }
                        }
                        InvKind::Tx => {
                            let tx = match self
                                .consensus
                                .get_mempool_transaction(item.hash)
                                .await?
                            {
                                Some(tx) => Some(tx),
                                None => self
                                    .consensus
                                    .get_transaction(item.hash)
                                    .await?
                                    .map(|(_, tx)| tx),
                            };
                            match tx {
                                Some(tx) => self.send_to(&id, Message::Tx(tx)).await,
                                None => not_found.push(item),
                            }
                        }
                    }
                }
                if !not_found.is_empty() {
                    self.send_to(&id, Message::NotFound(not_found)).await;
                }
            }
            Message::NotFound(items) => {
                self.sync.on_notfound(&id, &items);
                self.flush_sync().await;
            }
            Message::GetHeaders(q) => {
                let headers = self
                    .consensus
                    .headers_after(q.chain, q.locator, q.stop, MAX_HEADERS_PER_MSG)
                    .await?;
                self.send_to(&id, Message::Headers(q.chain, headers)).await;
            }
            Message::GetBlocks(q) => {
                let headers = self
                    .consensus
                    .headers_after(q.chain, q.locator, q.stop, MAX_HEADERS_PER_MSG)
                    .await?;
                let items: Vec<InvItem> = headers
                    .iter()
                    .map(|h| InvItem::block(q.chain, h.hash()))
                    .collect();
                self.send_to(&id, Message::Inv(items)).await;
            }
            Message::Headers(chain, headers) => {
                // Cheap parallel PoW screen before any bookkeeping; the
                // lenient multiplier of 1 only filters outright garbage
                use rayon::prelude::*;
                let plausible = headers
                    .par_iter()
                    .all(|h| h.height == 0 || crate::pow::engine::validate_header_pow(h, 1));
                if !plausible {
                    self.close_peer(&id, true).await;
                    return Ok(());
                }
                let mut unknown = Vec::new();
                for header in &headers {
                    if header.chain != chain {
                        self.close_peer(&id, true).await;
                        return Ok(());
                    }
                    if !self.consensus.has_block(chain, header.hash()).await? {
                        unknown.push(*header);
                    }
                }
                let queued = self.sync.on_headers(chain, &unknown, |_| false);
                debug!(target: "net", peer = %id, %chain, received = headers.len(), queued, "headers");
                // A full batch means there is probably more behind it
                if headers.len() == MAX_HEADERS_PER_MSG
                    && let Some(last) = headers.last()
                {
                    self.send_to(
                        &id,
                        Message::GetHeaders(LocatorQuery {
                            chain,
                            locator: vec![last.hash()],
                            stop: Hash::ZERO,
                        }),
                    )
                    .await;
                }
                self.flush_sync().await;
            }
            Message::Block(block) => {
                let chain = block.header.chain;
                let hash = block.hash();
                self.sync.on_block(&id, chain, &hash);
                match self.consensus.process_block(block).await {
                    Ok(outcome) => match outcome.disposition {
                        BlockDisposition::Connected
                        | BlockDisposition::Reorganized { .. } => {
                            self.relay_from(&id, Message::Inv(vec![InvItem::block(chain, hash)]))
                                .await;
                        }
                        BlockDisposition::Orphaned => {
                            // Find the missing ancestry from this peer
                            let locator = self.consensus.locator(chain).await?;
                            self.send_to(
                                &id,
                                Message::GetHeaders(LocatorQuery {
                                    chain,
                                    locator,
                                    stop: Hash::ZERO,
                                }),
                            )
                            .await;
                        }
                        BlockDisposition::SideChained | BlockDisposition::Duplicate => {}
                    },
                    Err(err) => {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        let kind = err.kind();
                        self.send_to(
                            &id,
                            Message::Reject(RejectPayload {
                                command: "block".into(),
                                code: kind.code().into(),
                                reason: err.to_string(),
                            }),
                        )
                        .await;
                        if matches!(kind, ErrorKind::BlockInvalid | ErrorKind::TxInvalid) {
                            // Demote the origin of an invalid block
                            self.close_peer(&id, false).await;
                        }
                    }
                }
                self.flush_sync().await;
            }
            Message::Tx(tx) => {
                let txid = tx.txid();
                match self.consensus.submit_transaction(tx).await {
                    Ok(_) => {
                        for chain in ChainTag::ALL {
                            self.relay_from(&id, Message::Inv(vec![InvItem::tx(chain, txid)]))
                                .await;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::TxInvalid => {
                        self.send_to(
                            &id,
                            Message::Reject(RejectPayload {
                                command: "tx".into(),
                                code: err.kind().code().into(),
                                reason: err.to_string(),
                            }),
                        )
                        .await;
                    }
                    Err(err) => {
                        debug!(target: "net", %err, "transaction dropped");
                    }
                }
            }
            Message::Addr(addrs) => {
                for addr in addrs {
                    self.learn_addr(addr);
                }
            }
            Message::GetAddr => {
                let addrs: Vec<SocketAddr> = self
                    .known_addrs
                    .iter()
                    .take(MAX_ADDRS_SHARED)
                    .copied()
                    .collect();
                if !addrs.is_empty() {
                    self.send_to(&id, Message::Addr(addrs)).await;
                }
            }
            Message::Reject(reject) => {
                warn!(target: "net", peer = %id, command = %reject.command, code = %reject.code, reason = %reject.reason, "peer rejected our message");
            }
            // The peer task consumes handshake and keep-alive traffic;
            // seeing it here means the peer repeated it out of order.
            Message::Version(_) | Message::Verack | Message::Ping(_) | Message::Pong(_) => {
                self.close_peer(&id, true).await;
            }
        }
        Ok(())
    }

    async fn maintain(&mut self) {
        let now = tokio::time::Instant::now();
        self.banned.retain(|_, until| *until > now);

        let (connected, outbound): (usize, usize) = {
            let peers = self.peers.lock().await;
            (
                peers.len(),
                peers.values().filter(|m| m.is_outbound).count(),
            )
        };
        if outbound < self.config.min_peers && connected < self.config.max_peers {
            let connected_ids: HashSet<SocketAddr> =
                self.peers.lock().await.keys().copied().collect();
            let candidates: Vec<SocketAddr> = self
                .known_addrs
                .iter()
                .filter(|a| !connected_ids.contains(a))
                .take(self.config.min_peers - outbound)
                .copied()
                .collect();
            for addr in candidates {
                self.dial(addr).await;
            }
        }
        self.flush_sync().await;
    }
}
