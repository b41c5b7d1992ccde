// Header-first synchronization
//
// A behind node asks for headers, queues the bodies it is missing, and
// fetches them from several peers in sliding getdata windows. Pure
// bookkeeping: the network event loop feeds it messages and sends out
// whatever it schedules. Blocks whose parents are unknown at validation
// time are the orphan pool's business, not ours.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::crypto::hash::Hash;
use crate::net::peer::PeerId;
use crate::net::protocol::{InvItem, InvKind, Message};
use crate::primitives::block::BlockHeader;
use crate::primitives::coin::ChainTag;

/// Bodies requested from one peer at a time.
pub const DEFAULT_GETDATA_WINDOW: usize = 16;

#[derive(Debug)]
pub struct SyncManager {
    window: usize,
    /// Bodies wanted, per chain, oldest first.
    wanted: HashMap<ChainTag, VecDeque<Hash>>,
    /// Outstanding requests per peer.
    in_flight: HashMap<PeerId, HashSet<(ChainTag, Hash)>>,
    /// Everything wanted or in flight, for dedupe.
    pending: HashSet<Hash>,
}

impl SyncManager {
    pub fn new(window: usize) -> Self {
        let mut wanted = HashMap::new();
        for chain in ChainTag::ALL {
            wanted.insert(chain, VecDeque::new());
        }
        SyncManager {
            window: window.max(1),
            wanted,
            in_flight: HashMap::new(),
            pending: HashSet::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn queue(&mut self, chain: ChainTag, hash: Hash) -> bool {
        if !self.pending.insert(hash) {
            return false;
        }
        self.wanted.get_mut(&chain).expect("all chains present").push_back(hash);
        true
    }

    /// Register headers received from a peer. Returns how many bodies
    /// were newly queued.
    pub fn on_headers(
        &mut self,
        chain: ChainTag,
        headers: &[BlockHeader],
        already_have: impl Fn(&Hash) -> bool,
    ) -> usize {
        let mut queued = 0;
        for header in headers {
            if header.chain != chain {
                continue;
            }
            let hash = header.hash();
            if already_have(&hash) {
                continue;
            }
            if self.queue(chain, hash) {
                queued += 1;
            }
        }
        queued
    }

    /// Register gossiped block inventory. Returns how many were queued.
    pub fn on_inv(
        &mut self,
        items: &[InvItem],
        already_have: impl Fn(ChainTag, &Hash) -> bool,
    ) -> usize {
        let mut queued = 0;
        for item in items {
            if item.kind != InvKind::Block {
                continue;
            }
            if already_have(item.chain, &item.hash) {
                continue;
            }
            if self.queue(item.chain, item.hash) {
                queued += 1;
            }
        }
        queued
    }

    /// A requested body arrived (or was rejected); clear it.
    pub fn on_block(&mut self, peer: &PeerId, chain: ChainTag, hash: &Hash) {
        self.pending.remove(hash);
        if let Some(set) = self.in_flight.get_mut(peer) {
            set.remove(&(chain, *hash));
            if set.is_empty() {
                self.in_flight.remove(peer);
            }
        }
    }

    /// The peer does not have what we asked for; hand the work to others.
    pub fn on_notfound(&mut self, peer: &PeerId, items: &[InvItem]) {
        for item in items {
            if item.kind != InvKind::Block {
                continue;
            }
            if let Some(set) = self.in_flight.get_mut(peer)
                && set.remove(&(item.chain, item.hash))
            {
                // Still pending; requeue for another peer
                self.wanted
                    .get_mut(&item.chain)
                    .expect("all chains present")
                    .push_back(item.hash);
            }
        }
    }

    /// Requeue everything a vanished peer owed us.
    pub fn on_peer_closed(&mut self, peer: &PeerId) {
        let Some(set) = self.in_flight.remove(peer) else {
            return;
        };
        for (chain, hash) in set {
            self.wanted
                .get_mut(&chain)
                .expect("all chains present")
                .push_back(hash);
        }
    }

    /// Top up every peer's sliding window from the wanted queues.
    pub fn schedule(&mut self, peers: &[PeerId]) -> Vec<(PeerId, Message)> {
        let mut out = Vec::new();
        for peer in peers {
            let used = self.in_flight.get(peer).map_or(0, HashSet::len);
            let mut capacity = self.window.saturating_sub(used);
            if capacity == 0 {
                continue;
            }
            let mut items = Vec::new();
            for chain in ChainTag::ALL {
                while capacity > 0 {
                    let Some(hash) = self
                        .wanted
                        .get_mut(&chain)
                        .expect("all chains present")
                        .pop_front()
                    else {
                        break;
                    };
                    // Could have been satisfied by another path meanwhile
                    if !self.pending.contains(&hash) {
                        continue;
                    }
                    items.push(InvItem::block(chain, hash));
                    self.in_flight
                        .entry(*peer)
                        .or_default()
                        .insert((chain, hash));
                    capacity -= 1;
                }
            }
            if !items.is_empty() {
                out.push((*peer, Message::GetData(items)));
            }
        }
        out
    }
}
