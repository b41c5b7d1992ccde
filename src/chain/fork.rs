// Fork manager
//
// Tracks, per chain, the main-chain vector (index == height) and every
// known side branch as an ordered hash list rooted at a main-chain block.
// Classification is pure; the consensus orchestrator validates and
// applies state changes, then records the outcome here. Fork choice is
// strictly-greater cumulative work: ties keep the incumbent tip.

use std::collections::{HashMap, HashSet, VecDeque};

use primitive_types::U256;

use crate::crypto::hash::Hash;
use crate::primitives::block::Block;

/// Ordered state-change events a reorganization emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Disconnect(Hash),
    Connect(Hash),
}

/// How a new validated header relates to the known tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Duplicate,
    /// Parent is the current tip: connect directly.
    Extended,
    /// Recorded on a branch that is not (yet) the heaviest.
    SideChain,
    /// The branch outweighs the main chain. Disconnect the listed hashes
    /// tip-first, then connect the branch ancestor-first.
    Reorg {
        disconnect: Vec<Hash>,
        connect: Vec<Hash>,
    },
    UnknownParent,
}

#[derive(Debug)]
pub struct ForkManager {
    main: Vec<Hash>,
    /// side tip → ordered branch hashes, root child first. The parent of
    /// branch[0] is always on the main chain.
    side: HashMap<Hash, Vec<Hash>>,
    parent_of: HashMap<Hash, Hash>,
    height_of: HashMap<Hash, u64>,
    /// Cumulative work up to and including each known block.
    work_of: HashMap<Hash, U256>,
}

impl ForkManager {
    pub fn new(genesis: Hash, genesis_work: U256) -> Self {
        let mut height_of = HashMap::new();
        height_of.insert(genesis, 0);
        let mut work_of = HashMap::new();
        work_of.insert(genesis, genesis_work);
        ForkManager {
            main: vec![genesis],
            side: HashMap::new(),
            parent_of: HashMap::new(),
            height_of,
            work_of,
        }
    }

    /// Rebuild the main chain from stored hashes at startup.
    pub fn from_main_chain(hashes: Vec<Hash>, cumulative_works: Vec<U256>) -> Self {
        debug_assert_eq!(hashes.len(), cumulative_works.len());
        debug_assert!(!hashes.is_empty());
        let mut parent_of = HashMap::new();
        let mut height_of = HashMap::new();
        let mut work_of = HashMap::new();
        for (h, (hash, work)) in hashes.iter().zip(cumulative_works.iter()).enumerate() {
            height_of.insert(*hash, h as u64);
            work_of.insert(*hash, *work);
            if h > 0 {
                parent_of.insert(*hash, hashes[h - 1]);
            }
        }
        ForkManager {
            main: hashes,
            side: HashMap::new(),
            parent_of,
            height_of,
            work_of,
        }
    }

    pub fn tip(&self) -> Hash {
        *self.main.last().expect("main chain never empty")
    }

    pub fn tip_height(&self) -> u64 {
        (self.main.len() - 1) as u64
    }

    pub fn tip_work(&self) -> U256 {
        self.work_of[&self.tip()]
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.height_of.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.height_of.get(hash).copied()
    }

    pub fn work_of(&self, hash: &Hash) -> Option<U256> {
        self.work_of.get(hash).copied()
    }

    pub fn is_on_main(&self, hash: &Hash) -> bool {
        self.height_of
            .get(hash)
            .is_some_and(|h| self.main.get(*h as usize) == Some(hash))
    }

    pub fn main_hash_at(&self, height: u64) -> Option<Hash> {
        self.main.get(height as usize).copied()
    }

    /// Geometric-backoff locator over the main chain: the last ten
    /// blocks, then doubling steps back to genesis.
    pub fn locator(&self) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut height = self.tip_height() as i64;
        let mut step = 1i64;
        while height > 0 {
            hashes.push(self.main[height as usize]);
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.main[0]);
        hashes
    }

    /// Height of the deepest side-branch root; pruning must not cross it.
    pub fn deepest_side_root_height(&self) -> Option<u64> {
        self.side
            .values()
            .filter_map(|branch| {
                let root_parent = self.parent_of.get(branch.first()?)?;
                self.height_of.get(root_parent).copied()
            })
            .min()
    }

    /// Pure classification of a validated header against the tree.
    pub fn classify(&self, hash: &Hash, parent: &Hash, block_work: U256) -> Acceptance {
        if self.contains(hash) {
            return Acceptance::Duplicate;
        }
        let Some(parent_work) = self.work_of.get(parent) else {
            return Acceptance::UnknownParent;
        };
        if *parent == self.tip() {
            return Acceptance::Extended;
        }
        let work = parent_work.saturating_add(block_work);
        if work > self.tip_work() {
            let (disconnect, connect) = self.reorg_paths(hash, parent);
            Acceptance::Reorg {
                disconnect,
                connect,
            }
        } else {
            Acceptance::SideChain
        }
    }

    /// Walk from `parent` down to the lowest common ancestor on main,
    /// producing tip-first disconnects and ancestor-first connects.
    fn reorg_paths(&self, new_hash: &Hash, parent: &Hash) -> (Vec<Hash>, Vec<Hash>) {
        let mut branch = vec![*new_hash];
        let mut cursor = *parent;
        while !self.is_on_main(&cursor) {
            branch.push(cursor);
            cursor = self.parent_of[&cursor];
        }
        branch.reverse();
        let ancestor_height = self.height_of[&cursor];

        let disconnect: Vec<Hash> = self.main[(ancestor_height as usize + 1)..]
            .iter()
            .rev()
            .copied()
            .collect();
        (disconnect, branch)
    }

    /// Record a block that extended the main tip.
    pub fn record_extend(&mut self, hash: Hash, block_work: U256) {
        let parent = self.tip();
        let height = self.tip_height() + 1;
        let work = self.work_of[&parent].saturating_add(block_work);
        self.parent_of.insert(hash, parent);
        self.height_of.insert(hash, height);
        self.work_of.insert(hash, work);
        self.main.push(hash);
    }

    /// Record a block on a side branch (parent already known, not tip).
    pub fn record_side(&mut self, hash: Hash, parent: Hash, block_work: U256) {
        let height = self.height_of[&parent] + 1;
        let work = self.work_of[&parent].saturating_add(block_work);
        self.parent_of.insert(hash, parent);
        self.height_of.insert(hash, height);
        self.work_of.insert(hash, work);

        // Extend an existing branch whose tip is the parent, or start a
        // fresh branch by walking back to the main chain.
        if let Some(mut branch) = self.side.remove(&parent) {
            branch.push(hash);
            self.side.insert(hash, branch);
        } else {
            let mut branch = vec![hash];
            let mut cursor = parent;
            while !self.is_on_main(&cursor) {
                branch.push(cursor);
                cursor = self.parent_of[&cursor];
            }
            branch.reverse();
            self.side.insert(hash, branch);
        }
    }

    /// Swap the main chain to the (already applied) branch ending at
    /// `new_tip`. The displaced suffix becomes a side branch.
    pub fn promote(&mut self, new_tip: &Hash) {
        let Some(branch) = self.side.remove(new_tip) else {
            return;
        };
        let ancestor_height = self.height_of[&self.parent_of[&branch[0]]];
        let old_suffix: Vec<Hash> = self.main[(ancestor_height as usize + 1)..].to_vec();
        if let Some(old_tip) = old_suffix.last() {
            self.side.insert(*old_tip, old_suffix.clone());
        }
        self.main.truncate(ancestor_height as usize + 1);
        self.main.extend(branch);
    }

    /// Forget an invalid branch. Blocks shared with other branches or
    /// the main chain are kept.
    pub fn remove_branch(&mut self, tip: &Hash) {
        let Some(branch) = self.side.remove(tip) else {
            return;
        };
        let shared: HashSet<Hash> = self
            .side
            .values()
            .flat_map(|b| b.iter().copied())
            .collect();
        for hash in branch {
            if !shared.contains(&hash) && !self.is_on_main(&hash) {
                self.parent_of.remove(&hash);
                self.height_of.remove(&hash);
                self.work_of.remove(&hash);
            }
        }
    }
}

/// Blocks whose parent is unknown, keyed by the missing parent. Bounded;
/// the oldest entry is evicted first.
#[derive(Debug)]
pub struct OrphanPool {
    by_parent: HashMap<Hash, Vec<Block>>,
    order: VecDeque<(Hash, Hash)>, // (parent, orphan hash) in arrival order
    members: HashSet<Hash>,
    capacity: usize,
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        OrphanPool {
            by_parent: HashMap::new(),
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.members.contains(hash)
    }

    /// Insert an orphan; duplicates are ignored. Evicts the oldest entry
    /// beyond capacity.
    pub fn insert(&mut self, block: Block) -> bool {
        let hash = block.hash();
        if !self.members.insert(hash) {
            return false;
        }
        let parent = block.header.previous_hash;
        self.by_parent.entry(parent).or_default().push(block);
        self.order.push_back((parent, hash));

        while self.members.len() > self.capacity {
            if let Some((old_parent, old_hash)) = self.order.pop_front() {
                self.members.remove(&old_hash);
                if let Some(list) = self.by_parent.get_mut(&old_parent) {
                    list.retain(|b| b.hash() != old_hash);
                    if list.is_empty() {
                        self.by_parent.remove(&old_parent);
                    }
                }
            }
        }
        true
    }

    /// Remove and return every orphan waiting on `parent`.
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        for child in &children {
            let hash = child.hash();
            self.members.remove(&hash);
            self.order.retain(|(_, h)| *h != hash);
        }
        children
    }
}
