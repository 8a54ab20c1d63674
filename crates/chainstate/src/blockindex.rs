//! The in-memory block tree.
//!
//! Entries live in an arena addressed by 32-bit handles; predecessor and
//! skip relations are handle lookups and the whole arena drops at once on
//! shutdown. Mutations go through [`BlockIndex::modify`] so the dirty set
//! stays accurate for the next flush.

use std::collections::{BTreeSet, HashMap, HashSet};

use plbd_consensus::Hash256;
use plbd_primitives::block::BlockHeader;
use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};
use primitive_types::U256;

use crate::flatfiles::FileLocation;

pub type Handle = u32;

pub mod status {
    /// Validity levels occupy the low three bits and only ever increase.
    pub const VALID_TREE: u32 = 1;
    pub const VALID_TRANSACTIONS: u32 = 2;
    pub const VALID_CHAIN: u32 = 3;
    pub const VALID_SCRIPTS: u32 = 4;
    pub const VALIDITY_MASK: u32 = 0x07;

    pub const HAVE_DATA: u32 = 1 << 3;
    pub const HAVE_UNDO: u32 = 1 << 4;
    pub const OPT_WITNESS: u32 = 1 << 5;
    pub const FAILED_VALID: u32 = 1 << 6;
    pub const FAILED_CHILD: u32 = 1 << 7;
    pub const FAILED_MASK: u32 = FAILED_VALID | FAILED_CHILD;
}

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub prev: Option<Handle>,
    pub skip: Option<Handle>,
    pub height: i32,
    /// Cumulative work up to and including this header.
    pub work: U256,
    /// Maximum block time over this entry and all ancestors.
    pub time_max: u32,
    pub status: u32,
    pub tx_count: u32,
    /// Cumulative transaction count; zero while an ancestor lacks data.
    pub chain_tx_count: u64,
    /// Arrival order; ties in work break towards the smaller sequence.
    pub seq: i64,
    pub block_loc: Option<FileLocation>,
    pub undo_loc: Option<FileLocation>,
    pub proof_of_stake: bool,
    pub stake_modifier: Hash256,
}

impl IndexEntry {
    pub fn validity(&self) -> u32 {
        self.status & status::VALIDITY_MASK
    }

    pub fn is_valid_to(&self, level: u32) -> bool {
        self.status & status::FAILED_MASK == 0 && self.validity() >= level
    }

    pub fn failed(&self) -> bool {
        self.status & status::FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & status::HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & status::HAVE_UNDO != 0
    }

    /// Disk encoding; work, sequence and linkage are rebuilt on load.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(200);
        self.header.encode_into(&mut encoder);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        match &self.block_loc {
            Some(loc) => {
                encoder.write_u8(1);
                loc.encode_into(&mut encoder);
            }
            None => encoder.write_u8(0),
        }
        match &self.undo_loc {
            Some(loc) => {
                encoder.write_u8(1);
                loc.encode_into(&mut encoder);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u8(self.proof_of_stake as u8);
        encoder.write_bytes(&self.stake_modifier);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let block_loc = if decoder.read_u8()? != 0 {
            Some(FileLocation::decode_from(&mut decoder)?)
        } else {
            None
        };
        let undo_loc = if decoder.read_u8()? != 0 {
            Some(FileLocation::decode_from(&mut decoder)?)
        } else {
            None
        };
        let proof_of_stake = decoder.read_u8()? != 0;
        let stake_modifier = decoder.read_fixed::<32>()?;
        decoder.finish()?;
        Ok(Self {
            hash: header.hash(),
            header,
            prev: None,
            skip: None,
            height,
            work: U256::zero(),
            time_max: 0,
            status,
            tx_count,
            chain_tx_count: 0,
            seq: 0,
            block_loc,
            undo_loc,
            proof_of_stake,
            stake_modifier,
        })
    }
}

/// Candidate ordering: by work descending, then sequence ascending, then
/// handle ascending. The set's maximum under this `Ord` is the best.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CandidateKey {
    pub work: U256,
    pub seq: i64,
    pub handle: Handle,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.work
            .cmp(&other.work)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, Handle>,
    candidates: BTreeSet<CandidateKey>,
    dirty: HashSet<Handle>,
    next_seq: i64,
    precious_seq: i64,
    best_header: Option<Handle>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: Handle) -> &IndexEntry {
        &self.entries[handle as usize]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<Handle> {
        self.by_hash.get(hash).copied()
    }

    pub fn best_header(&self) -> Option<Handle> {
        self.best_header
    }

    /// Mutate an entry and mark it dirty for the next index flush.
    pub fn modify<R>(&mut self, handle: Handle, f: impl FnOnce(&mut IndexEntry) -> R) -> R {
        let result = f(&mut self.entries[handle as usize]);
        self.dirty.insert(handle);
        result
    }

    pub fn take_dirty(&mut self) -> Vec<Handle> {
        let mut dirty: Vec<Handle> = self.dirty.drain().collect();
        dirty.sort_unstable();
        dirty
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Insert a validated header whose predecessor (if any) is present.
    pub fn insert(
        &mut self,
        header: BlockHeader,
        prev: Option<Handle>,
        work_of_header: U256,
        proof_of_stake: bool,
        stake_modifier: Hash256,
    ) -> Handle {
        let hash = header.hash();
        let handle = self.entries.len() as Handle;
        let (height, prev_work, prev_time_max) = match prev {
            Some(prev) => {
                let entry = self.get(prev);
                (entry.height + 1, entry.work, entry.time_max)
            }
            None => (0, U256::zero(), 0),
        };
        self.next_seq += 1;
        let entry = IndexEntry {
            hash,
            time_max: prev_time_max.max(header.time),
            header,
            prev,
            skip: prev.map(|_| self.ancestor_handle(prev.expect("prev checked"), skip_height(height))),
            height,
            work: prev_work + work_of_header,
            status: status::VALID_TREE,
            tx_count: 0,
            chain_tx_count: 0,
            seq: self.next_seq,
            block_loc: None,
            undo_loc: None,
            proof_of_stake,
            stake_modifier,
        };
        self.entries.push(entry);
        self.by_hash.insert(hash, handle);
        self.dirty.insert(handle);

        let best_work = self.best_header.map(|best| self.get(best).work);
        if best_work.map(|work| self.get(handle).work > work).unwrap_or(true) {
            self.best_header = Some(handle);
        }
        handle
    }

    fn ancestor_handle(&self, from: Handle, height: i32) -> Handle {
        self.ancestor(from, height)
            .expect("skip target below entry height")
    }

    /// Ancestor of `from` at `height`, O(log n) through skip pointers.
    pub fn ancestor(&self, from: Handle, height: i32) -> Option<Handle> {
        if height < 0 || height > self.get(from).height {
            return None;
        }
        let mut walk = from;
        let mut walk_height = self.get(walk).height;
        while walk_height > height {
            let entry = self.get(walk);
            if let Some(skip) = entry.skip {
                let skip_h = self.get(skip).height;
                if skip_h >= height {
                    walk = skip;
                    walk_height = skip_h;
                    continue;
                }
            }
            walk = entry.prev?;
            walk_height -= 1;
        }
        Some(walk)
    }

    /// Last common ancestor of two entries.
    pub fn find_fork(&self, a: Handle, b: Handle) -> Handle {
        let mut a = a;
        let mut b = b;
        let height = self.get(a).height.min(self.get(b).height);
        a = self.ancestor(a, height).expect("height bounded");
        b = self.ancestor(b, height).expect("height bounded");
        while a != b {
            a = self.get(a).prev.expect("diverging chains reach genesis");
            b = self.get(b).prev.expect("diverging chains reach genesis");
        }
        a
    }

    pub fn candidate_key(&self, handle: Handle) -> CandidateKey {
        let entry = self.get(handle);
        CandidateKey {
            work: entry.work,
            seq: entry.seq,
            handle,
        }
    }

    /// Entries eligible to become tip: transaction-valid, fully linked,
    /// not failed.
    pub fn is_candidate(&self, handle: Handle) -> bool {
        let entry = self.get(handle);
        entry.is_valid_to(status::VALID_TRANSACTIONS) && entry.chain_tx_count != 0
    }

    pub fn add_candidate(&mut self, handle: Handle) {
        if self.is_candidate(handle) {
            let key = self.candidate_key(handle);
            self.candidates.insert(key);
        }
    }

    pub fn remove_candidate(&mut self, handle: Handle) {
        let key = self.candidate_key(handle);
        self.candidates.remove(&key);
    }

    pub fn best_candidate(&self) -> Option<Handle> {
        self.candidates.iter().next_back().map(|key| key.handle)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Drop candidates that can no longer beat the tip, keeping the tip
    /// itself and anything building on it.
    pub fn prune_candidates(&mut self, tip: Handle) {
        let tip_key = self.candidate_key(tip);
        let stale: Vec<CandidateKey> = self
            .candidates
            .iter()
            .take_while(|key| **key < tip_key)
            .copied()
            .collect();
        for key in stale {
            if key.handle != tip {
                self.candidates.remove(&key);
            }
        }
    }

    /// Raise an entry's validity level; levels never go down.
    pub fn raise_validity(&mut self, handle: Handle, level: u32) {
        self.modify(handle, |entry| {
            let current = entry.status & status::VALIDITY_MASK;
            if level > current {
                entry.status = (entry.status & !status::VALIDITY_MASK) | level;
            }
        });
    }

    /// Mark an entry invalid and cascade `FAILED_CHILD` over all its
    /// descendants; the candidate set is purged of the subtree.
    pub fn mark_failed(&mut self, handle: Handle) {
        self.remove_candidate(handle);
        self.modify(handle, |entry| {
            entry.status |= status::FAILED_VALID;
        });
        let failed_height = self.get(handle).height;
        let descendants: Vec<Handle> = (0..self.entries.len() as Handle)
            .filter(|other| {
                *other != handle
                    && self.get(*other).height > failed_height
                    && self.ancestor(*other, failed_height) == Some(handle)
            })
            .collect();
        for descendant in descendants {
            self.remove_candidate(descendant);
            self.modify(descendant, |entry| {
                entry.status |= status::FAILED_CHILD;
            });
        }
    }

    /// Clear failure flags on an entry and every descendant, re-seeding
    /// the candidate set from anything that is now eligible.
    pub fn clear_failure(&mut self, handle: Handle) {
        let base_height = self.get(handle).height;
        let affected: Vec<Handle> = (0..self.entries.len() as Handle)
            .filter(|other| {
                *other == handle
                    || (self.get(*other).height > base_height
                        && self.ancestor(*other, base_height) == Some(handle))
            })
            .collect();
        for entry in affected {
            self.modify(entry, |entry| {
                entry.status &= !status::FAILED_MASK;
            });
            self.add_candidate(entry);
        }
    }

    /// Give an entry the best possible tie-break so fork choice prefers
    /// it at equal work.
    pub fn make_precious(&mut self, handle: Handle) {
        self.remove_candidate(handle);
        self.precious_seq -= 1;
        let seq = self.precious_seq;
        self.modify(handle, |entry| entry.seq = seq);
        self.add_candidate(handle);
    }

    /// Record arrival of block data and propagate `chain_tx_count` to any
    /// now-linked descendants; returns every entry whose linkage resolved.
    pub fn connect_block_data(&mut self, handle: Handle, tx_count: u32) -> Vec<Handle> {
        self.modify(handle, |entry| {
            entry.tx_count = tx_count;
            entry.status |= status::HAVE_DATA;
        });
        let mut linked = Vec::new();
        let base_chain_tx = match self.get(handle).prev {
            Some(prev) => self.get(prev).chain_tx_count,
            None => 0,
        };
        if base_chain_tx == 0 && self.get(handle).prev.is_some() {
            return linked;
        }
        // Breadth-first over the subtree whose ancestors all have data.
        let mut queue = vec![handle];
        while let Some(current) = queue.pop() {
            let prev_chain = match self.get(current).prev {
                Some(prev) => self.get(prev).chain_tx_count,
                None => 0,
            };
            let entry = self.get(current);
            if !entry.have_data() || entry.tx_count == 0 {
                continue;
            }
            if entry.prev.is_some() && prev_chain == 0 {
                continue;
            }
            let chain_tx = prev_chain + entry.tx_count as u64;
            self.modify(current, |entry| entry.chain_tx_count = chain_tx);
            self.add_candidate(current);
            linked.push(current);
            let children: Vec<Handle> = (0..self.entries.len() as Handle)
                .filter(|other| self.get(*other).prev == Some(current))
                .collect();
            queue.extend(children);
        }
        linked
    }

    /// Iterate handles; used by startup load and verification sweeps.
    pub fn handles(&self) -> impl Iterator<Item = Handle> {
        0..self.entries.len() as Handle
    }
}

/// Skip-list target height for an entry at `height`.
fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

#[cfg(test)]
mod tests {
    use super::{status, BlockIndex, Handle};
    use plbd_primitives::block::BlockHeader;
    use primitive_types::U256;

    fn header(tag: u64, prev: [u8; 32], height: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_700_000_000 + tag as u32,
            bits: 0x207f_ffff,
            height,
            nonce64: tag,
            mix_hash: [0u8; 32],
        }
    }

    fn build_chain(index: &mut BlockIndex, length: usize) -> Vec<Handle> {
        let mut handles = Vec::new();
        let mut prev_hash = [0u8; 32];
        let mut prev = None;
        for height in 0..length {
            let header = header(height as u64, prev_hash, height as u32);
            prev_hash = header.hash();
            let handle = index.insert(header, prev, U256::from(2u64), false, [0u8; 32]);
            prev = Some(handle);
            handles.push(handle);
        }
        handles
    }

    #[test]
    fn skip_pointer_ancestor_is_exact() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 200);
        for &from in &[handles[199], handles[150], handles[73]] {
            let from_height = index.get(from).height;
            for target in [0, 1, 17, 64, from_height] {
                let ancestor = index.ancestor(from, target).expect("in range");
                assert_eq!(index.get(ancestor).height, target);
            }
        }
        assert_eq!(index.ancestor(handles[10], 11), None);
    }

    #[test]
    fn find_fork_meets_at_branch_point() {
        let mut index = BlockIndex::new();
        let main = build_chain(&mut index, 20);
        // Branch from height 10.
        let mut prev = main[10];
        let mut prev_hash = index.get(prev).hash;
        for tag in 0..5 {
            let header = header(1_000 + tag, prev_hash, index.get(prev).height as u32 + 1);
            prev_hash = header.hash();
            prev = index.insert(header, Some(prev), U256::from(2u64), false, [0u8; 32]);
        }
        let fork = index.find_fork(main[19], prev);
        assert_eq!(fork, main[10]);
    }

    #[test]
    fn candidate_order_prefers_work_then_arrival() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 3);
        for &handle in &handles {
            let tx_count = 1;
            index.connect_block_data(handle, tx_count);
            index.raise_validity(handle, status::VALID_TRANSACTIONS);
            index.add_candidate(handle);
        }
        // Highest cumulative work wins.
        assert_eq!(index.best_candidate(), Some(handles[2]));

        // A same-work sibling of handle 2 that arrived later loses the tie.
        let sibling_header = header(99, index.get(handles[1]).hash, 2);
        let sibling = index.insert(sibling_header, Some(handles[1]), U256::from(2u64), false, [0u8; 32]);
        index.connect_block_data(sibling, 1);
        index.raise_validity(sibling, status::VALID_TRANSACTIONS);
        index.add_candidate(sibling);
        assert_eq!(index.best_candidate(), Some(handles[2]));

        // Until it is made precious.
        index.make_precious(sibling);
        assert_eq!(index.best_candidate(), Some(sibling));
    }

    #[test]
    fn mark_failed_cascades_to_descendants() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 10);
        for &handle in &handles {
            index.connect_block_data(handle, 1);
            index.raise_validity(handle, status::VALID_TRANSACTIONS);
            index.add_candidate(handle);
        }
        index.mark_failed(handles[5]);
        assert!(index.get(handles[5]).status & status::FAILED_VALID != 0);
        for &handle in &handles[6..] {
            assert!(index.get(handle).status & status::FAILED_CHILD != 0);
        }
        assert!(index.get(handles[4]).status & status::FAILED_MASK == 0);
        assert_eq!(index.best_candidate(), Some(handles[4]));

        index.clear_failure(handles[5]);
        assert_eq!(index.best_candidate(), Some(handles[9]));
    }

    #[test]
    fn late_parent_links_descendants() {
        let mut index = BlockIndex::new();
        let handles = build_chain(&mut index, 4);
        // Data arrives for 0, 1, 3 first; 3 stays unlinked.
        index.connect_block_data(handles[0], 1);
        index.connect_block_data(handles[1], 2);
        index.connect_block_data(handles[3], 4);
        assert_eq!(index.get(handles[3]).chain_tx_count, 0);

        // When 2 arrives, 3 links transitively.
        let linked = index.connect_block_data(handles[2], 3);
        assert!(linked.contains(&handles[2]));
        assert!(linked.contains(&handles[3]));
        assert_eq!(index.get(handles[3]).chain_tx_count, 1 + 2 + 3 + 4);
    }
}
