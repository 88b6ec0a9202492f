//! The XOR-distance routing table.
//!
//! 256 buckets, one per `log2` distance from the local node. Each bucket holds up to
//! [`MAX_NODES_PER_BUCKET`] live entries plus a FIFO of pending entries waiting for a slot.
//! Records at distance 0 (the local node) are never stored.

use crate::{
    node::{distance, Distance, NUM_BUCKETS},
    Enr,
};
use enr::NodeId;
use std::{collections::VecDeque, time::Instant};

/// Maximum number of live entries per bucket (the Kademlia `k`).
pub const MAX_NODES_PER_BUCKET: usize = 16;

/// Liveness of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// An active session exists or the peer recently answered.
    Connected,
    /// The peer has not (yet) proven liveness.
    Disconnected,
}

/// A peer tracked by the table.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// The peer's record.
    pub enr: Enr,
    /// When the peer last gave a sign of life.
    pub last_seen: Instant,
    /// Liveness state.
    pub state: ConnectionState,
}

/// Outcome of [`KBucketsTable::insert_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// A new entry went into a bucket with capacity.
    Inserted,
    /// The peer was already tracked; record and last-seen were refreshed.
    Updated,
    /// The bucket is full; the record was parked in the pending queue.
    Pending,
    /// The record is the local node and is not stored.
    IsLocal,
}

#[derive(Debug, Default)]
struct KBucket {
    nodes: Vec<NodeEntry>,
    pending: VecDeque<NodeEntry>,
}

impl KBucket {
    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|entry| entry.enr.node_id() == *node_id)
    }

    /// Refreshes an entry wherever it lives, keeping the record with the highest sequence
    /// number. Returns false if the peer is unknown to this bucket.
    fn update(&mut self, enr: &Enr) -> bool {
        let node_id = enr.node_id();
        let entry = self
            .nodes
            .iter_mut()
            .chain(self.pending.iter_mut())
            .find(|entry| entry.enr.node_id() == node_id);
        match entry {
            Some(entry) => {
                if enr.seq() > entry.enr.seq() {
                    entry.enr = enr.clone();
                }
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Promotes the oldest pending entry if a slot can be made: either the bucket has room or
    /// its least-recently-seen disconnected entry can be evicted.
    fn promote_pending(&mut self) {
        if self.pending.is_empty() {
            return
        }
        if self.nodes.len() < MAX_NODES_PER_BUCKET {
            if let Some(pending) = self.pending.pop_front() {
                self.nodes.push(pending);
            }
            return
        }
        let lru = self
            .nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(i, _)| i);
        if let Some(i) = lru {
            if self.nodes[i].state == ConnectionState::Disconnected {
                self.nodes.remove(i);
                if let Some(pending) = self.pending.pop_front() {
                    self.nodes.push(pending);
                }
            }
        }
    }
}

/// The routing table.
#[derive(Debug)]
pub struct KBucketsTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
}

// === impl KBucketsTable ===

impl KBucketsTable {
    /// Creates an empty table around the given local node id.
    pub fn new(local_id: NodeId) -> Self {
        Self { local_id, buckets: (0..NUM_BUCKETS).map(|_| KBucket::default()).collect() }
    }

    fn bucket_of(&self, node_id: &NodeId) -> Option<usize> {
        distance(&self.local_id, node_id).bucket_index()
    }

    /// Number of live entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.nodes.len()).sum()
    }

    /// Whether the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the live entry for a node id.
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeEntry> {
        let index = self.bucket_of(node_id)?;
        let position = self.buckets[index].position(node_id)?;
        Some(&self.buckets[index].nodes[position])
    }

    /// Inserts a record, or refreshes the peer if it is already tracked.
    ///
    /// New entries start out [`ConnectionState::Disconnected`]; full buckets park the record in
    /// a bounded FIFO of pending entries, displacing the oldest pending record.
    pub fn insert_or_update(&mut self, enr: Enr) -> InsertResult {
        let Some(index) = self.bucket_of(&enr.node_id()) else { return InsertResult::IsLocal };
        let bucket = &mut self.buckets[index];

        if bucket.update(&enr) {
            return InsertResult::Updated
        }

        let entry =
            NodeEntry { enr, last_seen: Instant::now(), state: ConnectionState::Disconnected };
        if bucket.nodes.len() < MAX_NODES_PER_BUCKET {
            bucket.nodes.push(entry);
            return InsertResult::Inserted
        }

        if bucket.pending.len() == MAX_NODES_PER_BUCKET {
            bucket.pending.pop_front();
        }
        bucket.pending.push_back(entry);
        InsertResult::Pending
    }

    /// Removes a peer from the table entirely.
    pub fn remove(&mut self, node_id: &NodeId) -> bool {
        let Some(index) = self.bucket_of(node_id) else { return false };
        let bucket = &mut self.buckets[index];
        let live = bucket.position(node_id).map(|i| bucket.nodes.remove(i)).is_some();
        bucket.pending.retain(|entry| entry.enr.node_id() != *node_id);
        live
    }

    /// Marks a peer as connected and gives the bucket a chance to promote a pending entry over
    /// a stale disconnected one.
    pub fn mark_connected(&mut self, node_id: &NodeId) {
        let Some(index) = self.bucket_of(node_id) else { return };
        let bucket = &mut self.buckets[index];
        if let Some(position) = bucket.position(node_id) {
            bucket.nodes[position].state = ConnectionState::Connected;
            bucket.nodes[position].last_seen = Instant::now();
        }
        bucket.promote_pending();
    }

    /// Marks a peer as disconnected. The entry stays in the table until displaced.
    pub fn mark_disconnected(&mut self, node_id: &NodeId) {
        let Some(index) = self.bucket_of(node_id) else { return };
        let bucket = &mut self.buckets[index];
        if let Some(position) = bucket.position(node_id) {
            bucket.nodes[position].state = ConnectionState::Disconnected;
        }
    }

    /// The `count` live entries closest to `target`, ascending by true XOR distance.
    ///
    /// Ties keep insertion order (the sort is stable), though distinct peers can only tie if
    /// the metric collides, which XOR does not.
    pub fn nearest(&self, target: &NodeId, count: usize) -> Vec<Enr> {
        let mut entries: Vec<(Distance, &Enr)> = self
            .iter()
            .map(|entry| (distance(target, &entry.enr.node_id()), &entry.enr))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().take(count).map(|(_, enr)| enr.clone()).collect()
    }

    /// The live records at an exact `log2` distance, for answering FINDNODE.
    pub fn entries_at_distance(&self, log2_distance: u64) -> Vec<Enr> {
        if log2_distance == 0 || log2_distance > NUM_BUCKETS as u64 {
            return Vec::new()
        }
        self.buckets[log2_distance as usize - 1]
            .nodes
            .iter()
            .map(|entry| entry.enr.clone())
            .collect()
    }

    /// Iterates over all live entries.
    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.buckets.iter().flat_map(|bucket| bucket.nodes.iter())
    }

    /// All live records, bucket by bucket.
    pub fn table_entries(&self) -> Vec<Enr> {
        self.iter().map(|entry| entry.enr.clone()).collect()
    }

    /// Records of all connected entries.
    pub fn connected_entries(&self) -> Vec<Enr> {
        self.iter()
            .filter(|entry| entry.state == ConnectionState::Connected)
            .map(|entry| entry.enr.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;
    use std::net::Ipv4Addr;

    fn build_enr(seq_ip: u8) -> Enr {
        let key = SecretKey::new(&mut rand::thread_rng());
        Enr::builder()
            .ip4(Ipv4Addr::new(127, 0, 0, seq_ip))
            .udp4(9000)
            .build(&key)
            .unwrap()
    }

    /// Generates records until one lands in the given bucket of `table`.
    fn enr_in_bucket(local_id: &NodeId, bucket: usize) -> Enr {
        loop {
            let enr = build_enr(1);
            if distance(local_id, &enr.node_id()).bucket_index() == Some(bucket) {
                return enr
            }
        }
    }

    #[test]
    fn test_entries_obey_bucket_index() {
        let local_id = NodeId::random();
        let mut table = KBucketsTable::new(local_id);
        for _ in 0..32 {
            table.insert_or_update(build_enr(1));
        }
        for (index, bucket) in table.buckets.iter().enumerate() {
            for entry in &bucket.nodes {
                assert_eq!(
                    distance(&local_id, &entry.enr.node_id()).bucket_index(),
                    Some(index)
                );
            }
        }
    }

    #[test]
    fn test_full_bucket_parks_in_pending_with_fifo_eviction() {
        let local_id = NodeId::random();
        let mut table = KBucketsTable::new(local_id);

        let mut results = Vec::new();
        // Bucket 255 holds half the key space, filling it is quick.
        for _ in 0..(2 * MAX_NODES_PER_BUCKET + 1) {
            let enr = enr_in_bucket(&local_id, 255);
            results.push(table.insert_or_update(enr));
        }

        assert_eq!(results[MAX_NODES_PER_BUCKET - 1], InsertResult::Inserted);
        assert!(results[MAX_NODES_PER_BUCKET..].iter().all(|r| *r == InsertResult::Pending));

        let bucket = &table.buckets[255];
        assert_eq!(bucket.nodes.len(), MAX_NODES_PER_BUCKET);
        // One pending entry was displaced by the FIFO bound.
        assert_eq!(bucket.pending.len(), MAX_NODES_PER_BUCKET);
    }

    #[test]
    fn test_highest_seq_record_is_retained() {
        let local_id = NodeId::random();
        let mut table = KBucketsTable::new(local_id);

        let key = SecretKey::new(&mut rand::thread_rng());
        let mut enr = Enr::builder().ip4(Ipv4Addr::LOCALHOST).udp4(9000).build(&key).unwrap();
        table.insert_or_update(enr.clone());

        let old = enr.clone();
        enr.set_udp4(9001, &key).unwrap();
        assert!(enr.seq() > old.seq());

        // Newer record replaces the held one.
        assert_eq!(table.insert_or_update(enr.clone()), InsertResult::Updated);
        assert_eq!(table.get(&enr.node_id()).unwrap().enr.seq(), enr.seq());

        // Re-inserting the stale record does not roll it back.
        assert_eq!(table.insert_or_update(old), InsertResult::Updated);
        assert_eq!(table.get(&enr.node_id()).unwrap().enr.seq(), enr.seq());
    }

    #[test]
    fn test_nearest_is_sorted_and_bounded() {
        let local_id = NodeId::random();
        let mut table = KBucketsTable::new(local_id);
        let target = NodeId::random();

        assert!(table.nearest(&target, MAX_NODES_PER_BUCKET).is_empty());

        let mut all = Vec::new();
        for _ in 0..100 {
            let enr = build_enr(1);
            all.push(enr.node_id());
            table.insert_or_update(enr);
        }

        let nearest = table.nearest(&target, MAX_NODES_PER_BUCKET);
        assert_eq!(nearest.len(), MAX_NODES_PER_BUCKET);

        // Ascending by true XOR distance and matching a brute-force ranking.
        all.sort_by(|a, b| distance(&target, a).cmp(&distance(&target, b)));
        let expected: Vec<NodeId> = all.into_iter().take(MAX_NODES_PER_BUCKET).collect();
        let got: Vec<NodeId> = nearest.iter().map(|enr| enr.node_id()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_mark_connected_promotes_over_lru_disconnected() {
        let local_id = NodeId::random();
        let mut table = KBucketsTable::new(local_id);

        let mut members = Vec::new();
        for _ in 0..MAX_NODES_PER_BUCKET {
            let enr = enr_in_bucket(&local_id, 255);
            members.push(enr.node_id());
            table.insert_or_update(enr);
        }
        for id in &members {
            table.mark_connected(id);
        }
        let parked = enr_in_bucket(&local_id, 255);
        assert_eq!(table.insert_or_update(parked.clone()), InsertResult::Pending);

        // All live entries connected: nothing to evict, pending stays parked.
        table.mark_connected(&members[2]);
        assert!(table.get(&parked.node_id()).is_none());

        // Once the oldest entry goes stale and disconnected, a connection event frees a slot.
        table.mark_disconnected(&members[0]);
        table.mark_connected(&members[1]);
        assert!(table.get(&parked.node_id()).is_some());
        assert!(table.get(&members[0]).is_none());
    }

    #[test]
    fn test_local_node_is_never_stored() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let enr = Enr::builder().ip4(Ipv4Addr::LOCALHOST).udp4(9000).build(&key).unwrap();
        let mut table = KBucketsTable::new(enr.node_id());
        assert_eq!(table.insert_or_update(enr), InsertResult::IsLocal);
        assert!(table.is_empty());
    }
}
