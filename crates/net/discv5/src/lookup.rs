//! Iterative FINDNODE lookups.
//!
//! A [`Lookup`] is a passive state object the service drives: it hands out the next peers to
//! query, absorbs NODES results and failures, and reports termination. At most `alpha` queries
//! are in flight per lookup and each peer is asked about the three `log2` distances bracketing
//! the target.

use crate::{
    node::{distance, Distance, NUM_BUCKETS},
    Enr,
};
use enr::NodeId;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Identifier of an in-progress lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LookupId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// Known but not yet queried.
    NotContacted,
    /// A FINDNODE is in flight.
    Waiting,
    /// Answered with a complete NODES response.
    Responded,
    /// Timed out or errored.
    Failed,
}

#[derive(Debug)]
struct LookupPeer {
    enr: Enr,
    state: PeerState,
    /// FINDNODE requests sent to this peer within this lookup.
    requests: usize,
}

/// An iterative lookup converging on the peers closest to `target`.
#[derive(Debug)]
pub(crate) struct Lookup {
    target: NodeId,
    /// All peers seen by the lookup, keyed and ordered by distance to the target. Queried and
    /// unqueried peers are disjoint by construction of [`PeerState`].
    peers: BTreeMap<Distance, LookupPeer>,
    alpha: usize,
    num_results: usize,
    request_limit: usize,
    in_flight: usize,
    started: Instant,
    timeout: Duration,
}

// === impl Lookup ===

impl Lookup {
    /// Starts a lookup seeded with the table's closest known peers.
    pub(crate) fn new(
        target: NodeId,
        seeds: Vec<Enr>,
        alpha: usize,
        num_results: usize,
        request_limit: usize,
        timeout: Duration,
    ) -> Self {
        let mut lookup = Self {
            target,
            peers: BTreeMap::new(),
            alpha,
            num_results,
            request_limit,
            in_flight: 0,
            started: Instant::now(),
            timeout,
        };
        lookup.merge(seeds);
        lookup
    }

    /// The node id this lookup converges on.
    pub(crate) fn target(&self) -> NodeId {
        self.target
    }

    /// Whether the lookup deadline has passed.
    pub(crate) fn is_timed_out(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    /// Adds newly discovered records as query candidates, ignoring peers already tracked.
    pub(crate) fn merge(&mut self, enrs: Vec<Enr>) {
        for enr in enrs {
            let key = distance(&self.target, &enr.node_id());
            self.peers.entry(key).or_insert(LookupPeer {
                enr,
                state: PeerState::NotContacted,
                requests: 0,
            });
        }
    }

    /// Picks up to `alpha - in_flight` unqueried peers from the current closest set and marks
    /// them as in flight.
    pub(crate) fn next_peers(&mut self) -> Vec<Enr> {
        let budget = self.alpha.saturating_sub(self.in_flight);
        if budget == 0 {
            return Vec::new()
        }
        let request_limit = self.request_limit;
        let mut out = Vec::with_capacity(budget);
        for peer in self.peers.values_mut().take(self.num_results) {
            if out.len() == budget {
                break
            }
            if peer.state == PeerState::NotContacted && peer.requests < request_limit {
                peer.state = PeerState::Waiting;
                peer.requests += 1;
                out.push(peer.enr.clone());
            }
        }
        self.in_flight += out.len();
        out
    }

    /// Records a complete NODES response and folds the returned records in.
    pub(crate) fn on_success(&mut self, node_id: &NodeId, enrs: Vec<Enr>) {
        let key = distance(&self.target, node_id);
        if let Some(peer) = self.peers.get_mut(&key) {
            if peer.state == PeerState::Waiting {
                peer.state = PeerState::Responded;
                self.in_flight -= 1;
            }
        }
        self.merge(enrs);
    }

    /// Records a failed or timed-out query.
    pub(crate) fn on_failure(&mut self, node_id: &NodeId) {
        let key = distance(&self.target, node_id);
        if let Some(peer) = self.peers.get_mut(&key) {
            if peer.state == PeerState::Waiting {
                peer.state = PeerState::Failed;
                self.in_flight -= 1;
            }
        }
    }

    /// A lookup is done when nothing is in flight and none of the closest `num_results` known
    /// peers remains unqueried.
    pub(crate) fn is_finished(&self) -> bool {
        if self.in_flight > 0 {
            return false
        }
        !self
            .peers
            .values()
            .take(self.num_results)
            .any(|peer| peer.state == PeerState::NotContacted && peer.requests < self.request_limit)
    }

    /// The responding peers closest to the target, ascending by distance, at most
    /// `num_results`.
    pub(crate) fn into_results(self) -> Vec<Enr> {
        self.peers
            .into_values()
            .filter(|peer| peer.state == PeerState::Responded)
            .take(self.num_results)
            .map(|peer| peer.enr)
            .collect()
    }
}

/// The `log2` distances a lookup asks `peer` about: the peer's distance to the target and its
/// two neighbors, clamped to the valid range. A peer that *is* the target is asked for its own
/// record.
pub(crate) fn lookup_distances(target: &NodeId, peer: &NodeId) -> Vec<u64> {
    match distance(target, peer).log2() {
        None => vec![0],
        Some(d) => {
            let mut distances = vec![d];
            if d < NUM_BUCKETS as u64 {
                distances.push(d + 1);
            }
            if d > 1 {
                distances.push(d - 1);
            }
            distances
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;
    use std::net::Ipv4Addr;

    const ALPHA: usize = 3;
    const K: usize = 16;
    const REQUEST_LIMIT: usize = 3;

    fn build_enr() -> Enr {
        let key = SecretKey::new(&mut rand::thread_rng());
        Enr::builder().ip4(Ipv4Addr::LOCALHOST).udp4(9000).build(&key).unwrap()
    }

    fn new_lookup(target: NodeId, seeds: Vec<Enr>) -> Lookup {
        Lookup::new(target, seeds, ALPHA, K, REQUEST_LIMIT, Duration::from_secs(60))
    }

    #[test]
    fn test_empty_lookup_finishes_immediately() {
        let lookup = new_lookup(NodeId::random(), Vec::new());
        assert!(lookup.is_finished());
        assert!(lookup.into_results().is_empty());
    }

    #[test]
    fn test_at_most_alpha_in_flight() {
        let seeds: Vec<Enr> = (0..10).map(|_| build_enr()).collect();
        let mut lookup = new_lookup(NodeId::random(), seeds);

        let first = lookup.next_peers();
        assert_eq!(first.len(), ALPHA);
        assert!(lookup.next_peers().is_empty());
        assert!(!lookup.is_finished());

        // One response frees exactly one slot.
        lookup.on_success(&first[0].node_id(), Vec::new());
        assert_eq!(lookup.next_peers().len(), 1);
    }

    #[test]
    fn test_peer_is_queried_once() {
        let seed = build_enr();
        let seed_id = seed.node_id();
        let mut lookup = new_lookup(NodeId::random(), vec![seed]);

        assert_eq!(lookup.next_peers().len(), 1);
        lookup.on_success(&seed_id, Vec::new());
        assert!(lookup.next_peers().is_empty());
        assert!(lookup.is_finished());
    }

    #[test]
    fn test_discovered_peers_are_folded_in_and_results_sorted() {
        let target = NodeId::random();
        let seed = build_enr();
        let seed_id = seed.node_id();
        let mut lookup = new_lookup(target, vec![seed]);

        let _ = lookup.next_peers();
        let discovered: Vec<Enr> = (0..5).map(|_| build_enr()).collect();
        lookup.on_success(&seed_id, discovered.clone());

        // Everything responds.
        loop {
            let batch = lookup.next_peers();
            if batch.is_empty() {
                break
            }
            for enr in batch {
                lookup.on_success(&enr.node_id(), Vec::new());
            }
        }
        assert!(lookup.is_finished());

        let results = lookup.into_results();
        assert_eq!(results.len(), 6);
        let mut sorted = results.clone();
        sorted.sort_by(|a, b| {
            distance(&target, &a.node_id()).cmp(&distance(&target, &b.node_id()))
        });
        assert_eq!(results, sorted);
    }

    #[test]
    fn test_failed_peers_are_excluded_and_lookup_terminates() {
        let seeds: Vec<Enr> = (0..4).map(|_| build_enr()).collect();
        let mut lookup = new_lookup(NodeId::random(), seeds);

        loop {
            let batch = lookup.next_peers();
            if batch.is_empty() {
                break
            }
            for enr in batch {
                lookup.on_failure(&enr.node_id());
            }
        }
        assert!(lookup.is_finished());
        assert!(lookup.into_results().is_empty());
    }

    #[test]
    fn test_results_are_bounded_by_k() {
        let target = NodeId::random();
        let seeds: Vec<Enr> = (0..(K + 10)).map(|_| build_enr()).collect();
        let mut lookup = new_lookup(target, seeds);

        loop {
            let batch = lookup.next_peers();
            if batch.is_empty() {
                break
            }
            for enr in batch {
                lookup.on_success(&enr.node_id(), Vec::new());
            }
        }
        assert!(lookup.is_finished());
        assert!(lookup.into_results().len() <= K);
    }

    #[test]
    fn test_lookup_distances_bracket_the_target() {
        let target = NodeId::random();
        let peer = NodeId::random();
        let distances = lookup_distances(&target, &peer);
        let d = distance(&target, &peer).log2().unwrap();
        assert_eq!(distances[0], d);
        assert!(distances.len() <= 3);
        assert!(distances.iter().all(|x| (1..=256).contains(x)));

        assert_eq!(lookup_distances(&target, &target), vec![0]);
    }
}
