//! Buffer for connectivity candidates that outran the offer/answer
//! exchange. The relay guarantees no ordering across channels, so a
//! candidate can arrive before the description it belongs to; applying it
//! at that point is a hard error in the engine. Candidates are queued per
//! partner identity and drained, in arrival order, the instant the remote
//! description is applied.

use std::collections::{HashMap, HashSet};

use crate::protocol::CandidateInit;

/// Most candidates kept queued per identity. A real exchange stays well
/// under this; unsolicited senders cannot grow the buffer without bound.
const MAX_QUEUED: usize = 64;

#[derive(Debug, Default)]
pub struct PendingCandidateSet {
    queued: HashMap<String, Vec<CandidateInit>>,
    seen: HashMap<String, HashSet<String>>,
}

impl PendingCandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivery. Returns `false` when this exact candidate was
    /// already delivered by this partner, so re-deliveries are applied at
    /// most once.
    pub fn first_delivery(&mut self, partner: &str, candidate: &CandidateInit) -> bool {
        self.seen
            .entry(partner.to_string())
            .or_default()
            .insert(candidate.candidate.clone())
    }

    /// Queues a candidate for `partner`. The per-identity queue is
    /// bounded; at capacity the oldest entry is dropped.
    pub fn queue(&mut self, partner: &str, candidate: CandidateInit) {
        let queue = self.queued.entry(partner.to_string()).or_default();
        if queue.len() >= MAX_QUEUED {
            queue.remove(0);
        }
        queue.push(candidate);
    }

    /// Removes and returns everything queued for `partner`, in arrival
    /// order. The seen-set is kept so a late re-delivery of a drained
    /// candidate is still suppressed.
    pub fn drain(&mut self, partner: &str) -> Vec<CandidateInit> {
        self.queued.remove(partner).unwrap_or_default()
    }

    pub fn queued_len(&self, partner: &str) -> usize {
        self.queued.get(partner).map_or(0, Vec::len)
    }

    /// Drops state for every identity except `partner`. Runs whenever an
    /// attempt begins, so identities that never become the partner cannot
    /// accumulate state for the life of the process. Anything already
    /// buffered for `partner` survives: a candidate can outrun the
    /// invitation itself.
    pub fn retain_only(&mut self, partner: &str) {
        self.queued.retain(|identity, _| identity == partner);
        self.seen.retain(|identity, _| identity == partner);
    }

    /// Drops everything, queued and seen alike.
    pub fn clear(&mut self) {
        self.queued.clear();
        self.seen.clear();
    }
}
