//! Per-request response tally

use libp2p::PeerId;
use std::collections::HashMap;
use std::hash::Hash;

/// Result of recording one proxy's response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Counted, no trusted key yet or another key already won
    Counted,
    /// This response made its key the first to reach the threshold
    Trusted,
    /// The proxy already answered this request
    Duplicate,
}

/// Counts agreeing responses per trust key
#[derive(Debug)]
pub struct ResponseTally<K> {
    threshold: usize,
    voters: HashMap<PeerId, K>,
    counts: HashMap<K, usize>,
    trusted: Option<K>,
}

impl<K: Eq + Hash + Clone> ResponseTally<K> {
    /// A threshold of zero is treated as one
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            voters: HashMap::new(),
            counts: HashMap::new(),
            trusted: None,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Count `key` for `voter`.
    ///
    /// Returns `Vote::Trusted` exactly once per tally: for the response that
    /// brings the first key to the threshold. Later responses keep counting.
    pub fn record(&mut self, voter: PeerId, key: K) -> Vote {
        if self.voters.contains_key(&voter) {
            return Vote::Duplicate;
        }
        self.voters.insert(voter, key.clone());

        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;

        if self.trusted.is_none() && *count >= self.threshold {
            self.trusted = Some(key);
            Vote::Trusted
        } else {
            Vote::Counted
        }
    }

    pub fn count(&self, key: &K) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Key that reached the threshold first
    pub fn trusted(&self) -> Option<&K> {
        self.trusted.as_ref()
    }

    /// Highest count of any key
    pub fn best_count(&self) -> usize {
        self.counts.values().copied().max().unwrap_or(0)
    }

    /// Number of counted responses
    pub fn responses(&self) -> usize {
        self.voters.len()
    }
}
