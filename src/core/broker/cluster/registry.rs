// src/core/broker/cluster/registry.rs

//! Bookkeeping for the shards this process knows about: when each was last heard
//! from and the online counter it last reported.
//!
//! The registry is plain data. Time is passed in as milliseconds so liveness rules
//! can be driven by a simulated clock.

use crate::core::protocol::OnlineCounter;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct ShardRegistry {
    my_id: String,
    /// Remote shards keyed by id, valued by last-seen time in ms.
    last_seen: HashMap<String, u64>,
    /// Last reported counter per shard, including this one. Ordered by shard id.
    counters: BTreeMap<String, OnlineCounter>,
}

impl ShardRegistry {
    pub fn new(my_id: impl Into<String>) -> Self {
        Self {
            my_id: my_id.into(),
            last_seen: HashMap::new(),
            counters: BTreeMap::new(),
        }
    }

    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    /// Records an announce. Returns `true` if the shard was not known before.
    pub fn observe(&mut self, shard: &str, now_ms: u64) -> bool {
        if shard == self.my_id {
            return false;
        }
        self.last_seen.insert(shard.to_string(), now_ms).is_none()
    }

    pub fn contains(&self, shard: &str) -> bool {
        self.last_seen.contains_key(shard)
    }

    /// Refreshes the last-seen time of a registered shard. Unknown shards are left alone.
    pub fn touch(&mut self, shard: &str, now_ms: u64) -> bool {
        match self.last_seen.get_mut(shard) {
            Some(seen) => {
                *seen = (*seen).max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Stores a shard's snapshot. Only this shard and registered shards are accepted.
    pub fn update_counter(&mut self, shard: &str, counter: OnlineCounter) -> bool {
        if shard != self.my_id && !self.contains(shard) {
            return false;
        }
        self.counters.insert(shard.to_string(), counter);
        true
    }

    /// Removes every shard not heard from for more than `timeout_ms`, returning their ids.
    pub fn evict_stale(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let mut stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now_ms.saturating_sub(**seen) > timeout_ms)
            .map(|(shard, _)| shard.clone())
            .collect();
        stale.sort();
        for shard in &stale {
            self.last_seen.remove(shard);
            self.counters.remove(shard);
        }
        stale
    }

    /// The per-canvas sum over every stored snapshot.
    pub fn aggregate(&self) -> OnlineCounter {
        OnlineCounter::sum(self.counters.values())
    }

    pub fn counter_of(&self, shard: &str) -> Option<&OnlineCounter> {
        self.counters.get(shard)
    }

    /// The shard with the fewest users. Ties go to the smallest id; with no
    /// counters at all this shard is returned.
    pub fn lowest_active_shard(&self) -> String {
        self.counters
            .iter()
            .min_by(|(a_id, a), (b_id, b)| a.total.cmp(&b.total).then_with(|| a_id.cmp(b_id)))
            .map(|(shard, _)| shard.clone())
            .unwrap_or_else(|| self.my_id.clone())
    }

    /// True iff this shard has the smallest id among itself and every live shard.
    pub fn am_i_important(&self) -> bool {
        self.last_seen.keys().all(|shard| self.my_id.as_str() < shard.as_str())
    }

    /// Registered remote shards, sorted.
    pub fn known_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.last_seen.keys().cloned().collect();
        shards.sort();
        shards
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
