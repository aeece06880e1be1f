//! Skeleton Staleness Cache
//!
//! Joint positions are expensive: three dependent read rounds per entity.
//! The cache keeps them per identity key and only asks for a refresh when
//! the source shows evidence of change or the entry ages out.
//!
//! ```text
//! Absent --(first joint read)--> Fresh --(age >= force_refresh)--> StaleServed
//!                                  ^                                   |
//!                                  +-------- successful refresh -------+
//!                                                                      |
//!                                          (age >= max_age) --> Evicted
//! ```

use crate::bias::Bias;
use crate::identity::IdentityKey;
use crate::math::Vec3;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Cached joints for one identity key.
#[derive(Debug, Clone, PartialEq)]
pub struct SkeletonEntry {
    pub key: IdentityKey,

    /// World-space joints in configured order, `bias` included.
    ///
    /// Published joints are continuous across origin rebases and are
    /// served unchanged until the next refresh.
    pub joints: Arc<[Vec3]>,

    pub captured_at: Duration,

    /// Source submit counter observed at capture
    pub submit_counter: u32,

    /// Bias applied when the joints were resolved
    pub bias: Bias,
}

impl SkeletonEntry {
    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.captured_at)
    }

    /// The head joint (first in configured order).
    pub fn head(&self) -> Option<Vec3> {
        self.joints.first().copied()
    }
}

/// Lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkeletonState {
    Absent,
    Fresh,
    StaleServed,
    Evicted,
}

/// Why a refresh is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// Nothing cached yet
    Initial,
    /// The source submitted a new animation frame
    CounterAdvanced,
    /// Entry reached the force-refresh budget
    ForceAged,
}

#[derive(Debug, Default)]
struct Entries {
    live: HashMap<IdentityKey, SkeletonEntry>,
    evicted: HashSet<IdentityKey>,
}

/// Shared skeleton cache.
///
/// Cloning shares the same entries. The lock is only held for map
/// operations; callers never hold it across a read round.
#[derive(Debug, Clone)]
pub struct SkeletonCache {
    entries: Arc<Mutex<Entries>>,
    force_refresh: Duration,
    max_age: Duration,
}

impl SkeletonCache {
    pub fn new(force_refresh: Duration, max_age: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            force_refresh,
            max_age,
        }
    }

    pub fn force_refresh(&self) -> Duration {
        self.force_refresh
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Decides whether `key` needs a refresh this cycle.
    ///
    /// `counter` is the submit counter read this cycle, if the read
    /// succeeded. Only a strictly greater counter counts as progress; a
    /// backwards or wrapped counter waits for the force-refresh budget.
    pub fn refresh_reason(
        &self,
        key: IdentityKey,
        counter: Option<u32>,
        now: Duration,
    ) -> Option<RefreshReason> {
        let entries = self.entries.lock();
        let Some(entry) = entries.live.get(&key) else {
            return Some(RefreshReason::Initial);
        };

        if counter.is_some_and(|c| c > entry.submit_counter) {
            Some(RefreshReason::CounterAdvanced)
        } else if entry.age(now) >= self.force_refresh {
            Some(RefreshReason::ForceAged)
        } else {
            None
        }
    }

    /// Stores a freshly resolved skeleton.
    pub fn insert(&self, entry: SkeletonEntry) {
        let mut entries = self.entries.lock();
        entries.evicted.remove(&entry.key);
        entries.live.insert(entry.key, entry);
    }

    /// Returns the entry if it is still within the hard max age.
    pub fn get(&self, key: IdentityKey, now: Duration) -> Option<SkeletonEntry> {
        let entries = self.entries.lock();
        entries
            .live
            .get(&key)
            .filter(|e| e.age(now) < self.max_age)
            .cloned()
    }

    /// Joints for `key`, or `None`.
    ///
    /// `None` is a normal answer: not resolved yet, or evicted.
    pub fn try_get_skeleton(&self, key: IdentityKey, now: Duration) -> Option<Arc<[Vec3]>> {
        self.get(key, now).map(|entry| Arc::clone(&entry.joints))
    }

    /// Returns true if a servable entry exists.
    pub fn contains(&self, key: IdentityKey, now: Duration) -> bool {
        self.get(key, now).is_some()
    }

    pub fn state_of(&self, key: IdentityKey, now: Duration) -> SkeletonState {
        let entries = self.entries.lock();
        match entries.live.get(&key) {
            Some(e) if e.age(now) >= self.max_age => SkeletonState::Evicted,
            Some(e) if e.age(now) >= self.force_refresh => SkeletonState::StaleServed,
            Some(_) => SkeletonState::Fresh,
            None if entries.evicted.contains(&key) => SkeletonState::Evicted,
            None => SkeletonState::Absent,
        }
    }

    /// Evicts entries at or past the max age and returns their keys.
    pub fn prune(&self, now: Duration) -> Vec<IdentityKey> {
        let mut entries = self.entries.lock();
        let max_age = self.max_age;

        let mut expired: Vec<IdentityKey> = entries
            .live
            .values()
            .filter(|e| e.age(now) >= max_age)
            .map(|e| e.key)
            .collect();
        expired.sort();

        for key in &expired {
            entries.live.remove(key);
            entries.evicted.insert(*key);
        }
        expired
    }

    /// Drops eviction tombstones for keys that left the roster.
    pub fn forget_evicted(&self, keep: impl Fn(IdentityKey) -> bool) {
        self.entries.lock().evicted.retain(|k| keep(*k));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
