//! The "Dedup" Pass - Collapsing Duplicate Bodies
//!
//! Roster entries can refer to the same physical body: two entity pointers
//! sharing one hit-zone component, or a duplicate spawn that briefly gets a
//! second transient pointer. Two stages collapse them:
//!
//! 1. **Same key**: entries with equal [`IdentityKey`] merge; the higher
//!    [`Quality`] wins, ties keep the first seen.
//! 2. **Proximity**: survivors whose names match (or one is blank) and
//!    whose world positions are within `world_epsilon`, or whose screen
//!    positions are within `screen_epsilon_px` at a similar depth, are
//!    linked. Every linked group collapses to one winner by the same rule.
//!
//! With distinct qualities the winners depend only on the input set.
//! Output order is the first-seen order of the surviving groups.

use crate::config::CoalesceConfig;
use crate::frame::PositionSample;
use crate::identity::IdentityKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ranking used to pick the canonical entry.
///
/// Fields compare in declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quality {
    pub has_animation: bool,
    pub has_skeleton: bool,
    pub alive: bool,
    /// Health in thousandths, for a total order
    pub health_milli: i64,
    pub has_name: bool,
}

impl Quality {
    pub fn new(
        has_animation: bool,
        has_skeleton: bool,
        alive: bool,
        health: f32,
        has_name: bool,
    ) -> Self {
        let health_milli = if health.is_finite() {
            (f64::from(health) * 1000.0).round() as i64
        } else {
            0
        };
        Self {
            has_animation,
            has_skeleton,
            alive,
            health_milli,
            has_name,
        }
    }
}

/// A sample competing for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub sample: PositionSample,
    pub quality: Quality,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeReason {
    SameKey,
    WorldProximity { distance: f32 },
    ScreenProximity { pixels: f32 },
    /// Linked to the winner only through other members of its group
    Chained,
}

/// One collapse decision.
///
/// Indices point into the candidate list handed to [`coalesce`], so two
/// entries sharing a key stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub winner: IdentityKey,
    pub loser: IdentityKey,
    pub winner_index: usize,
    pub loser_index: usize,
    pub reason: MergeReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalesceOutcome {
    pub samples: Vec<PositionSample>,
    pub merges: Vec<MergeRecord>,
}

/// A candidate tagged with its input position.
type Indexed = (usize, Candidate);

/// Runs both stages.
pub fn coalesce(candidates: Vec<Candidate>, config: &CoalesceConfig) -> CoalesceOutcome {
    let mut merges = Vec::new();
    let by_key = merge_same_key(candidates, &mut merges);
    let survivors = merge_nearby(by_key, config, &mut merges);

    CoalesceOutcome {
        samples: survivors.into_iter().map(|(_, c)| c.sample).collect(),
        merges,
    }
}

fn merge_same_key(candidates: Vec<Candidate>, merges: &mut Vec<MergeRecord>) -> Vec<Indexed> {
    let mut slots: HashMap<IdentityKey, usize> = HashMap::with_capacity(candidates.len());
    let mut kept: Vec<Indexed> = Vec::with_capacity(candidates.len());

    for (index, candidate) in candidates.into_iter().enumerate() {
        let key = candidate.sample.key;
        let Some(&slot) = slots.get(&key) else {
            slots.insert(key, kept.len());
            kept.push((index, candidate));
            continue;
        };

        let held = &mut kept[slot];
        let wins = candidate.quality > held.1.quality;
        let (winner_index, loser_index) = if wins { (index, held.0) } else { (held.0, index) };
        merges.push(MergeRecord {
            winner: key,
            loser: key,
            winner_index,
            loser_index,
            reason: MergeReason::SameKey,
        });
        if wins {
            *held = (index, candidate);
        }
    }
    kept
}

/// Disjoint-set forest over candidate positions.
struct Groups {
    parent: Vec<usize>,
}

impl Groups {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Joins two sets under the lower root.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[high] = low;
        }
    }
}

/// Groups are the connected components of the proximity relation, so
/// chains merge no matter which member arrives first. Each group keeps its
/// highest quality member; ties keep the first seen.
fn merge_nearby(
    candidates: Vec<Indexed>,
    config: &CoalesceConfig,
    merges: &mut Vec<MergeRecord>,
) -> Vec<Indexed> {
    let n = candidates.len();
    let mut groups = Groups::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            if proximity(&candidates[i].1.sample, &candidates[j].1.sample, config).is_some() {
                groups.union(i, j);
            }
        }
    }

    // Members per root, roots in first-seen order
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut roots = Vec::new();
    for i in 0..n {
        let root = groups.find(i);
        if members[root].is_empty() {
            roots.push(root);
        }
        members[root].push(i);
    }

    let mut winners = Vec::with_capacity(roots.len());
    for root in roots {
        let group = &members[root];
        let mut best = group[0];
        for &i in &group[1..] {
            if candidates[i].1.quality > candidates[best].1.quality {
                best = i;
            }
        }
        for &i in group.iter().filter(|&&i| i != best) {
            let (winner, loser) = (&candidates[best], &candidates[i]);
            merges.push(MergeRecord {
                winner: winner.1.sample.key,
                loser: loser.1.sample.key,
                winner_index: winner.0,
                loser_index: loser.0,
                reason: proximity(&winner.1.sample, &loser.1.sample, config)
                    .unwrap_or(MergeReason::Chained),
            });
        }
        winners.push(best);
    }

    let mut slots: Vec<Option<Indexed>> = candidates.into_iter().map(Some).collect();
    winners
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

fn names_compatible(a: &str, b: &str) -> bool {
    a.is_empty() || b.is_empty() || a == b
}

fn proximity(
    a: &PositionSample,
    b: &PositionSample,
    config: &CoalesceConfig,
) -> Option<MergeReason> {
    if !names_compatible(&a.name, &b.name) {
        return None;
    }

    let distance = (a.position - b.position).norm();
    if distance <= config.world_epsilon {
        return Some(MergeReason::WorldProximity { distance });
    }

    let (sa, sb) = (a.screen?, b.screen?);
    let pixels = sa.distance(&sb);
    if pixels <= config.screen_epsilon_px
        && (sa.depth - sb.depth).abs() <= config.screen_depth_tolerance
    {
        return Some(MergeReason::ScreenProximity { pixels });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ScreenPoint;
    use crate::frame::tests::sample_at;
    use crate::math::Vec3;

    fn candidate(key: u64, position: Vec3, health: f32) -> Candidate {
        let mut sample = sample_at(key, position);
        sample.health = health;
        Candidate {
            quality: Quality::new(true, false, health > 0.0, health, false),
            sample,
        }
    }

    #[test]
    fn test_quality_order_follows_field_priority() {
        let animated = Quality::new(true, false, false, 0.0, false);
        let healthy = Quality::new(false, true, true, 100.0, true);
        assert!(animated > healthy);

        let more_health = Quality::new(true, true, true, 90.0, false);
        let less_health = Quality::new(true, true, true, 50.0, true);
        assert!(more_health > less_health);
    }

    #[test]
    fn test_same_key_keeps_higher_quality_in_either_order() {
        let config = CoalesceConfig::default();
        let low = candidate(7, Vec3::new(0.0, 0.0, 0.0), 10.0);
        let high = candidate(7, Vec3::new(300.0, 0.0, 0.0), 90.0);

        for input in [vec![low.clone(), high.clone()], vec![high.clone(), low.clone()]] {
            let out = coalesce(input, &config);
            assert_eq!(out.samples.len(), 1);
            assert_eq!(out.samples[0].health, 90.0);
            assert_eq!(out.merges[0].reason, MergeReason::SameKey);
        }
    }

    #[test]
    fn test_equal_quality_keeps_first_seen() {
        let config = CoalesceConfig::default();
        let a = candidate(7, Vec3::new(1.0, 0.0, 0.0), 50.0);
        let b = candidate(7, Vec3::new(2.0, 0.0, 0.0), 50.0);
        let out = coalesce(vec![a, b], &config);
        assert_eq!(out.samples[0].position.x, 1.0);
    }

    #[test]
    fn test_world_proximity_merges_different_keys() {
        let config = CoalesceConfig::default();
        let out = coalesce(
            vec![
                candidate(1, Vec3::new(100.0, 0.0, 0.0), 40.0),
                candidate(2, Vec3::new(100.3, 0.0, 0.0), 60.0),
                candidate(3, Vec3::new(500.0, 0.0, 0.0), 60.0),
            ],
            &config,
        );

        assert_eq!(out.samples.len(), 2);
        assert_eq!(out.samples[0].key, IdentityKey(2));
        assert_eq!(out.samples[1].key, IdentityKey(3));
        assert_eq!(out.merges.len(), 1);
        assert_eq!(out.merges[0].winner, IdentityKey(2));
        assert_eq!(out.merges[0].loser, IdentityKey(1));
        assert!(matches!(out.merges[0].reason, MergeReason::WorldProximity { .. }));
    }

    #[test]
    fn test_different_names_never_merge() {
        let config = CoalesceConfig::default();
        let mut a = candidate(1, Vec3::new(0.0, 0.0, 0.0), 50.0);
        let mut b = candidate(2, Vec3::new(0.1, 0.0, 0.0), 50.0);
        a.sample.name = "Alpha".into();
        b.sample.name = "Bravo".into();
        assert_eq!(coalesce(vec![a.clone(), b], &config).samples.len(), 2);

        let mut blank = candidate(3, Vec3::new(0.1, 0.0, 0.0), 50.0);
        blank.sample.name.clear();
        assert_eq!(coalesce(vec![a, blank], &config).samples.len(), 1);
    }

    #[test]
    fn test_screen_proximity_requires_similar_depth() {
        let config = CoalesceConfig::default();
        let mut a = candidate(1, Vec3::new(1000.0, 0.0, 0.0), 50.0);
        let mut b = candidate(2, Vec3::new(1010.0, 0.0, 0.0), 50.0);
        a.sample.screen = Some(ScreenPoint {
            x: 960.0,
            y: 540.0,
            depth: 1000.0,
        });
        b.sample.screen = Some(ScreenPoint {
            x: 961.0,
            y: 540.5,
            depth: 1010.0,
        });
        let out = coalesce(vec![a.clone(), b.clone()], &config);
        assert_eq!(out.samples.len(), 1);
        assert!(matches!(out.merges[0].reason, MergeReason::ScreenProximity { .. }));

        b.sample.screen = Some(ScreenPoint {
            depth: 3000.0,
            ..b.sample.screen.unwrap()
        });
        assert_eq!(coalesce(vec![a, b], &config).samples.len(), 2);
    }

    #[test]
    fn test_chain_merges_in_any_order() {
        let config = CoalesceConfig::default();
        let a = candidate(1, Vec3::new(0.0, 0.0, 0.0), 10.0);
        let b = candidate(2, Vec3::new(0.4, 0.0, 0.0), 90.0);
        let c = candidate(3, Vec3::new(0.8, 0.0, 0.0), 50.0);

        for input in [
            vec![a.clone(), b.clone(), c.clone()],
            vec![a.clone(), c.clone(), b.clone()],
            vec![c.clone(), a.clone(), b.clone()],
        ] {
            let out = coalesce(input, &config);
            let keys: Vec<IdentityKey> = out.samples.iter().map(|s| s.key).collect();
            assert_eq!(keys, vec![IdentityKey(2)]);
            assert_eq!(out.merges.len(), 2);
        }
    }

    #[test]
    fn test_chained_loser_recorded_as_chained() {
        let config = CoalesceConfig::default();
        let out = coalesce(
            vec![
                candidate(1, Vec3::new(0.0, 0.0, 0.0), 90.0),
                candidate(2, Vec3::new(0.4, 0.0, 0.0), 10.0),
                candidate(3, Vec3::new(0.8, 0.0, 0.0), 50.0),
            ],
            &config,
        );
        assert_eq!(out.samples[0].key, IdentityKey(1));
        let far = out.merges.iter().find(|m| m.loser == IdentityKey(3)).unwrap();
        assert_eq!(far.reason, MergeReason::Chained);
        assert_eq!(far.loser_index, 2);
    }

    #[test]
    fn test_same_key_merge_records_input_positions() {
        let config = CoalesceConfig::default();
        let out = coalesce(
            vec![
                candidate(4, Vec3::new(500.0, 0.0, 0.0), 50.0),
                candidate(7, Vec3::new(0.0, 0.0, 0.0), 10.0),
                candidate(7, Vec3::new(300.0, 0.0, 0.0), 90.0),
            ],
            &config,
        );

        assert_eq!(out.merges.len(), 1);
        let merge = &out.merges[0];
        assert_eq!(merge.reason, MergeReason::SameKey);
        assert_eq!((merge.winner_index, merge.loser_index), (2, 1));
        // The winner keeps the group's first-seen slot
        assert_eq!(out.samples[1].health, 90.0);
    }
}
