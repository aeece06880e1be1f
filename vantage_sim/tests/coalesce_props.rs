//! Property tests for the dedup pass.

use proptest::prelude::*;
use vantage_core::coalesce::{coalesce, Candidate, Quality};
use vantage_core::config::CoalesceConfig;
use vantage_core::{EntityClass, IdentityKey, PositionSample, Vec3, WorldTransform};

fn candidate(key: u64, position: Vec3, health: f32) -> Candidate {
    Candidate {
        sample: PositionSample {
            key: IdentityKey(key),
            class: EntityClass::Npc,
            faction: 0,
            name: String::new(),
            position,
            pose: WorldTransform::from_translation(position),
            submit_time: 0.0,
            on_screen_time: 0.0,
            health,
            health_max: 100.0,
            dead: false,
            downed: false,
            screen: None,
            distance: position.norm(),
        },
        quality: Quality::new(true, false, true, health, false),
    }
}

/// Well separated clusters; members of one cluster lie within the world
/// epsilon of each other and every candidate has a distinct quality.
fn clusters() -> impl Strategy<Value = (usize, Vec<Candidate>)> {
    prop::collection::vec(1usize..5, 1..6).prop_map(|sizes| {
        let mut out = Vec::new();
        let mut key = 1;
        for (c, size) in sizes.iter().enumerate() {
            let center = Vec3::new(1000.0 + 200.0 * c as f32, 0.0, 0.0);
            for m in 0..*size {
                let offset = Vec3::new(0.1 * m as f32, 0.0, 0.0);
                out.push(candidate(key, center + offset, key as f32));
                key += 1;
            }
        }
        (sizes.len(), out)
    })
}

/// Well separated chains. Consecutive members are closer than the world
/// epsilon (0.5) but a chain of three or more spans more than it, so only
/// transitive linking puts a whole chain in one group.
fn chains() -> impl Strategy<Value = (usize, Vec<Candidate>)> {
    prop::collection::vec(prop::collection::vec(0.26f32..0.49, 1..5), 1..6).prop_map(|chains| {
        let mut out = Vec::new();
        let mut key = 1;
        for (c, gaps) in chains.iter().enumerate() {
            let mut at = Vec3::new(1000.0 + 200.0 * c as f32, 0.0, 0.0);
            out.push(candidate(key, at, key as f32));
            key += 1;
            for gap in gaps {
                at.x += gap;
                out.push(candidate(key, at, key as f32));
                key += 1;
            }
        }
        (chains.len(), out)
    })
}

fn sorted_keys(candidates: Vec<Candidate>) -> Vec<IdentityKey> {
    let mut keys: Vec<IdentityKey> = coalesce(candidates, &CoalesceConfig::default())
        .samples
        .iter()
        .map(|s| s.key)
        .collect();
    keys.sort();
    keys
}

proptest! {
    #[test]
    fn test_permutation_does_not_change_winners(
        (count, original, shuffled) in clusters().prop_flat_map(|(count, c)| {
            (Just(count), Just(c.clone()), Just(c).prop_shuffle())
        })
    ) {
        let expected = sorted_keys(original);
        prop_assert_eq!(expected.len(), count);
        prop_assert_eq!(sorted_keys(shuffled), expected);
    }

    #[test]
    fn test_chains_collapse_regardless_of_order(
        (count, original, shuffled) in chains().prop_flat_map(|(count, c)| {
            (Just(count), Just(c.clone()), Just(c).prop_shuffle())
        })
    ) {
        let expected = sorted_keys(original);
        prop_assert_eq!(expected.len(), count);
        prop_assert_eq!(sorted_keys(shuffled), expected);
    }

    #[test]
    fn test_output_keys_are_unique(
        keys in prop::collection::vec(0u64..8, 0..24)
    ) {
        let candidates: Vec<Candidate> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| candidate(*k, Vec3::new(500.0 * i as f32, 0.0, 0.0), 50.0))
            .collect();
        let out = coalesce(candidates, &CoalesceConfig::default());

        let mut seen: Vec<IdentityKey> = out.samples.iter().map(|s| s.key).collect();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        prop_assert_eq!(seen.len(), total);

        let mut distinct = keys.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(total, distinct.len());
    }
}
