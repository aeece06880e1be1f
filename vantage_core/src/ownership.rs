//! Nearest-owner query with hysteresis.
//!
//! External objects (dropped items, projectiles, vehicles being driven)
//! are attributed to the nearest entity. An object is claimed inside
//! `claim_radius` and kept inside the wider `keep_radius`, so an owner
//! standing near the edge does not flap.

use crate::bias::Bias;
use crate::config::OwnershipConfig;
use crate::frame::Frame;
use crate::identity::IdentityKey;
use crate::math::Vec3;
use crate::skeleton::SkeletonCache;
use std::collections::HashMap;
use std::time::Duration;

/// Reference points of one candidate owner, in the frame's bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub key: IdentityKey,
    pub core: Vec3,
    pub head: Vec3,
}

impl Anchor {
    fn distance(&self, p: &Vec3) -> f32 {
        (p - self.core).norm().min((p - self.head).norm())
    }
}

/// Builds anchors for every living sample in `frame`.
///
/// The head anchor is the cached head joint when available, otherwise the
/// core raised by `head_height`. Cached joints are already world-continuous
/// and are used as published.
pub fn anchors_from_frame(
    frame: &Frame,
    skeletons: &SkeletonCache,
    now: Duration,
    head_height: f32,
) -> Vec<Anchor> {
    frame
        .samples
        .iter()
        .filter(|s| !s.dead)
        .map(|s| {
            let head = skeletons
                .get(s.key, now)
                .and_then(|entry| entry.head())
                .unwrap_or_else(|| s.position + Vec3::new(0.0, 0.0, head_height));
            Anchor {
                key: s.key,
                core: s.position,
                head,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ownership {
    pub owner: IdentityKey,
    pub distance: f32,
}

/// Tracks the current owner per external object id.
#[derive(Debug, Clone)]
pub struct OwnershipResolver {
    config: OwnershipConfig,
    owners: HashMap<u64, IdentityKey>,
}

impl OwnershipResolver {
    pub fn new(config: OwnershipConfig) -> Self {
        Self {
            config,
            owners: HashMap::new(),
        }
    }

    pub fn config(&self) -> &OwnershipConfig {
        &self.config
    }

    /// Resolves the owner of `object` at `position`.
    ///
    /// `position_bias` is whatever bias the caller already applied to a
    /// position read in the frame's source origin; [`Bias::zero`] for a raw
    /// read. It is swapped for the frame's bias before measuring.
    pub fn resolve(
        &mut self,
        object: u64,
        position: Vec3,
        position_bias: &Bias,
        frame: &Frame,
        anchors: &[Anchor],
    ) -> Option<Ownership> {
        let p = position_bias.rebase(&position, &frame.bias);

        if let Some(current) = self.owners.get(&object).copied() {
            if let Some(anchor) = anchors.iter().find(|a| a.key == current) {
                let distance = anchor.distance(&p);
                if distance <= self.config.keep_radius {
                    return Some(Ownership {
                        owner: current,
                        distance,
                    });
                }
            }
        }

        let nearest = anchors
            .iter()
            .map(|a| (a.distance(&p), a.key))
            .filter(|(d, _)| *d <= self.config.claim_radius)
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        match nearest {
            Some((distance, owner)) => {
                self.owners.insert(object, owner);
                Some(Ownership { owner, distance })
            }
            None => {
                self.owners.remove(&object);
                None
            }
        }
    }

    /// Drops the record for an object that no longer exists.
    pub fn forget(&mut self, object: u64) {
        self.owners.remove(&object);
    }

    pub fn tracked(&self) -> usize {
        self.owners.len()
    }
}
