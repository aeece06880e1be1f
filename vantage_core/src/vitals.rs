//! Health and life-state snapshot, refreshed by the vitals worker.

use crate::identity::IdentityKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Last known vitals for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub health: f32,
    pub health_max: f32,
    pub dead: bool,
    pub downed: bool,

    /// When any field was last read successfully
    pub updated_at: Duration,
}

impl Vitals {
    pub fn alive(&self) -> bool {
        !self.dead && self.health > 0.0
    }

    /// Merges freshly read fields; `None` keeps the previous value.
    pub fn merge(
        previous: Option<&Vitals>,
        health: Option<f32>,
        health_max: Option<f32>,
        dead: Option<bool>,
        downed: Option<bool>,
        now: Duration,
    ) -> Option<Vitals> {
        let any = health.is_some() || health_max.is_some() || dead.is_some() || downed.is_some();
        match previous {
            Some(prev) => Some(Vitals {
                health: health.unwrap_or(prev.health),
                health_max: health_max.unwrap_or(prev.health_max),
                dead: dead.unwrap_or(prev.dead),
                downed: downed.unwrap_or(prev.downed),
                updated_at: if any { now } else { prev.updated_at },
            }),
            None if any => Some(Vitals {
                health: health.unwrap_or(0.0),
                health_max: health_max.unwrap_or(0.0),
                dead: dead.unwrap_or(false),
                downed: downed.unwrap_or(false),
                updated_at: now,
            }),
            None => None,
        }
    }
}

/// All vitals known at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalsSnapshot {
    pub captured_at: Duration,
    pub by_key: HashMap<IdentityKey, Vitals>,
}

impl VitalsSnapshot {
    pub fn get(&self, key: IdentityKey) -> Option<&Vitals> {
        self.by_key.get(&key)
    }
}
