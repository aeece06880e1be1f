//! Entity identity keys and closed classification.
//!
//! The raw entity pointer is a poor identity: the source re-creates it on
//! cosmetic changes. Sub-objects such as the hit-zone component outlive
//! that churn, so the key prefers them.

use serde::{Deserialize, Serialize};
use vantage_env::Address;

/// Stable 64-bit handle for one physical body.
///
/// Within one polling epoch, two roster entries with the same key are the
/// same body and are merged before publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub u64);

/// Which sub-object a key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    HitZone,
    Animation,
    Entity,
}

impl IdentityKey {
    /// Picks the key: hit-zone component, then animation component, then
    /// the raw entity pointer.
    pub fn resolve(entity: Address, animation: Address, hit_zone: Address) -> (Self, KeySource) {
        if !hit_zone.is_null() {
            (Self(hit_zone.raw()), KeySource::HitZone)
        } else if !animation.is_null() {
            (Self(animation.raw()), KeySource::Animation)
        } else {
            (Self(entity.raw()), KeySource::Entity)
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Closed classification produced once by the roster builder.
///
/// Downstream workers branch on this tag instead of re-matching type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Player,
    Npc,
    Creature,
    Vehicle,
    /// Tracked but low priority (props, ambient wildlife)
    Ambient,
}

impl EntityClass {
    /// Background entities lose every priority contest.
    pub fn is_background(self) -> bool {
        matches!(self, EntityClass::Ambient)
    }
}

/// One allow-list rule: type names matching `pattern` are tracked as `class`.
///
/// Patterns support a leading and/or trailing `*` wildcard
/// (`"Npc*"`, `"*Deer*"`, `"*_Vehicle"`); anything else is an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRule {
    pub pattern: String,
    pub class: EntityClass,
}

impl ClassRule {
    pub fn new(pattern: &str, class: EntityClass) -> Self {
        Self {
            pattern: pattern.to_string(),
            class,
        }
    }

    /// Returns true if `type_name` matches this rule's pattern.
    pub fn matches(&self, type_name: &str) -> bool {
        let p = self.pattern.as_str();
        match (p.strip_prefix('*'), p.strip_suffix('*')) {
            _ if p == "*" => true,
            (Some(rest), _) if rest.ends_with('*') => {
                type_name.contains(&rest[..rest.len() - 1])
            }
            (Some(suffix), _) => type_name.ends_with(suffix),
            (None, Some(prefix)) => type_name.starts_with(prefix),
            (None, None) => type_name == p,
        }
    }
}

/// First matching rule wins; `None` means "not worth tracking".
pub fn classify(rules: &[ClassRule], type_name: &str) -> Option<EntityClass> {
    rules
        .iter()
        .find(|rule| rule.matches(type_name))
        .map(|rule| rule.class)
}
