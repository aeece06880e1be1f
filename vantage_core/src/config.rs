//! Pipeline configuration.
//!
//! Every threshold and budget here is an empirical tuning value. All of
//! them can be overridden from JSON; omitted fields keep their defaults.

use crate::identity::{ClassRule, EntityClass};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vantage_env::Address;

// ============================================================================
// WORKER RATES
// ============================================================================

/// Target period of each worker loop, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRates {
    /// Roster/metadata enumeration (default: 150 ms)
    pub roster_ms: f64,

    /// Health and dead flags (default: 16 ms)
    pub vitals_ms: f64,

    /// Positions and frame assembly (default: 3 ms)
    pub position_ms: f64,

    /// Skeleton refresh (default: 4 ms)
    pub pose_ms: f64,

    /// Camera and origin-bias tracking (default: 1 ms)
    pub camera_ms: f64,

    /// Busy-wait tail at the end of each sleep (default: 200 µs)
    pub spin_tail_us: u64,
}

impl Default for WorkerRates {
    fn default() -> Self {
        Self {
            roster_ms: 150.0,
            vitals_ms: 16.0,
            position_ms: 3.0,
            pose_ms: 4.0,
            camera_ms: 1.0,
            spin_tail_us: 200,
        }
    }
}

impl WorkerRates {
    pub fn roster_period(&self) -> Duration {
        millis(self.roster_ms)
    }

    pub fn vitals_period(&self) -> Duration {
        millis(self.vitals_ms)
    }

    pub fn position_period(&self) -> Duration {
        millis(self.position_ms)
    }

    pub fn pose_period(&self) -> Duration {
        millis(self.pose_ms)
    }

    pub fn camera_period(&self) -> Duration {
        millis(self.camera_ms)
    }

    pub fn spin_tail(&self) -> Duration {
        Duration::from_micros(self.spin_tail_us)
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
}

// ============================================================================
// SUBSYSTEM CONFIGS
// ============================================================================

/// Origin-bias detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    /// Single-cycle viewpoint jump treated as a rebase (default: 5000 units)
    pub rebase_threshold: f32,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            rebase_threshold: 5000.0,
        }
    }
}

/// Skeleton staleness budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeletonConfig {
    /// Age after which a refresh is forced regardless of the submit counter (default: 500 ms)
    pub force_refresh_ms: f64,

    /// Age after which an unrefreshed entry is evicted (default: 900 ms)
    pub max_age_ms: f64,

    /// Maximum skeletons refreshed per pose cycle (default: 8)
    pub refresh_cap: usize,

    /// Skeletons resolved per bone-header/joint round pair (default: 4)
    pub refresh_chunk: usize,

    /// Time after which a pose cycle stops starting new chunks (default: 3 ms)
    pub cycle_budget_ms: f64,

    /// Bone indices to resolve, in output order. Index 0 of the output is the head.
    pub joint_indices: Vec<u32>,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            force_refresh_ms: 500.0,
            max_age_ms: 900.0,
            refresh_cap: 8,
            refresh_chunk: 4,
            cycle_budget_ms: 3.0,
            // head, neck, pelvis, shoulders, elbows, hands, thighs, knees, feet
            joint_indices: vec![6, 5, 1, 9, 12, 10, 13, 11, 14, 16, 19, 17, 20, 18],
        }
    }
}

impl SkeletonConfig {
    pub fn force_refresh(&self) -> Duration {
        millis(self.force_refresh_ms)
    }

    pub fn max_age(&self) -> Duration {
        millis(self.max_age_ms)
    }

    pub fn cycle_budget(&self) -> Duration {
        millis(self.cycle_budget_ms)
    }
}

/// Dedup/coalesce epsilons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// World-space merge distance (default: 0.5 units)
    pub world_epsilon: f32,

    /// Screen-space merge distance (default: 2 px)
    pub screen_epsilon_px: f32,

    /// Screen merges also require depths within this tolerance (default: 50 units)
    pub screen_depth_tolerance: f32,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            world_epsilon: 0.5,
            screen_epsilon_px: 2.0,
            screen_depth_tolerance: 50.0,
        }
    }
}

/// Roster enumeration limits and the type allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Entities processed per cycle; the rest are truncated (default: 512)
    pub max_entities: usize,

    /// Counts above this are structural garbage (default: 16384)
    pub max_sane_count: i32,

    /// Type-id classification cache size (default: 4096)
    pub name_cache_capacity: usize,

    /// Attempts to resolve a missing sub-object before giving up (default: 10)
    pub sub_object_retry_limit: u32,

    /// Consecutive structural failures before publishing an empty roster (default: 3)
    pub clear_after_failures: u32,

    /// Allow-list; first match wins
    pub class_rules: Vec<ClassRule>,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            max_entities: 512,
            max_sane_count: 16_384,
            name_cache_capacity: 4096,
            sub_object_retry_limit: 10,
            clear_after_failures: 3,
            class_rules: vec![
                ClassRule::new("PlayerPawn*", EntityClass::Player),
                ClassRule::new("Npc*", EntityClass::Npc),
                ClassRule::new("*Creature*", EntityClass::Creature),
                ClassRule::new("Vehicle*", EntityClass::Vehicle),
                ClassRule::new("Ambient*", EntityClass::Ambient),
            ],
        }
    }
}

/// Ownership query radii.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    /// Distance within which an unowned object is claimed (default: 150)
    pub claim_radius: f32,

    /// Distance within which the current owner keeps it (default: 250)
    pub keep_radius: f32,

    /// Head anchor height above core when no skeleton is cached (default: 70)
    pub head_height: f32,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            claim_radius: 150.0,
            keep_radius: 250.0,
            head_height: 70.0,
        }
    }
}

/// Render target size used for projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920.0,
            height: 1080.0,
        }
    }
}

// ============================================================================
// SOURCE LAYOUT
// ============================================================================

/// Addresses and offsets of the source's data structures.
///
/// These come from outside the engine (an offsets table for a given
/// source build). The defaults describe the layout `vantage_sim` emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLayout {
    // --- entity array header ---
    /// Address of the entity array header
    pub entity_list: Address,
    /// Header: pointer to the first element
    pub list_data: u64,
    /// Header: live element count (i32)
    pub list_count: u64,
    /// Bytes between element pointers
    pub list_stride: u64,
    /// Address holding the local viewer's entity pointer
    pub local_entity: Address,

    // --- type names ---
    /// Base of the type-name table
    pub name_table: Address,
    pub name_entry_stride: u64,
    pub name_max_len: u16,

    // --- entity ---
    pub type_id: u64,
    pub faction: u64,
    pub display_name: u64,
    pub display_name_max_len: u16,
    pub root_component: u64,
    pub mesh: u64,
    pub hit_zone: u64,
    pub health: u64,
    pub health_max: u64,
    pub dead_flag: u64,
    pub downed_flag: u64,

    // --- root component ---
    pub root_location: u64,

    // --- mesh component ---
    pub anim_instance: u64,
    pub component_to_world: u64,
    pub bone_array: u64,
    pub bone_count: u64,
    pub bone_stride: u64,
    /// Offset of the translation inside one bone record
    pub bone_translation: u64,
    pub submit_counter: u64,
    pub last_submit_time: u64,
    pub last_on_screen_time: u64,

    // --- camera ---
    pub camera: Address,
    pub camera_location: u64,
    /// Pitch, yaw, roll in degrees
    pub camera_rotation: u64,
    pub camera_fov: u64,
    /// Address holding the local viewer's root component pointer
    pub local_root: Address,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            entity_list: Address::new(0x1_4000_1000),
            list_data: 0x0,
            list_count: 0x8,
            list_stride: 0x8,
            local_entity: Address::new(0x1_4000_2000),

            name_table: Address::new(0x1_5000_0000),
            name_entry_stride: 0x40,
            name_max_len: 63,

            type_id: 0x18,
            faction: 0x1C,
            display_name: 0x40,
            display_name_max_len: 32,
            root_component: 0x130,
            mesh: 0x280,
            hit_zone: 0x2A0,
            health: 0x300,
            health_max: 0x304,
            dead_flag: 0x308,
            downed_flag: 0x309,

            root_location: 0x128,

            anim_instance: 0x6F0,
            component_to_world: 0x1C0,
            bone_array: 0x5B0,
            bone_count: 0x5B8,
            bone_stride: 0x30,
            bone_translation: 0x10,
            submit_counter: 0x2E0,
            last_submit_time: 0x2E8,
            last_on_screen_time: 0x2EC,

            camera: Address::new(0x1_4000_3000),
            camera_location: 0x0,
            camera_rotation: 0x10,
            camera_fov: 0x20,
            local_root: Address::new(0x1_4000_2008),
        }
    }
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

/// Complete configuration for a [`crate::Pipeline`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub rates: WorkerRates,
    pub bias: BiasConfig,
    pub skeleton: SkeletonConfig,
    pub coalesce: CoalesceConfig,
    pub roster: RosterConfig,
    pub ownership: OwnershipConfig,
    pub viewport: Viewport,
    pub layout: SourceLayout,
}

impl PipelineConfig {
    /// Parses a (possibly partial) JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = [
            ("roster_ms", self.rates.roster_ms),
            ("vitals_ms", self.rates.vitals_ms),
            ("position_ms", self.rates.position_ms),
            ("pose_ms", self.rates.pose_ms),
            ("camera_ms", self.rates.camera_ms),
        ];
        for (name, value) in rates {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::Invalid(format!("rates.{} must be positive", name)));
            }
        }

        if self.bias.rebase_threshold <= 0.0 {
            return Err(ConfigError::Invalid("bias.rebase_threshold must be positive".into()));
        }
        if self.skeleton.max_age_ms <= self.skeleton.force_refresh_ms {
            return Err(ConfigError::Invalid(
                "skeleton.max_age_ms must exceed skeleton.force_refresh_ms".into(),
            ));
        }
        if self.skeleton.refresh_chunk == 0 {
            return Err(ConfigError::Invalid("skeleton.refresh_chunk must be non-zero".into()));
        }
        if !(self.skeleton.cycle_budget_ms >= 0.0 && self.skeleton.cycle_budget_ms.is_finite()) {
            return Err(ConfigError::Invalid(
                "skeleton.cycle_budget_ms must be a non-negative number".into(),
            ));
        }
        if self.skeleton.joint_indices.is_empty() {
            return Err(ConfigError::Invalid("skeleton.joint_indices is empty".into()));
        }
        if self.ownership.keep_radius < self.ownership.claim_radius {
            return Err(ConfigError::Invalid(
                "ownership.keep_radius must be at least ownership.claim_radius".into(),
            ));
        }
        if self.roster.max_entities == 0 {
            return Err(ConfigError::Invalid("roster.max_entities must be non-zero".into()));
        }
        if self.viewport.width <= 0.0 || self.viewport.height <= 0.0 {
            return Err(ConfigError::Invalid("viewport must have a positive size".into()));
        }
        Ok(())
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(String),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
