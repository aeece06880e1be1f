//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the simulated source:
//! - True positions of all entities (before any origin shift)
//! - Kinematics and animation counters
//! - The source's memory image, written into a [`SimMemory`] per
//!   [`SourceLayout`]
//!
//! Raw coordinates in memory are `truth + origin`. A rebase moves `origin`
//! by a large vector in one step, which is exactly what the pipeline's bias
//! corrector must undo.

use crate::memory::SimMemory;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;
use vantage_core::config::SourceLayout;
use vantage_core::{EntityClass, IdentityKey, Vec3};
use vantage_env::{Address, RawTransform, ReadValue};

/// Bones written per skeleton.
pub const BONE_COUNT: u64 = 24;

/// Spacing between consecutive bones along +z in mesh space.
pub const BONE_SPACING: f32 = 5.0;

/// Camera height above the local viewer.
const EYE_HEIGHT: f32 = 60.0;

/// Standard deviation of spawned velocities (units/s).
const SPEED_STD: f32 = 60.0;

/// Address bases; each entity id gets a 0x1000 stride inside each.
const ENTITY_BASE: u64 = 0x3000_0000;
const ROOT_BASE: u64 = 0x4000_0000;
const MESH_BASE: u64 = 0x5000_0000;
const ANIM_BASE: u64 = 0x6000_0000;
const HIT_ZONE_BASE: u64 = 0x7000_0000;
const BONES_BASE: u64 = 0x8000_0000;
const LIST_DATA: u64 = 0x2000_0000;

/// Kinds of synthetic entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Archetype {
    Player,
    Npc,
    Creature,
    Vehicle,
    Ambient,
    /// Not on the default allow-list
    Prop,
}

impl Archetype {
    pub fn type_id(self) -> u32 {
        match self {
            Archetype::Npc => 10,
            Archetype::Player => 11,
            Archetype::Creature => 12,
            Archetype::Vehicle => 13,
            Archetype::Ambient => 14,
            Archetype::Prop => 20,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Archetype::Npc => "NpcSoldier_C",
            Archetype::Player => "PlayerPawn_C",
            Archetype::Creature => "WildCreature_C",
            Archetype::Vehicle => "VehicleJeep_C",
            Archetype::Ambient => "AmbientBird_C",
            Archetype::Prop => "StaticProp_C",
        }
    }

    /// Classification the default roster rules should produce.
    pub fn class(self) -> Option<EntityClass> {
        match self {
            Archetype::Player => Some(EntityClass::Player),
            Archetype::Npc => Some(EntityClass::Npc),
            Archetype::Creature => Some(EntityClass::Creature),
            Archetype::Vehicle => Some(EntityClass::Vehicle),
            Archetype::Ambient => Some(EntityClass::Ambient),
            Archetype::Prop => None,
        }
    }
}

/// A ground truth entity in the simulation.
#[derive(Debug, Clone)]
pub struct SimEntity {
    pub id: u64,
    pub archetype: Archetype,
    pub entity: Address,
    pub root: Address,
    pub mesh: Address,
    /// Null for entities without animation
    pub animation: Address,
    pub hit_zone: Address,
    pub bones: Address,
    pub name: String,

    /// True position (independent of the source origin)
    pub position: Vec3,
    pub velocity: Vec3,

    pub health: f32,
    pub dead: bool,

    /// Animating entities advance their submit counter every step
    pub animating: bool,
    pub submit_counter: u32,

    /// Ghost copies follow another entity's position
    pub mirror_of: Option<u64>,
}

impl SimEntity {
    pub fn key(&self) -> IdentityKey {
        IdentityKey(self.hit_zone.raw())
    }

    /// True head position (bone 6 of the default joint list).
    pub fn head(&self) -> Vec3 {
        self.position + Vec3::new(0.0, 0.0, 6.0 * BONE_SPACING)
    }
}

/// The Oracle - owns ground truth and the source's memory image.
pub struct Oracle {
    layout: SourceLayout,
    memory: Arc<SimMemory>,

    /// RNG for spawning (separate from the memory fault stream)
    rng: ChaCha8Rng,

    entities: BTreeMap<u64, SimEntity>,

    /// Entity ids in list order
    order: Vec<u64>,

    next_id: u64,

    /// The local viewer (id 0)
    local: u64,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Source origin: raw = truth + origin
    origin: Vec3,

    /// Rebases applied
    rebases: u64,
}

impl Oracle {
    /// Creates a source with only the local viewer in it.
    pub fn new(seed: u64, layout: SourceLayout, memory: Arc<SimMemory>) -> Self {
        let mut oracle = Self {
            layout,
            memory,
            rng: ChaCha8Rng::seed_from_u64(seed),
            entities: BTreeMap::new(),
            order: Vec::new(),
            next_id: 0,
            local: 0,
            current_time: 0.0,
            origin: Vec3::zeros(),
            rebases: 0,
        };

        let l = &oracle.layout;
        oracle
            .memory
            .write_pointer(l.entity_list.offset(l.list_data), Address::new(LIST_DATA));

        oracle.local = oracle.spawn(Archetype::Player, Vec3::zeros(), Vec3::zeros());
        if let Some(local) = oracle.entities.get(&oracle.local) {
            oracle
                .memory
                .write_pointer(oracle.layout.local_entity, local.entity);
            oracle
                .memory
                .write_pointer(oracle.layout.local_root, local.root);
        }
        oracle.write_camera();
        oracle
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.memory
    }

    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    /// Current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// Current source origin offset.
    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn rebases(&self) -> u64 {
        self.rebases
    }

    pub fn entity(&self, id: u64) -> Option<&SimEntity> {
        self.entities.get(&id)
    }

    pub fn local(&self) -> Option<&SimEntity> {
        self.entities.get(&self.local)
    }

    /// Every live entity except the local viewer.
    pub fn active_entities(&self) -> impl Iterator<Item = &SimEntity> {
        let local = self.local;
        self.entities.values().filter(move |e| e.id != local)
    }

    /// Keys a correct pipeline publishes: tracked, non-local, non-ghost.
    pub fn expected_keys(&self) -> BTreeSet<IdentityKey> {
        self.active_entities()
            .filter(|e| e.archetype.class().is_some() && e.mirror_of.is_none())
            .map(SimEntity::key)
            .collect()
    }

    /// True position of the (non-ghost) entity with `key`.
    pub fn truth_of(&self, key: IdentityKey) -> Option<Vec3> {
        self.active_entities()
            .find(|e| e.key() == key && e.mirror_of.is_none())
            .map(|e| e.position)
    }

    /// Maps any key the roster could have derived for an entity (hit zone,
    /// animation or entity pointer) to that entity's hit-zone key.
    pub fn canonical(&self, key: IdentityKey) -> Option<IdentityKey> {
        let raw = key.0;
        self.active_entities()
            .find(|e| {
                e.hit_zone.raw() == raw
                    || (!e.animation.is_null() && e.animation.raw() == raw)
                    || e.entity.raw() == raw
            })
            .map(SimEntity::key)
    }

    /// Ground truth as `(key, position)` for export.
    pub fn ground_truth(&self) -> Vec<(IdentityKey, Vec3)> {
        self.expected_keys()
            .into_iter()
            .filter_map(|k| self.truth_of(k).map(|p| (k, p)))
            .collect()
    }

    // ========================================================================
    // POPULATION
    // ========================================================================

    /// Spawns one entity and appends it to the list.
    pub fn spawn(&mut self, archetype: Archetype, position: Vec3, velocity: Vec3) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let at = |base: u64| Address::new(base + id * 0x1000);

        let entity = SimEntity {
            id,
            archetype,
            entity: at(ENTITY_BASE),
            root: at(ROOT_BASE),
            mesh: at(MESH_BASE),
            animation: at(ANIM_BASE),
            hit_zone: at(HIT_ZONE_BASE),
            bones: at(BONES_BASE),
            name: format!("{}-{}", archetype.type_name().trim_end_matches("_C"), id),
            position,
            velocity,
            health: 100.0,
            dead: false,
            animating: true,
            submit_counter: 1,
            mirror_of: None,
        };
        self.insert(entity);
        id
    }

    /// Spawns `count` entities at random positions in front of the viewer.
    pub fn spawn_random(&mut self, archetype: Archetype, count: usize) -> Vec<u64> {
        (0..count)
            .map(|_| {
                let position = Vec3::new(
                    self.rng.gen_range(800.0..4000.0),
                    self.rng.gen_range(-1500.0..1500.0),
                    0.0,
                );
                let vx: f32 = self.rng.sample(StandardNormal);
                let vy: f32 = self.rng.sample(StandardNormal);
                let velocity = Vec3::new(vx * SPEED_STD, vy * SPEED_STD, 0.0);
                self.spawn(archetype, position, velocity)
            })
            .collect()
    }

    /// Spawns a second entity object that shares `id`'s hit zone (same
    /// identity key, distinct entity pointer).
    pub fn spawn_duplicate(&mut self, id: u64) -> Option<u64> {
        let original = self.entities.get(&id)?.clone();
        let dup = self.next_id;
        self.next_id += 1;
        let at = |base: u64| Address::new(base + dup * 0x1000);

        self.insert(SimEntity {
            id: dup,
            entity: at(ENTITY_BASE),
            root: at(ROOT_BASE),
            mesh: at(MESH_BASE),
            animation: Address::NULL,
            bones: at(BONES_BASE),
            animating: false,
            mirror_of: Some(id),
            ..original
        });
        Some(dup)
    }

    /// Spawns a ghost with its own key standing where `id` stands.
    pub fn spawn_ghost(&mut self, id: u64) -> Option<u64> {
        let ghost = self.spawn_duplicate(id)?;
        if let Some(e) = self.entities.get_mut(&ghost) {
            e.hit_zone = Address::new(HIT_ZONE_BASE + ghost * 0x1000);
        }
        self.sync_mirrors();
        if let Some(e) = self.entities.get(&ghost).cloned() {
            self.write_entity(&e);
        }
        Some(ghost)
    }

    /// Removes an entity from the list. Its memory stays mapped (stale).
    pub fn despawn(&mut self, id: u64) -> bool {
        if id == self.local || self.entities.remove(&id).is_none() {
            return false;
        }
        self.order.retain(|i| *i != id);
        self.write_list();
        debug!(id, "despawned");
        true
    }

    /// Despawns a random non-local entity.
    pub fn despawn_random(&mut self) -> Option<u64> {
        let candidates: Vec<u64> = self.active_entities().map(|e| e.id).collect();
        if candidates.is_empty() {
            return None;
        }
        let id = candidates[self.rng.gen_range(0..candidates.len())];
        self.despawn(id).then_some(id)
    }

    pub fn set_health(&mut self, id: u64, health: f32, dead: bool) {
        let Some(e) = self.entities.get_mut(&id) else {
            return;
        };
        e.health = health;
        e.dead = dead;
        let (entity, l) = (e.entity, &self.layout);
        self.memory
            .write(entity.offset(l.health), ReadValue::F32(health));
        self.memory
            .write(entity.offset(l.dead_flag), ReadValue::U8(u8::from(dead)));
    }

    pub fn set_animating(&mut self, id: u64, animating: bool) {
        if let Some(e) = self.entities.get_mut(&id) {
            e.animating = animating;
        }
    }

    // ========================================================================
    // TIME
    // ========================================================================

    /// Advances kinematics and animation by `dt` seconds and rewrites the
    /// dynamic part of the memory image.
    pub fn step(&mut self, dt: f64) {
        self.current_time += dt;
        let dt = dt as f32;
        let local = self.local;

        for e in self.entities.values_mut() {
            if e.id == local || e.mirror_of.is_some() || e.dead {
                continue;
            }
            e.position += e.velocity * dt;
            // Keep everything inside the arena in front of the viewer
            if !(500.0..=4500.0).contains(&e.position.x) {
                e.velocity.x = -e.velocity.x;
                e.position.x = e.position.x.clamp(500.0, 4500.0);
            }
            if !(-2000.0..=2000.0).contains(&e.position.y) {
                e.velocity.y = -e.velocity.y;
                e.position.y = e.position.y.clamp(-2000.0, 2000.0);
            }
            if e.animating {
                e.submit_counter = e.submit_counter.wrapping_add(1);
            }
        }
        self.sync_mirrors();

        let ids: Vec<u64> = self.entities.keys().copied().collect();
        for id in ids {
            if let Some(e) = self.entities.get(&id) {
                let e = e.clone();
                self.write_dynamic(&e);
            }
        }
    }

    /// Shifts the source origin by `shift` in one step.
    pub fn rebase_origin(&mut self, shift: Vec3) {
        self.origin += shift;
        self.rebases += 1;
        debug!(x = shift.x, y = shift.y, z = shift.z, "source origin rebased");

        let all: Vec<SimEntity> = self.entities.values().cloned().collect();
        for e in &all {
            self.write_dynamic(e);
        }
        self.write_camera();
    }

    // ========================================================================
    // MEMORY IMAGE
    // ========================================================================

    fn raw(&self, truth: Vec3) -> [f32; 3] {
        let r = truth + self.origin;
        [r.x, r.y, r.z]
    }

    fn insert(&mut self, entity: SimEntity) {
        self.write_entity(&entity);
        self.order.push(entity.id);
        self.entities.insert(entity.id, entity);
        self.write_list();
    }

    fn sync_mirrors(&mut self) {
        let mirrors: Vec<(u64, u64)> = self
            .entities
            .values()
            .filter_map(|e| e.mirror_of.map(|of| (e.id, of)))
            .collect();
        for (id, of) in mirrors {
            let Some(target) = self.entities.get(&of).map(|t| t.position) else {
                continue;
            };
            if let Some(e) = self.entities.get_mut(&id) {
                e.position = target + Vec3::new(0.1, 0.0, 0.0);
            }
        }
    }

    fn write_list(&self) {
        let l = &self.layout;
        for (i, id) in self.order.iter().enumerate() {
            if let Some(e) = self.entities.get(id) {
                self.memory.write_pointer(
                    Address::new(LIST_DATA).offset(i as u64 * l.list_stride),
                    e.entity,
                );
            }
        }
        self.memory.write(
            l.entity_list.offset(l.list_count),
            ReadValue::I32(self.order.len() as i32),
        );
    }

    fn write_camera(&self) {
        let l = &self.layout;
        let eye = self
            .local()
            .map(|e| e.position)
            .unwrap_or_else(Vec3::zeros)
            + Vec3::new(0.0, 0.0, EYE_HEIGHT);
        self.memory
            .write(l.camera.offset(l.camera_location), ReadValue::Vec3(self.raw(eye)));
        self.memory
            .write(l.camera.offset(l.camera_rotation), ReadValue::Vec3([0.0, 0.0, 0.0]));
        self.memory
            .write(l.camera.offset(l.camera_fov), ReadValue::F32(90.0));
    }

    fn write_entity(&self, e: &SimEntity) {
        let l = &self.layout;
        let m = &self.memory;
        let archetype = e.archetype;

        m.write(e.entity.offset(l.type_id), ReadValue::U32(archetype.type_id()));
        m.write(e.entity.offset(l.faction), ReadValue::U32(1));
        m.write(e.entity.offset(l.display_name), ReadValue::Text(e.name.clone()));
        m.write(
            l.name_table
                .offset(u64::from(archetype.type_id()) * l.name_entry_stride),
            ReadValue::Text(archetype.type_name().to_string()),
        );

        m.write_pointer(e.entity.offset(l.root_component), e.root);
        m.write_pointer(e.entity.offset(l.mesh), e.mesh);
        m.write_pointer(e.entity.offset(l.hit_zone), e.hit_zone);
        m.write_pointer(e.mesh.offset(l.anim_instance), e.animation);

        m.write(e.entity.offset(l.health), ReadValue::F32(e.health));
        m.write(e.entity.offset(l.health_max), ReadValue::F32(100.0));
        m.write(e.entity.offset(l.dead_flag), ReadValue::U8(u8::from(e.dead)));
        m.write(e.entity.offset(l.downed_flag), ReadValue::U8(0));

        m.write_pointer(e.mesh.offset(l.bone_array), e.bones);
        m.write(e.mesh.offset(l.bone_count), ReadValue::I32(BONE_COUNT as i32));
        for j in 0..BONE_COUNT {
            m.write(
                e.bones.offset(j * l.bone_stride + l.bone_translation),
                ReadValue::Vec3([0.0, 0.0, j as f32 * BONE_SPACING]),
            );
        }
        self.write_dynamic(e);
    }

    fn write_dynamic(&self, e: &SimEntity) {
        let l = &self.layout;
        let m = &self.memory;
        let raw = self.raw(e.position);
        let now = self.current_time as f32;

        m.write(e.root.offset(l.root_location), ReadValue::Vec3(raw));
        m.write(
            e.mesh.offset(l.component_to_world),
            ReadValue::Transform(RawTransform::from_translation(raw)),
        );
        m.write(e.mesh.offset(l.submit_counter), ReadValue::U32(e.submit_counter));
        m.write(e.mesh.offset(l.last_submit_time), ReadValue::F32(now));
        m.write(e.mesh.offset(l.last_on_screen_time), ReadValue::F32(now));
    }
}
