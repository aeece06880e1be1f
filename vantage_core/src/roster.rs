//! Roster Builder - Who Is Worth Tracking
//!
//! Each low-rate cycle enumerates the source's entity array and produces
//! the authoritative [`RosterSnapshot`]:
//!
//! ```text
//! R1  header         data pointer, live count, local entity
//! R2  pointers       up to max_entities element pointers
//! R3  metadata       type id, faction, display name per pointer
//! R4  type names     only ids missing from the name cache
//! R5  sub-objects    root, mesh, hit-zone (+ animation if mesh is known)
//! R6  animation      only for meshes first resolved in R5
//! ```
//!
//! In steady state (warm name cache, sub-objects cached) only R1-R3 reach
//! the backend; the later rounds are empty and skipped.
//!
//! Sub-object pointers are sticky: once resolved they are kept until the
//! parent entity leaves the array, even if a later read returns null. The
//! identity key is fixed the first time an entity is published.

use crate::config::{RosterConfig, SourceLayout};
use crate::identity::{classify, EntityClass, IdentityKey, KeySource};
use crate::worker::{CycleError, CycleReport};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;
use vantage_env::{Address, ReadError, ReadKind, ScatterReader, SlotId};

// ============================================================================
// TYPES
// ============================================================================

/// Cached sub-object pointers of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubObjects {
    pub root: Address,
    pub mesh: Address,
    pub animation: Address,
    pub hit_zone: Address,
}

impl SubObjects {
    /// Fills unresolved pointers from `fresh`. Resolved pointers are never
    /// overwritten and implausible values are ignored.
    pub fn merge_missing(&mut self, fresh: &SubObjects) {
        fn fill(slot: &mut Address, value: Address) {
            if slot.is_null() && value.is_plausible() {
                *slot = value;
            }
        }
        fill(&mut self.root, fresh.root);
        fill(&mut self.mesh, fresh.mesh);
        fill(&mut self.animation, fresh.animation);
        fill(&mut self.hit_zone, fresh.hit_zone);
    }

    pub fn is_complete(&self) -> bool {
        !(self.root.is_null()
            || self.mesh.is_null()
            || self.animation.is_null()
            || self.hit_zone.is_null())
    }
}

/// One tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub key: IdentityKey,
    pub key_source: KeySource,
    pub entity: Address,
    pub class: EntityClass,
    pub type_id: u32,
    pub type_name: String,
    pub faction: u32,
    pub name: String,
    pub sub: SubObjects,
}

/// The roster as of one enumeration.
///
/// Entries may share a key (two pointers to one body); the coalesce pass
/// collapses those before publication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    /// Increments on every published roster; 0 means "never built"
    pub epoch: u64,
    pub captured_at: Duration,
    pub entries: Vec<RosterEntry>,
    pub local_entity: Option<Address>,
    /// Live entities dropped by the `max_entities` cap
    pub truncated: usize,
}

impl RosterSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry per key, in roster order.
    pub fn unique_by_key(&self) -> impl Iterator<Item = &RosterEntry> {
        let mut seen = HashSet::new();
        self.entries.iter().filter(move |e| seen.insert(e.key))
    }

    pub fn entry(&self, key: IdentityKey) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

/// Output of one successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterBuild {
    pub entries: Vec<RosterEntry>,
    pub local_entity: Option<Address>,
    pub truncated: usize,
    pub report: CycleReport,
}

#[derive(Debug, Clone)]
struct KnownEntity {
    type_id: u32,
    class: EntityClass,
    type_name: String,
    faction: u32,
    name: String,
    sub: SubObjects,
    retries: u32,

    /// Key of the first published entry for this pointer
    key: Option<(IdentityKey, KeySource)>,
}

#[derive(Debug, Clone)]
struct TypeName {
    name: String,
    class: Option<EntityClass>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Stateful roster enumerator. Owned by the roster worker.
#[derive(Debug)]
pub struct RosterBuilder {
    config: RosterConfig,
    layout: SourceLayout,

    /// type id -> name and classification
    names: HashMap<u32, TypeName>,

    /// Entities seen in the array, by raw pointer
    known: HashMap<Address, KnownEntity>,

    /// Element pointers from the previous cycle, by array index
    previous_slots: Vec<Address>,
}

impl RosterBuilder {
    pub fn new(config: RosterConfig, layout: SourceLayout) -> Self {
        Self {
            config,
            layout,
            names: HashMap::new(),
            known: HashMap::new(),
            previous_slots: Vec::new(),
        }
    }

    /// Number of cached type-id classifications.
    pub fn cached_type_names(&self) -> usize {
        self.names.len()
    }

    /// Number of entities with cached sub-objects.
    pub fn known_entities(&self) -> usize {
        self.known.len()
    }

    /// Enumerates the entity array once.
    pub fn build<R: ScatterReader>(&mut self, reader: &R) -> Result<RosterBuild, CycleError> {
        let mut report = CycleReport::default();

        // --- R1: header ---
        let layout = &self.layout;
        let mut round = reader.begin_round();
        let data_slot = round.add(layout.entity_list.offset(layout.list_data), ReadKind::Pointer);
        let count_slot = round.add(layout.entity_list.offset(layout.list_count), ReadKind::I32);
        let local_slot = round.add(layout.local_entity, ReadKind::Pointer);
        let header = round.execute();
        report.absorb(&header);

        let count = header.i32(count_slot).ok_or(ReadError::SlotFailed)?;
        if count < 0 || count > self.config.max_sane_count {
            return Err(CycleError::structural(format!("entity count {} out of range", count)));
        }
        let data = header.pointer(data_slot).ok_or(ReadError::SlotFailed)?;
        if count > 0 && !data.is_plausible() {
            return Err(CycleError::structural(format!("entity array at {} is implausible", data)));
        }
        let local_entity = header.pointer(local_slot).filter(|a| a.is_plausible());

        let total = count as usize;
        let n = total.min(self.config.max_entities);
        let truncated = total - n;
        if truncated > 0 {
            debug!(total, kept = n, "entity array truncated");
        }

        // --- R2: element pointers ---
        let pointers = self.read_pointers(reader, data, n, local_entity, &mut report);

        // --- R3: metadata ---
        let mut round = reader.begin_round();
        let meta_slots: Vec<(SlotId, SlotId, SlotId)> = pointers
            .iter()
            .map(|&p| {
                (
                    round.add(p.offset(self.layout.type_id), ReadKind::U32),
                    round.add(p.offset(self.layout.faction), ReadKind::U32),
                    round.add(
                        p.offset(self.layout.display_name),
                        ReadKind::Text {
                            max_len: self.layout.display_name_max_len,
                        },
                    ),
                )
            })
            .collect();
        let meta = round.execute();
        report.absorb(&meta);

        let type_ids: Vec<Option<u32>> = meta_slots.iter().map(|s| meta.u32(s.0)).collect();

        // A recycled pointer with a new type is a new entity
        for (p, type_id) in pointers.iter().zip(&type_ids) {
            if let (Some(id), Some(known)) = (type_id, self.known.get(p)) {
                if known.type_id != *id {
                    self.known.remove(p);
                }
            }
        }

        // --- R4: type names for unseen ids ---
        self.resolve_type_names(reader, &type_ids, &mut report);

        // --- classify and filter ---
        let mut tracked: Vec<Address> = Vec::with_capacity(pointers.len());
        for (i, &p) in pointers.iter().enumerate() {
            let faction = meta.u32(meta_slots[i].1);
            let name = meta.text(meta_slots[i].2).map(str::to_string);

            let resolved = type_ids[i].and_then(|id| {
                self.names
                    .get(&id)
                    .map(|t| (id, t.class, t.name.clone()))
            });

            match resolved {
                // Not on the allow-list
                Some((_, None, _)) => {
                    self.known.remove(&p);
                }
                Some((id, Some(class), type_name)) => {
                    let known = self.known.entry(p).or_insert_with(|| KnownEntity {
                        type_id: id,
                        class,
                        type_name: String::new(),
                        faction: 0,
                        name: String::new(),
                        sub: SubObjects::default(),
                        retries: 0,
                        key: None,
                    });
                    known.type_id = id;
                    known.class = class;
                    known.type_name = type_name;
                    if let Some(f) = faction {
                        known.faction = f;
                    }
                    if let Some(n) = name {
                        known.name = n;
                    }
                    tracked.push(p);
                }
                // Type unreadable this cycle: keep what we knew
                None if self.known.contains_key(&p) => tracked.push(p),
                None => {}
            }
        }

        // --- R5/R6: sub-objects ---
        self.resolve_sub_objects(reader, &tracked, &mut report);

        // Entities that left the array lose their cached sub-objects
        let listed: HashSet<Address> = self.previous_slots.iter().copied().collect();
        self.known.retain(|p, _| listed.contains(p));

        let mut entries = Vec::with_capacity(tracked.len());
        for &entity in &tracked {
            let Some(k) = self.known.get_mut(&entity) else {
                continue;
            };
            // A key never changes while the pointer stays in the array, even
            // if a better sub-object resolves later
            let (key, key_source) = match k.key {
                Some(pinned) => pinned,
                None => {
                    let resolved = IdentityKey::resolve(entity, k.sub.animation, k.sub.hit_zone);
                    if resolved.1 != KeySource::HitZone {
                        debug!(entity = %entity, source = ?resolved.1, "published without hit-zone key");
                    }
                    k.key = Some(resolved);
                    resolved
                }
            };
            entries.push(RosterEntry {
                key,
                key_source,
                entity,
                class: k.class,
                type_id: k.type_id,
                type_name: k.type_name.clone(),
                faction: k.faction,
                name: k.name.clone(),
                sub: k.sub,
            });
        }

        report.items = entries.len();
        Ok(RosterBuild {
            entries,
            local_entity,
            truncated,
            report,
        })
    }

    fn read_pointers<R: ScatterReader>(
        &mut self,
        reader: &R,
        data: Address,
        n: usize,
        local_entity: Option<Address>,
        report: &mut CycleReport,
    ) -> Vec<Address> {
        let mut round = reader.begin_round();
        let slots: Vec<SlotId> = (0..n)
            .map(|i| round.add(data.offset(i as u64 * self.layout.list_stride), ReadKind::Pointer))
            .collect();
        let result = round.execute();
        report.absorb(&result);

        let mut slots_now = Vec::with_capacity(n);
        let mut pointers = Vec::with_capacity(n);
        let mut seen = HashSet::with_capacity(n);
        for (i, slot) in slots.iter().enumerate() {
            // A failed slot keeps last cycle's pointer at that index
            let p = result
                .pointer(*slot)
                .or_else(|| self.previous_slots.get(i).copied())
                .unwrap_or(Address::NULL);
            slots_now.push(p);
            if p.is_plausible() && Some(p) != local_entity && seen.insert(p) {
                pointers.push(p);
            }
        }
        self.previous_slots = slots_now;
        pointers
    }

    fn resolve_type_names<R: ScatterReader>(
        &mut self,
        reader: &R,
        type_ids: &[Option<u32>],
        report: &mut CycleReport,
    ) {
        let mut unseen: Vec<u32> = type_ids
            .iter()
            .flatten()
            .copied()
            .filter(|id| !self.names.contains_key(id))
            .collect();
        unseen.sort_unstable();
        unseen.dedup();
        if unseen.is_empty() {
            return;
        }

        let mut round = reader.begin_round();
        let slots: Vec<(u32, SlotId)> = unseen
            .iter()
            .map(|&id| {
                let addr = self
                    .layout
                    .name_table
                    .offset(u64::from(id) * self.layout.name_entry_stride);
                let slot = round.add(
                    addr,
                    ReadKind::Text {
                        max_len: self.layout.name_max_len,
                    },
                );
                (id, slot)
            })
            .collect();
        let result = round.execute();
        report.absorb(&result);

        for (id, slot) in slots {
            // Unreadable names are retried next cycle, not cached
            let Some(name) = result.text(slot) else {
                continue;
            };
            if self.names.len() >= self.config.name_cache_capacity {
                debug!(capacity = self.config.name_cache_capacity, "type name cache full, clearing");
                self.names.clear();
            }
            let class = classify(&self.config.class_rules, name);
            self.names.insert(
                id,
                TypeName {
                    name: name.to_string(),
                    class,
                },
            );
        }
    }

    fn resolve_sub_objects<R: ScatterReader>(
        &mut self,
        reader: &R,
        tracked: &[Address],
        report: &mut CycleReport,
    ) {
        let limit = self.config.sub_object_retry_limit;
        let pending: Vec<Address> = tracked
            .iter()
            .copied()
            .filter(|p| {
                self.known
                    .get(p)
                    .is_some_and(|k| !k.sub.is_complete() && k.retries < limit)
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        // R5: direct sub-objects, plus animation where the mesh is cached
        let layout = &self.layout;
        let mut round = reader.begin_round();
        let mut slots: Vec<(Address, [Option<SlotId>; 4])> = Vec::with_capacity(pending.len());
        for &p in &pending {
            let Some(sub) = self.known.get(&p).map(|k| k.sub) else {
                continue;
            };
            let mut want = |missing: bool, addr: Address| {
                missing.then(|| round.add(addr, ReadKind::Pointer))
            };
            let root = want(sub.root.is_null(), p.offset(layout.root_component));
            let mesh = want(sub.mesh.is_null(), p.offset(layout.mesh));
            let hit_zone = want(sub.hit_zone.is_null(), p.offset(layout.hit_zone));
            let animation = want(
                sub.animation.is_null() && !sub.mesh.is_null(),
                sub.mesh.offset(layout.anim_instance),
            );
            slots.push((p, [root, mesh, hit_zone, animation]));
        }
        let result = round.execute();
        report.absorb(&result);

        let read = |slot: Option<SlotId>| {
            slot.and_then(|s| result.pointer(s))
                .unwrap_or(Address::NULL)
        };
        for (p, [root, mesh, hit_zone, animation]) in &slots {
            if let Some(known) = self.known.get_mut(p) {
                known.sub.merge_missing(&SubObjects {
                    root: read(*root),
                    mesh: read(*mesh),
                    animation: read(*animation),
                    hit_zone: read(*hit_zone),
                });
            }
        }

        // R6: animation for meshes resolved just now
        let mut round = reader.begin_round();
        let anim_slots: Vec<(Address, SlotId)> = pending
            .iter()
            .filter_map(|p| {
                let k = self.known.get(p)?;
                (k.sub.animation.is_null() && !k.sub.mesh.is_null()).then(|| {
                    (
                        *p,
                        round.add(k.sub.mesh.offset(self.layout.anim_instance), ReadKind::Pointer),
                    )
                })
            })
            .collect();
        let result = round.execute();
        report.absorb(&result);

        for (p, slot) in anim_slots {
            if let Some(known) = self.known.get_mut(&p) {
                known.sub.merge_missing(&SubObjects {
                    animation: result.pointer(slot).unwrap_or(Address::NULL),
                    ..SubObjects::default()
                });
            }
        }

        for p in &pending {
            if let Some(known) = self.known.get_mut(p) {
                if !known.sub.is_complete() {
                    known.retries += 1;
                }
            }
        }
    }
}
