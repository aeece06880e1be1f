//! In-memory source for unit tests.

use crate::config::{PipelineConfig, SourceLayout};
use crate::identity::IdentityKey;
use crate::math::Vec3;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vantage_env::{
    Address, RawTransform, ReadError, ReadKind, ReadRequest, ReadValue, ScatterReader, SlotResult,
    VantageContext,
};

const LIST_DATA: u64 = 0x2000_0000;
const LOCAL_ROOT: u64 = 0x4FFF_0000;

fn arr(v: Vec3) -> [f32; 3] {
    [v.x, v.y, v.z]
}

/// Flat address -> value map.
#[derive(Default)]
pub(crate) struct FakeMemory {
    cells: Mutex<HashMap<u64, ReadValue>>,
    failing: Mutex<HashSet<u64>>,
    rounds: AtomicUsize,
}

impl FakeMemory {
    pub(crate) fn put(&self, addr: Address, value: ReadValue) {
        self.cells.lock().insert(addr.raw(), value);
    }

    pub(crate) fn put_pointer(&self, addr: Address, target: Address) {
        self.put(addr, ReadValue::Pointer(target));
    }

    pub(crate) fn fail(&self, addr: Address) {
        self.failing.lock().insert(addr.raw());
    }

    pub(crate) fn heal(&self, addr: Address) {
        self.failing.lock().remove(&addr.raw());
    }

    pub(crate) fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }
}

impl ScatterReader for FakeMemory {
    fn execute(&self, requests: &[ReadRequest]) -> Result<Vec<SlotResult>, ReadError> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        let cells = self.cells.lock();
        let failing = self.failing.lock();
        Ok(requests
            .iter()
            .map(|r| {
                if failing.contains(&r.address.raw()) {
                    return Err(ReadError::SlotFailed);
                }
                match (cells.get(&r.address.raw()), r.kind) {
                    (Some(ReadValue::Text(s)), ReadKind::Text { max_len }) => {
                        Ok(ReadValue::Text(s.chars().take(max_len as usize).collect()))
                    }
                    (Some(v), _) => Ok(v.clone()),
                    (None, _) => Err(ReadError::InvalidAddress(r.address.raw())),
                }
            })
            .collect())
    }
}

/// A clock that only moves on `sleep`.
#[derive(Default)]
pub(crate) struct FakeClock {
    nanos: AtomicU64,
}

impl VantageContext for FakeClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    fn seed(&self) -> u64 {
        0
    }
}

/// A synthetic entity with every sub-object resolvable.
#[derive(Debug, Clone)]
pub(crate) struct FakeEntity {
    pub index: u64,
    pub entity: Address,
    pub root: Address,
    pub mesh: Address,
    pub animation: Address,
    pub hit_zone: Address,
    pub bones: Address,
    pub type_id: u32,
    pub type_name: &'static str,
    pub name: String,
    pub position: Vec3,
}

impl FakeEntity {
    pub(crate) fn with_type(index: u64, type_id: u32, type_name: &'static str) -> Self {
        let at = |base: u64| Address::new(base + index * 0x1000);
        Self {
            index,
            entity: at(0x3000_0000),
            root: at(0x4000_0000),
            mesh: at(0x5000_0000),
            animation: at(0x6000_0000),
            hit_zone: at(0x7000_0000),
            bones: at(0x8000_0000),
            type_id,
            type_name,
            name: format!("npc-{}", index),
            position: Vec3::new(1000.0 + 100.0 * index as f32, 0.0, 0.0),
        }
    }

    pub(crate) fn npc(index: u64) -> Self {
        Self::with_type(index, 10, "NpcSoldier_C")
    }

    pub(crate) fn player(index: u64) -> Self {
        Self::with_type(index, 11, "PlayerPawn_C")
    }

    pub(crate) fn key(&self) -> IdentityKey {
        IdentityKey(self.hit_zone.raw())
    }
}

/// A [`FakeMemory`] laid out per [`SourceLayout`].
pub(crate) struct FakeWorld {
    pub layout: SourceLayout,
    memory: Arc<FakeMemory>,
}

impl FakeWorld {
    pub(crate) fn new() -> Self {
        let world = Self {
            layout: PipelineConfig::default().layout,
            memory: Arc::new(FakeMemory::default()),
        };
        let l = &world.layout;
        world
            .memory
            .put_pointer(l.entity_list.offset(l.list_data), Address::new(LIST_DATA));
        world.set_count(0);
        world.set_camera(Vec3::zeros(), Vec3::zeros(), 90.0);
        world.set_local_view(Vec3::new(-50.0, 0.0, 0.0));
        world
    }

    pub(crate) fn memory(&self) -> &FakeMemory {
        &self.memory
    }

    pub(crate) fn shared(&self) -> Arc<FakeMemory> {
        Arc::clone(&self.memory)
    }

    pub(crate) fn set_count(&self, count: i32) {
        let l = &self.layout;
        self.memory
            .put(l.entity_list.offset(l.list_count), ReadValue::I32(count));
    }

    pub(crate) fn list_slot(&self, index: usize) -> Address {
        Address::new(LIST_DATA).offset(index as u64 * self.layout.list_stride)
    }

    pub(crate) fn set_list(&self, entities: &[&FakeEntity]) {
        for (i, e) in entities.iter().enumerate() {
            self.memory.put_pointer(self.list_slot(i), e.entity);
        }
        self.set_count(entities.len() as i32);
    }

    pub(crate) fn spawn_all(&self, entities: &[&FakeEntity]) {
        for e in entities {
            self.write_entity(e);
        }
        self.set_list(entities);
    }

    pub(crate) fn set_local(&self, entity: &FakeEntity) {
        self.memory.put_pointer(self.layout.local_entity, entity.entity);
    }

    pub(crate) fn set_camera(&self, location: Vec3, rotation: Vec3, fov: f32) {
        let l = &self.layout;
        self.memory.put(
            l.camera.offset(l.camera_location),
            ReadValue::Vec3(arr(location)),
        );
        self.memory.put(
            l.camera.offset(l.camera_rotation),
            ReadValue::Vec3(arr(rotation)),
        );
        self.memory.put(l.camera.offset(l.camera_fov), ReadValue::F32(fov));
    }

    /// Points the local root at `root` (identity change of the viewpoint).
    pub(crate) fn set_local_root(&self, root: Address) {
        self.memory.put_pointer(self.layout.local_root, root);
    }

    pub(crate) fn set_local_view(&self, raw: Vec3) {
        self.set_local_root(Address::new(LOCAL_ROOT));
        self.memory
            .put(self.local_view_address(), ReadValue::Vec3(arr(raw)));
    }

    /// Where the local viewpoint's raw location lives.
    pub(crate) fn local_view_address(&self) -> Address {
        Address::new(LOCAL_ROOT).offset(self.layout.root_location)
    }

    pub(crate) fn move_entity(&self, e: &FakeEntity, raw: Vec3) {
        let l = &self.layout;
        self.memory
            .put(e.root.offset(l.root_location), ReadValue::Vec3(arr(raw)));
        self.memory.put(
            e.mesh.offset(l.component_to_world),
            ReadValue::Transform(RawTransform::from_translation(arr(raw))),
        );
    }

    pub(crate) fn set_submit_counter(&self, e: &FakeEntity, counter: u32) {
        self.memory.put(
            e.mesh.offset(self.layout.submit_counter),
            ReadValue::U32(counter),
        );
    }

    pub(crate) fn set_health(&self, e: &FakeEntity, health: f32, dead: bool) {
        let l = &self.layout;
        self.memory.put(e.entity.offset(l.health), ReadValue::F32(health));
        self.memory
            .put(e.entity.offset(l.dead_flag), ReadValue::U8(u8::from(dead)));
    }

    fn write_entity(&self, e: &FakeEntity) {
        let l = &self.layout;
        let m = &self.memory;

        m.put(e.entity.offset(l.type_id), ReadValue::U32(e.type_id));
        m.put(e.entity.offset(l.faction), ReadValue::U32(1));
        m.put(e.entity.offset(l.display_name), ReadValue::Text(e.name.clone()));
        m.put(
            l.name_table.offset(u64::from(e.type_id) * l.name_entry_stride),
            ReadValue::Text(e.type_name.to_string()),
        );

        m.put_pointer(e.entity.offset(l.root_component), e.root);
        m.put_pointer(e.entity.offset(l.mesh), e.mesh);
        m.put_pointer(e.entity.offset(l.hit_zone), e.hit_zone);
        m.put_pointer(e.mesh.offset(l.anim_instance), e.animation);

        m.put(e.entity.offset(l.health_max), ReadValue::F32(100.0));
        m.put(e.entity.offset(l.downed_flag), ReadValue::U8(0));
        self.set_health(e, 100.0, false);

        m.put_pointer(e.mesh.offset(l.bone_array), e.bones);
        m.put(e.mesh.offset(l.bone_count), ReadValue::I32(24));
        for j in 0..24u64 {
            m.put(
                e.bones.offset(j * l.bone_stride + l.bone_translation),
                ReadValue::Vec3([0.0, 0.0, j as f32 * 5.0]),
            );
        }
        m.put(e.mesh.offset(l.last_submit_time), ReadValue::F32(1.0));
        m.put(e.mesh.offset(l.last_on_screen_time), ReadValue::F32(1.0));
        self.set_submit_counter(e, 1);
        self.move_entity(e, e.position);
    }
}
