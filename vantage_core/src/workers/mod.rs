//! The five pipeline workers.
//!
//! | Worker   | Reads                          | Owns                  |
//! |----------|--------------------------------|-----------------------|
//! | camera   | camera block, local viewpoint  | camera snapshot, bias |
//! | roster   | entity array                   | roster snapshot       |
//! | vitals   | roster                         | vitals snapshot       |
//! | pose     | roster, camera, bias           | skeleton cache writes |
//! | position | roster, camera, vitals, bias   | frame publisher       |
//!
//! Workers only exchange immutable snapshots and must tolerate inputs that
//! are one or more cycles old.

mod camera;
mod pose;
mod position;
mod roster;
mod vitals;

pub use camera::CameraWorker;
pub use pose::PoseWorker;
pub use position::PositionWorker;
pub use roster::RosterWorker;
pub use vitals::VitalsWorker;
