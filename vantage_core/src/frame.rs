//! The published frame and its seqlock endpoints.

use crate::bias::Bias;
use crate::camera::{CameraPose, ScreenPoint};
use crate::identity::{EntityClass, IdentityKey};
use crate::math::{Vec3, WorldTransform};
use crate::seqlock::{seqlock, SeqReader, SeqWriter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One entity's state in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub key: IdentityKey,
    pub class: EntityClass,
    pub faction: u32,
    pub name: String,

    /// World position, frame bias included
    pub position: Vec3,

    /// Root component-to-world transform, frame bias included
    pub pose: WorldTransform,

    /// Source-side time of the last submitted animation frame
    pub submit_time: f32,

    /// Source-side time the entity was last rendered
    pub on_screen_time: f32,

    pub health: f32,
    pub health_max: f32,
    pub dead: bool,
    pub downed: bool,

    /// Projection at assembly time; `None` when behind the camera
    pub screen: Option<ScreenPoint>,

    /// Distance from the camera
    pub distance: f32,
}

impl PositionSample {
    /// Moves a sample whose raw read was corrected with `from` over to
    /// `to`. Only valid for raw data read in `to`'s source origin.
    pub fn rebase(&mut self, from: &Bias, to: &Bias) {
        let delta = from.delta_to(to);
        self.position += delta;
        self.pose = self.pose.translated(&delta);
    }
}

/// An immutable, internally-consistent snapshot.
///
/// Every position in a frame carries the same bias, recorded in `bias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Monotonic publish stamp, starting at 1
    pub stamp: u64,
    pub captured_at: Duration,
    pub camera: CameraPose,
    pub local_view: Option<Vec3>,
    pub bias: Bias,
    pub samples: Vec<PositionSample>,
}

impl Frame {
    /// Looks up a sample by key.
    pub fn sample(&self, key: IdentityKey) -> Option<&PositionSample> {
        self.samples.iter().find(|s| s.key == key)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Writer end of the frame seqlock. Owned by the position worker.
pub struct FramePublisher {
    writer: SeqWriter<Arc<Frame>>,
    published: u64,
}

/// Reader end of the frame seqlock.
#[derive(Clone)]
pub struct FrameReader {
    reader: SeqReader<Arc<Frame>>,
}

/// Creates a connected publisher/reader pair.
pub fn frame_channel() -> (FramePublisher, FrameReader) {
    let (writer, reader) = seqlock();
    (
        FramePublisher {
            writer,
            published: 0,
        },
        FrameReader { reader },
    )
}

impl FramePublisher {
    /// Publishes a fully assembled frame.
    pub fn publish(&mut self, frame: Frame) {
        self.publish_arc(Arc::new(frame));
    }

    /// Publishes an already shared frame (republishing is idempotent).
    pub fn publish_arc(&mut self, frame: Arc<Frame>) {
        self.writer.publish(frame);
        self.published += 1;
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            reader: self.writer.reader(),
        }
    }
}

impl FrameReader {
    /// Returns the latest frame, or `None` during startup or write
    /// contention. Callers skip the tick on `None`.
    pub fn try_get_frame(&self) -> Option<Arc<Frame>> {
        self.reader.try_read()
    }
}
