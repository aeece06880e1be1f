//! JSON exporter for published frames.
//!
//! Writes what the pipeline published next to ground truth, frame by frame,
//! so a run can be inspected or plotted offline.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use vantage_core::{EntityClass, Frame, IdentityKey, StatsSnapshot};

/// Export failures.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write export: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode export: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single exported frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Stamp of the published frame
    pub stamp: u64,

    /// Bias the frame was published under
    pub bias: [f32; 3],
    pub bias_generation: u64,

    /// Ground truth entity positions
    pub ground_truth: Vec<EntityPosition>,

    /// Published samples
    pub samples: Vec<SamplePosition>,

    /// Events (rebases, spawns, fault changes)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Captures a published frame against ground truth.
    pub fn capture(
        time_sec: f64,
        frame: &Frame,
        truth: &[(IdentityKey, Vector3<f32>)],
        has_skeleton: impl Fn(IdentityKey) -> bool,
    ) -> Self {
        Self {
            time_sec,
            stamp: frame.stamp,
            bias: [frame.bias.offset.x, frame.bias.offset.y, frame.bias.offset.z],
            bias_generation: frame.bias.generation,
            ground_truth: truth
                .iter()
                .map(|(key, pos)| EntityPosition::new(*key, pos))
                .collect(),
            samples: frame
                .samples
                .iter()
                .map(|s| SamplePosition {
                    key: s.key.0,
                    class: s.class,
                    name: s.name.clone(),
                    x: s.position.x,
                    y: s.position.y,
                    z: s.position.z,
                    health: s.health,
                    dead: s.dead,
                    on_screen: s.screen.is_some(),
                    has_skeleton: has_skeleton(s.key),
                })
                .collect(),
            events: Vec::new(),
        }
    }
}

/// Position of a ground truth entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPosition {
    pub key: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl EntityPosition {
    pub fn new(key: IdentityKey, pos: &Vector3<f32>) -> Self {
        Self {
            key: key.0,
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

/// One published sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePosition {
    pub key: u64,
    pub class: EntityClass,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub health: f32,
    pub dead: bool,
    pub on_screen: bool,
    pub has_skeleton: bool,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Events not yet attached to a frame
    #[serde(skip)]
    pending_events: Vec<SimEvent>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Pipeline counters at the end of the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsSnapshot>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            pending_events: Vec::new(),
            passed: false,
            failure_reason: None,
            stats: None,
        }
    }

    /// Queues an event for the next frame.
    pub fn add_event(&mut self, event: SimEvent) {
        self.pending_events.push(event);
    }

    /// Adds a frame, attaching queued events.
    pub fn add_frame(&mut self, mut frame: SimFrame) {
        frame.events.append(&mut self.pending_events);
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, stats: StatsSnapshot) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.stats = Some(stats);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_attach_to_next_frame() {
        let mut export = SimExport::new("steady", 42);
        export.add_event(SimEvent::info("origin rebased"));

        let frame = SimFrame {
            time_sec: 0.5,
            stamp: 3,
            bias: [0.0; 3],
            bias_generation: 0,
            ground_truth: vec![EntityPosition::new(IdentityKey(7), &Vector3::new(1.0, 2.0, 3.0))],
            samples: Vec::new(),
            events: Vec::new(),
        };
        export.add_frame(frame.clone());
        export.add_frame(frame);

        assert_eq!(export.frames[0].events.len(), 1);
        assert!(export.frames[1].events.is_empty());
        assert_eq!(export.duration_sec, 0.5);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"][0]["ground_truth"][0]["key"], 7);
        assert!(json.get("pending_events").is_none());
    }
}
