//! Frame publication under a concurrently spinning reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vantage_core::camera::CameraPose;
use vantage_core::frame::frame_channel;
use vantage_core::{Bias, EntityClass, Frame, IdentityKey, PositionSample, Vec3, WorldTransform};

/// Sample count is a function of the stamp, so a torn frame would show up
/// as a length mismatch.
fn expected_len(stamp: u64) -> usize {
    (stamp % 7 + 1) as usize
}

fn sample(key: u64, stamp: u64) -> PositionSample {
    let position = Vec3::new(stamp as f32, key as f32, 0.0);
    PositionSample {
        key: IdentityKey(key),
        class: EntityClass::Npc,
        faction: 0,
        name: format!("npc-{}", key),
        position,
        pose: WorldTransform::from_translation(position),
        submit_time: 0.0,
        on_screen_time: 0.0,
        health: 100.0,
        health_max: 100.0,
        dead: false,
        downed: false,
        screen: None,
        distance: position.norm(),
    }
}

fn frame(stamp: u64) -> Frame {
    Frame {
        stamp,
        captured_at: Duration::from_millis(stamp),
        camera: CameraPose::default(),
        local_view: None,
        bias: Bias::zero(),
        samples: (0..expected_len(stamp) as u64)
            .map(|k| sample(k, stamp))
            .collect(),
    }
}

#[test]
fn test_reader_never_sees_torn_frame() {
    let (mut publisher, reader) = frame_channel();
    let done = Arc::new(AtomicBool::new(false));

    let spin = {
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = 0;
            let mut reads = 0u64;
            while !done.load(Ordering::Acquire) {
                let Some(frame) = reader.try_get_frame() else {
                    continue;
                };
                assert_eq!(frame.len(), expected_len(frame.stamp));
                assert!(frame
                    .samples
                    .iter()
                    .all(|s| s.position.x == frame.stamp as f32));
                assert!(frame.stamp >= last, "stamp went backwards");
                last = frame.stamp;
                reads += 1;
            }
            (last, reads)
        })
    };

    for stamp in 1..=50 {
        publisher.publish(frame(stamp));
        thread::sleep(Duration::from_micros(200));
    }
    thread::sleep(Duration::from_millis(5));
    done.store(true, Ordering::Release);

    let (last, reads) = spin.join().unwrap();
    assert_eq!(publisher.published(), 50);
    assert_eq!(last, 50);
    assert!(reads > 0);
}

#[test]
fn test_many_readers_agree_on_latest() {
    let (mut publisher, reader) = frame_channel();
    publisher.publish(frame(1));
    publisher.publish(frame(2));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let reader = reader.clone();
            thread::spawn(move || reader.try_get_frame().map(|f| f.stamp))
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), Some(2));
    }
}
