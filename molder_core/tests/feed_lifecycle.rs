//! FrameFeed thread lifecycle: frames flow, stall tracking works, and
//! dropping the feed joins its thread without hanging.

use molder_core::feed::FrameFeed;
use molder_core::mocks::ScriptedSensors;
use molder_traits::SensorFrame;
use molder_traits::clock::MonotonicClock;
use std::time::Duration;

fn valid_frame(position_mm: f32) -> SensorFrame {
    SensorFrame {
        position_mm,
        valid: true,
        ..SensorFrame::empty()
    }
}

#[test]
fn latest_returns_freshest_frame() {
    let sensors = ScriptedSensors::new(vec![
        valid_frame(1.0),
        valid_frame(2.0),
        valid_frame(3.0),
    ]);
    let feed = FrameFeed::spawn(sensors, 2000, Duration::from_millis(5), MonotonicClock::new());

    let mut seen = None;
    for _ in 0..100 {
        if let Some(f) = feed.latest() {
            seen = Some(f);
            if f.position_mm >= 3.0 {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    let f = seen.expect("feed produced frames");
    assert!(f.valid);
    assert!(f.position_mm >= 1.0);
}

#[test]
fn drop_joins_the_thread() {
    let sensors = ScriptedSensors::new(vec![valid_frame(1.0)]);
    let feed = FrameFeed::spawn(sensors, 1000, Duration::from_millis(5), MonotonicClock::new());
    std::thread::sleep(Duration::from_millis(10));
    // Join-on-drop must complete promptly even while the thread is
    // mid-loop; a hang here fails the test by timeout.
    drop(feed);
}

#[test]
fn stall_grows_without_valid_frames() {
    // Script is empty: every read errors, last_ok never advances.
    let sensors = ScriptedSensors::new(vec![]);
    let feed = FrameFeed::spawn(sensors, 1000, Duration::from_millis(1), MonotonicClock::new());
    std::thread::sleep(Duration::from_millis(20));
    assert!(feed.stalled_for_now() >= 10_000, "at least 10 ms of stall");
}
