//! Multi-stage velocity control: stage advance by trigger position,
//! transfer fallback, and pressure protection overriding velocity error.

use molder_core::params::{ProcessParams, VelocityStage};
use molder_core::phase::{MotionGains, Phase, ProcessController};
use molder_core::safety::SafetyState;
use molder_traits::SensorFrame;
use rstest::rstest;

fn frame(position_mm: f32, velocity: f32, cavity_bar: f32) -> SensorFrame {
    SensorFrame {
        cavity_bar: [cavity_bar; 4],
        barrel_c: [205.0, 215.0, 225.0],
        nozzle_c: 230.0,
        mold_c: 45.0,
        position_mm,
        velocity_mm_s: velocity,
        valid: true,
        ..SensorFrame::empty()
    }
}

fn into_injection(params: ProcessParams) -> (ProcessController, u64) {
    let mut c = ProcessController::new(params, MotionGains::default(), 1000, 5).unwrap();
    c.request_start();
    let mut t = 0;
    c.tick(t, Some(&frame(0.0, 0.0, 0.0)), SafetyState::default(), true);
    while c.phase() == Phase::ClampClose {
        t += 1000;
        c.tick(t, Some(&frame(0.0, 0.0, 0.0)), SafetyState::default(), true);
    }
    assert_eq!(c.phase(), Phase::Injection);
    (c, t)
}

#[rstest]
fn duty_tracks_velocity_error_and_stays_in_range() {
    let (mut c, mut t) = into_injection(ProcessParams::default());
    // Far below the 30 mm/s stage target: strong positive command.
    t += 1000;
    let out = c.tick(t, Some(&frame(2.0, 0.0, 50.0)), SafetyState::default(), true);
    assert!(out.duty.injection_pct > 0.0);
    assert!(out.duty.injection_pct <= 100.0);

    // Well above target: the loop backs off to zero, never negative.
    t += 1000;
    let out = c.tick(t, Some(&frame(3.0, 90.0, 50.0)), SafetyState::default(), true);
    assert_eq!(out.duty.injection_pct, 0.0);
}

#[rstest]
fn over_ceiling_pressure_forces_zero_duty_despite_velocity_error() {
    let (mut c, mut t) = into_injection(ProcessParams::default());
    // Huge velocity error, but one cavity channel above the 600 bar
    // recipe ceiling: protection wins.
    t += 1000;
    let mut f = frame(5.0, 0.0, 50.0);
    f.cavity_bar[2] = 610.0;
    let out = c.tick(t, Some(&f), SafetyState::default(), true);
    assert_eq!(c.phase(), Phase::Injection);
    assert_eq!(out.duty.injection_pct, 0.0);

    // Pressure back under the ceiling: tracking resumes.
    t += 1000;
    let out = c.tick(t, Some(&frame(6.0, 0.0, 300.0)), SafetyState::default(), true);
    assert!(out.duty.injection_pct > 0.0);
}

#[rstest]
fn stage_exhaustion_is_the_transfer_fallback() {
    // Transfer configured mid-stage: crossing it transfers even though
    // the final stage has room left.
    let params = ProcessParams {
        velocity_stages: vec![
            VelocityStage {
                velocity_mm_s: 30.0,
                until_position_mm: 10.0,
            },
            VelocityStage {
                velocity_mm_s: 60.0,
                until_position_mm: 30.0,
            },
        ],
        transfer_position_mm: 25.0,
        ..ProcessParams::default()
    };
    let (mut c, mut t) = into_injection(params);

    t += 1000;
    c.tick(t, Some(&frame(12.0, 30.0, 100.0)), SafetyState::default(), true);
    assert_eq!(c.phase(), Phase::Injection, "second stage active");

    t += 1000;
    c.tick(t, Some(&frame(25.5, 60.0, 150.0)), SafetyState::default(), true);
    assert_eq!(c.phase(), Phase::PackHold, "transfer position wins mid-stage");
}
