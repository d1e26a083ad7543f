//! Safety preemption through the full machine: fault within one tick,
//! outputs silenced the same tick, reset refused while conditions hold.

use molder_core::error::FaultCause;
use molder_core::machine::{Command, MachineBuilder, MachineStatus};
use molder_core::mocks::{NoopSensors, SpyActuators};
use molder_core::params::ProcessParams;
use molder_core::safety::SafetyLimits;
use molder_traits::SensorFrame;
use molder_traits::clock::VirtualClock;
use rstest::rstest;

fn clean_frame() -> SensorFrame {
    SensorFrame {
        barrel_c: [205.0, 215.0, 225.0],
        nozzle_c: 230.0,
        mold_c: 45.0,
        ambient_c: 23.0,
        valid: true,
        ..SensorFrame::empty()
    }
}

fn machine_with_spy() -> (
    molder_core::machine::Machine<NoopSensors, SpyActuators>,
    SpyActuators,
) {
    let spy = SpyActuators::new();
    let machine = MachineBuilder::new()
        .with_sensors(NoopSensors)
        .with_actuators(spy.clone())
        .with_params(ProcessParams::default())
        .with_safety_limits(SafetyLimits {
            estop_debounce_n: 1,
            ..SafetyLimits::default()
        })
        .with_clock(Box::new(VirtualClock::new()))
        .build()
        .expect("machine build");
    (machine, spy)
}

#[rstest]
fn estop_faults_within_one_tick_with_outputs_silenced() {
    let (mut machine, spy) = machine_with_spy();

    // A clean tick first.
    let status = machine.step_from_frame(Some(clean_frame())).unwrap();
    assert!(matches!(status, MachineStatus::Idle));
    assert_eq!(spy.stop_count(), 0);

    let mut frame = clean_frame();
    frame.estop = true;
    let status = machine.step_from_frame(Some(frame)).unwrap();
    assert!(matches!(
        status,
        MachineStatus::Faulted(FaultCause::Estop)
    ));
    assert_eq!(spy.stop_count(), 1, "all_stop issued in the same tick");
    let last = spy.last().expect("command applied");
    assert!(last.is_stopped());
}

#[rstest]
#[case::over_pressure(
    {
        let mut f = clean_frame();
        f.cavity_bar = [850.0, 400.0, 400.0, 400.0];
        f
    },
    FaultCause::OverPressure
)]
#[case::over_force(
    {
        let mut f = clean_frame();
        f.clamp_kn = 1300.0;
        f
    },
    FaultCause::OverForce
)]
#[case::over_temp(
    {
        let mut f = clean_frame();
        f.nozzle_c = 295.0;
        f
    },
    FaultCause::OverTemperature
)]
#[case::gate(
    {
        let mut f = clean_frame();
        f.gate_open = true;
        f
    },
    FaultCause::GateOpen
)]
fn each_interlock_faults(#[case] frame: SensorFrame, #[case] expected: FaultCause) {
    let (mut machine, _spy) = machine_with_spy();
    let status = machine.step_from_frame(Some(frame)).unwrap();
    match status {
        MachineStatus::Faulted(cause) => assert_eq!(cause, expected),
        other => panic!("expected fault, got {other:?}"),
    }
}

#[rstest]
fn reset_is_noop_while_condition_holds() {
    let (mut machine, _spy) = machine_with_spy();

    let mut frame = clean_frame();
    frame.gate_open = true;
    machine.step_from_frame(Some(frame)).unwrap();
    assert_eq!(machine.phase(), molder_core::Phase::Fault);

    // Gate still open: reset refused.
    machine.command(Command::ResetFault);
    machine.step_from_frame(Some(frame)).unwrap();
    assert_eq!(machine.phase(), molder_core::Phase::Fault);

    // Gate closed: flag clears only via the explicit reset.
    let clean = clean_frame();
    machine.step_from_frame(Some(clean)).unwrap();
    assert_eq!(machine.phase(), molder_core::Phase::Fault, "no auto-recovery");
    machine.command(Command::ResetFault);
    machine.step_from_frame(Some(clean)).unwrap();
    assert_eq!(machine.phase(), molder_core::Phase::Idle);
}

#[rstest]
fn remote_emergency_stop_behaves_like_hardware_input() {
    let (mut machine, spy) = machine_with_spy();
    machine.step_from_frame(Some(clean_frame())).unwrap();

    machine.command(Command::EmergencyStop);
    let status = machine.step_from_frame(Some(clean_frame())).unwrap();
    assert!(matches!(status, MachineStatus::Faulted(FaultCause::Estop)));
    assert_eq!(spy.stop_count(), 1);

    machine.command(Command::ResetFault);
    machine.step_from_frame(Some(clean_frame())).unwrap();
    assert_eq!(machine.phase(), molder_core::Phase::Idle);
}
