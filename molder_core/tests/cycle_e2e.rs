//! End-to-end: a two-stage velocity profile runs a full cycle on the
//! simulated machine, through every phase and back to idle, producing
//! exactly one finalized record.

use molder_core::machine::MachineBuilder;
use molder_core::params::{ProcessParams, VelocityStage};
use molder_core::runner::{self, RunPlan};
use molder_core::thermal::ThermalCfg;
use molder_sim::{MachineSim, SimCfg};
use molder_traits::clock::VirtualClock;

fn two_stage_params() -> ProcessParams {
    ProcessParams {
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
        transfer_position_mm: 30.0,
        ..ProcessParams::default()
    }
}

#[test]
fn full_cycle_through_all_phases() {
    let params = two_stage_params();
    let sim = MachineSim::preheated(SimCfg::default(), params.zone_setpoints_c);

    let machine = MachineBuilder::new()
        .with_sensors(sim.sensors())
        .with_actuators(sim.actuators())
        .with_params(params)
        .with_thermal(ThermalCfg {
            ready_hold_ms: 50,
            ..ThermalCfg::default()
        })
        .with_clock(Box::new(VirtualClock::new()))
        .build()
        .expect("machine build");

    let plan = RunPlan {
        cycles: Some(1),
        hold_in_fault: false,
    };
    let (report, machine) = runner::run_direct(machine, plan, None).expect("run");

    assert_eq!(report.completed, 1);
    assert_eq!(report.faults, 0);
    assert_eq!(machine.history().len(), 1, "exactly one finalized record");

    let record = machine.history().latest().expect("record");
    assert!(record.completed_us.is_some());
    assert!(record.peak_position_mm >= 29.0, "reached transfer position");

    // Every phase between idle and idle, in order.
    let names: Vec<&str> = record.phase_log.iter().map(|&(p, _)| p.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "clamp_close",
            "injection",
            "pack_hold",
            "cooling",
            "ejection",
            "clamp_open",
            "plasticizing",
        ]
    );

    // SPC saw each tracked metric exactly once.
    for metric in molder_core::spc::METRICS {
        let w = machine.spc().window(metric).unwrap_or_else(|| {
            panic!("metric {metric} missing");
        });
        assert_eq!(w.len(), 1);
    }
}

#[test]
fn pressure_never_exceeded_recipe_ceiling() {
    let params = two_stage_params();
    let ceiling = params.pressure_ceiling_bar;
    let sim = MachineSim::preheated(SimCfg::default(), params.zone_setpoints_c);

    let machine = MachineBuilder::new()
        .with_sensors(sim.sensors())
        .with_actuators(sim.actuators())
        .with_params(params)
        .with_thermal(ThermalCfg {
            ready_hold_ms: 50,
            ..ThermalCfg::default()
        })
        .with_clock(Box::new(VirtualClock::new()))
        .build()
        .expect("machine build");

    let (report, machine) = runner::run_direct(
        machine,
        RunPlan {
            cycles: Some(2),
            hold_in_fault: false,
        },
        None,
    )
    .expect("run");

    assert_eq!(report.completed, 2);
    for record in machine.history().iter() {
        assert!(
            record.peak_cavity_bar <= ceiling * 1.05,
            "peak {} stayed near/below ceiling {}",
            record.peak_cavity_bar,
            ceiling
        );
    }
}
