//! Quick Start Example
//!
//! Runs one simulated molding cycle and prints the finalized summary.
//! Run with `cargo run -p molder_core --example quick_start`.

use molder_core::machine::{Command, MachineBuilder, MachineStatus};
use molder_core::params::ProcessParams;
use molder_core::thermal::ThermalCfg;
use molder_sim::{MachineSim, SimCfg};
use molder_traits::clock::VirtualClock;

fn main() -> Result<(), eyre::Report> {
    let params = ProcessParams::default();

    // Simulated plant, preheated so the cycle can start immediately.
    let sim = MachineSim::preheated(SimCfg::default(), params.zone_setpoints_c);

    // Virtual clock: the whole cycle runs in milliseconds of wall time.
    let mut machine = MachineBuilder::new()
        .with_sensors(sim.sensors())
        .with_actuators(sim.actuators())
        .with_params(params)
        .with_thermal(ThermalCfg {
            ready_hold_ms: 100,
            ..ThermalCfg::default()
        })
        .with_clock(Box::new(VirtualClock::new()))
        .build()?;

    machine.command(Command::StartCycle);
    loop {
        match machine.step()? {
            MachineStatus::CycleComplete(summary) => {
                println!(
                    "cycle {} done in {:.0} ms: predicted {:.2} g, class {}, rejected {}",
                    summary.cycle_index,
                    summary.cycle_time_ms,
                    summary.predicted_weight_g,
                    summary.quality_class,
                    summary.rejected
                );
                for (phase, entered_us) in &summary.phases {
                    println!("  {phase:<12} @ {:.1} ms", *entered_us as f64 / 1000.0);
                }
                return Ok(());
            }
            MachineStatus::Faulted(cause) => {
                eyre::bail!("unexpected fault: {cause}");
            }
            MachineStatus::Idle | MachineStatus::Running(_) => {}
        }
    }
}
