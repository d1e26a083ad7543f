//! Production orchestration: drive a machine until the requested cycle
//! count completes, a fault goes unhandled, or a stop command arrives.
//!
//! Two acquisition modes mirror the machine's two step entrypoints:
//! direct (read inside the loop) and sampled (a `FrameFeed` thread owns
//! the sensors and the loop consumes the latest frame). In sampled mode
//! a feed stall beyond the watchdog threshold aborts the run; inside a
//! critical phase the controller's own stale-frame bound fires first.

use crate::error::{ControlError, Result};
use crate::feed::FrameFeed;
use crate::machine::{Command, Machine, MachineStatus};
use crossbeam_channel as xch;
use molder_traits::{Actuators, SensorSuite};

/// What a run should do and when it should stop.
#[derive(Debug, Clone, Copy)]
pub struct RunPlan {
    /// Stop after this many completed cycles; None runs until commanded.
    pub cycles: Option<u64>,
    /// Keep looping in Fault awaiting a reset command instead of
    /// returning an error. Only useful with a command channel.
    pub hold_in_fault: bool,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            cycles: Some(1),
            hold_in_fault: false,
        }
    }
}

/// Run outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: u64,
    pub rejected: u64,
    pub faults: u64,
}

/// Feed stall threshold: four sensor timeouts, but never less than two
/// acquisition periods so a single missed sample cannot trip it.
#[inline]
fn stall_threshold_us(sensor_timeout_us: u64, period_us: u64) -> u64 {
    fast_threshold_us(sensor_timeout_us).max(two_periods_us(period_us))
}

/// Derive a quick stall threshold from the per-read sensor timeout.
#[inline]
fn fast_threshold_us(sensor_timeout_us: u64) -> u64 {
    sensor_timeout_us.saturating_mul(4)
}

/// Ensure the stall threshold spans at least two periods.
#[inline]
fn two_periods_us(period_us: u64) -> u64 {
    period_us.saturating_mul(2)
}

/// Drive a direct-mode machine to plan completion.
pub fn run_direct<S, A>(
    mut machine: Machine<S, A>,
    plan: RunPlan,
    commands: Option<xch::Receiver<Command>>,
) -> Result<(RunReport, Machine<S, A>)>
where
    S: SensorSuite,
    A: Actuators,
{
    let mut report = RunReport::default();
    tracing::info!(?plan.cycles, mode = "direct", "production start");
    loop {
        drain_commands(&mut machine, commands.as_ref());
        if machine.production_inhibited() {
            tracing::warn!("production inhibited, ending run");
            return Ok((report, machine));
        }
        maybe_request_start(&mut machine, &plan, &report);

        match machine.step()? {
            MachineStatus::CycleComplete(summary) => {
                report.completed += 1;
                if summary.rejected {
                    report.rejected += 1;
                }
                if plan_done(&plan, &report) {
                    tracing::info!(completed = report.completed, "production complete");
                    return Ok((report, machine));
                }
            }
            MachineStatus::Faulted(cause) => {
                report.faults += 1;
                if !plan.hold_in_fault {
                    return Err(crate::error::Report::new(ControlError::State(format!(
                        "fault: {cause}"
                    ))));
                }
            }
            MachineStatus::Idle | MachineStatus::Running(_) => {}
        }
    }
}

/// Drive a sampled-mode machine: frames come from the feed, the machine
/// itself was built with `NoopSensors`.
pub fn run_sampled<S, A>(
    mut machine: Machine<S, A>,
    feed: FrameFeed,
    sensor_timeout_us: u64,
    acquisition_period_us: u64,
    plan: RunPlan,
    commands: Option<xch::Receiver<Command>>,
) -> Result<(RunReport, Machine<S, A>)>
where
    S: SensorSuite,
    A: Actuators,
{
    let threshold_us = stall_threshold_us(sensor_timeout_us, acquisition_period_us);
    let mut report = RunReport::default();
    tracing::info!(?plan.cycles, mode = "sampled", "production start");
    loop {
        drain_commands(&mut machine, commands.as_ref());
        if machine.production_inhibited() {
            tracing::warn!("production inhibited, ending run");
            return Ok((report, machine));
        }
        maybe_request_start(&mut machine, &plan, &report);

        if feed.stalled_for_now() > threshold_us {
            return Err(crate::error::Report::new(ControlError::Timeout));
        }

        match machine.step_from_frame(feed.latest())? {
            MachineStatus::CycleComplete(summary) => {
                report.completed += 1;
                if summary.rejected {
                    report.rejected += 1;
                }
                if plan_done(&plan, &report) {
                    tracing::info!(completed = report.completed, "production complete");
                    return Ok((report, machine));
                }
            }
            MachineStatus::Faulted(cause) => {
                report.faults += 1;
                if !plan.hold_in_fault {
                    return Err(crate::error::Report::new(ControlError::State(format!(
                        "fault: {cause}"
                    ))));
                }
            }
            MachineStatus::Idle | MachineStatus::Running(_) => {}
        }
    }
}

fn drain_commands<S: SensorSuite, A: Actuators>(
    machine: &mut Machine<S, A>,
    commands: Option<&xch::Receiver<Command>>,
) {
    if let Some(rx) = commands {
        while let Ok(cmd) = rx.try_recv() {
            machine.command(cmd);
        }
    }
}

/// Keep production rolling while the plan wants more cycles.
fn maybe_request_start<S: SensorSuite, A: Actuators>(
    machine: &mut Machine<S, A>,
    plan: &RunPlan,
    report: &RunReport,
) {
    let more_wanted = plan.cycles.is_none_or(|n| report.completed < n);
    if more_wanted && matches!(machine.phase(), crate::phase::Phase::Idle) {
        machine.command(Command::StartCycle);
    }
}

fn plan_done(plan: &RunPlan, report: &RunReport) -> bool {
    plan.cycles.is_some_and(|n| report.completed >= n)
}
