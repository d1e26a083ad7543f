//! Production run wiring: config mapping, simulated machine assembly,
//! advisor thread, signal handling, and the runner loop.

use crate::cli::RtLock;
use crate::jsonl::JsonlSink;
use crate::rt::setup_rt_once;
use eyre::WrapErr;
use molder_core::convert;
use molder_core::feed::FrameFeed;
use molder_core::machine::{Command, MachineBuilder};
use molder_core::mocks::NoopSensors;
use molder_core::optimizer::{PROTOCOL_VERSION, Recommendation, spawn_advisor};
use molder_core::params::ParamDeltas;
use molder_core::runner::{self, RunPlan, RunReport};
use molder_core::safety::SafetyLimits;
use molder_core::thermal::ThermalCfg;
use molder_traits::clock::{Clock, MonotonicClock, VirtualClock};
use molder_sim::{MachineSim, SimCfg};
use std::path::PathBuf;
use std::time::Duration;

pub struct RunOpts {
    pub cycles: u64,
    pub direct: bool,
    pub cold_start: bool,
    pub cycle_log: Option<PathBuf>,
    pub no_advisor: bool,
    pub rt: bool,
    pub rt_prio: Option<i32>,
    pub rt_lock: Option<RtLock>,
    pub rt_cpu: Option<usize>,
}

/// Simple heuristic advisor: nudge the hold pressure toward the weight
/// target. A stand-in for the external optimizer node; the controller
/// gates its output exactly the same way.
fn weight_trim_advisor(
    target_g: f32,
    tol_g: f32,
) -> impl FnMut(&molder_core::optimizer::Submission) -> Option<Recommendation> {
    move |submission| {
        let err_g = submission.quality.predicted_weight_g - target_g;
        if err_g.abs() < tol_g / 4.0 {
            return None;
        }
        // Underweight wants more hold pressure; overweight wants less.
        let delta_bar = (-err_g / tol_g * 8.0).clamp(-15.0, 15.0);
        // Confidence grows with how decisively the window agrees.
        let stable = submission.spc.values().all(|s| s.stable);
        Some(Recommendation {
            version: PROTOCOL_VERSION,
            deltas: ParamDeltas {
                hold_pressure_bar: Some(delta_bar),
                ..ParamDeltas::default()
            },
            predicted_improvement: f64::from(err_g.abs() / tol_g),
            confidence: if stable { 0.85 } else { 0.55 },
            issued_at_us: submission.submitted_at_us,
        })
    }
}

pub fn run_production(cfg: &molder_config::Config, opts: RunOpts) -> eyre::Result<RunReport> {
    setup_rt_once(opts.rt, opts.rt_prio, opts.rt_lock.unwrap_or(RtLock::os_default()), opts.rt_cpu);

    let params = convert::process_params(cfg);
    let limits = SafetyLimits::from(&cfg.safety);
    let thermal = ThermalCfg::from(&cfg.thermal);
    let material = molder_core::MaterialProps::from(&cfg.material);
    let spc_limits = convert::spec_limits(&cfg.spc);

    let sim_cfg = SimCfg {
        dt_s: 1.0 / cfg.timing.control_hz as f32,
        ..SimCfg::default()
    };
    let sim = if opts.cold_start {
        MachineSim::new(sim_cfg)
    } else {
        MachineSim::preheated(sim_cfg, params.zone_setpoints_c)
    };

    // Ctrl-C is the emergency stop.
    let (cmd_tx, cmd_rx) = crossbeam_channel::bounded::<Command>(16);
    {
        let tx = cmd_tx.clone();
        ctrlc::set_handler(move || {
            if tx.try_send(Command::EmergencyStop).is_err() {
                std::process::exit(130);
            }
        })
        .wrap_err("installing ctrl-c handler")?;
    }

    // The simulation carries its own timebase, so production runs on a
    // virtual clock (sleeps advance it instantly); --rt pins the loop to
    // the wall clock instead.
    let clock: Box<dyn Clock + Send + Sync> = if opts.rt {
        Box::new(MonotonicClock::new())
    } else {
        Box::new(VirtualClock::new())
    };

    let mut builder = MachineBuilder::new()
        .with_actuators(sim.actuators())
        .with_params(params.clone())
        .with_safety_limits(limits)
        .with_thermal(thermal)
        .with_material(material)
        .with_spc(cfg.spc.window, spc_limits)
        .with_unstable_halt(cfg.spc.halt_after_unstable_cycles)
        .with_optimizer_gating(cfg.optimizer.min_confidence, cfg.optimizer.staleness_ms)
        .with_submit_every(cfg.optimizer.submit_every)
        .with_rates(cfg.timing.control_hz, cfg.timing.thermal_hz)
        .with_sensor_timeout_ms(cfg.runner.sensor_timeout_ms.unwrap_or(2))
        .with_clock(clock);

    if let Some(path) = &opts.cycle_log {
        let sink = JsonlSink::create(path)
            .wrap_err_with(|| format!("opening cycle log {}", path.display()))?;
        builder = builder.with_sink(Box::new(sink));
    }

    // The advisor handle must outlive the run; dropping it joins the thread.
    let _advisor_handle = if opts.no_advisor {
        None
    } else {
        let (client, handle) =
            spawn_advisor(weight_trim_advisor(params.target_weight_g, params.weight_tol_g));
        builder = builder.with_optimizer(client);
        Some(handle)
    };

    let plan = RunPlan {
        cycles: Some(opts.cycles),
        hold_in_fault: false,
    };

    // The feed thread paces itself on the wall clock, so sampled mode is
    // only meaningful when the control loop does too (--rt). Virtual-time
    // runs always read directly.
    let cfg_direct = matches!(cfg.runner.mode, molder_config::RunMode::Direct);
    let use_direct = opts.direct || cfg_direct || !opts.rt;
    if !opts.direct && !opts.rt {
        tracing::debug!("virtual-time run, using direct acquisition");
    }

    let report = if use_direct {
        let machine = builder.with_sensors(sim.sensors()).build()?;
        runner::run_direct(machine, plan, Some(cmd_rx))?.0
    } else {
        let sensor_timeout = Duration::from_millis(cfg.runner.sensor_timeout_ms.unwrap_or(2));
        let feed = FrameFeed::spawn(
            sim.sensors(),
            cfg.timing.control_hz,
            sensor_timeout,
            MonotonicClock::new(),
        );
        let machine = builder.with_sensors(NoopSensors).build()?;
        runner::run_sampled(
            machine,
            feed,
            sensor_timeout.as_micros() as u64,
            molder_core::util::period_us(cfg.timing.control_hz),
            plan,
            Some(cmd_rx),
        )?
        .0
    };

    Ok(report)
}

/// Build a machine against the simulator and tick it briefly.
pub fn self_check() -> eyre::Result<()> {
    let cfg = molder_config::Config::default();
    let params = convert::process_params(&cfg);
    let sim = MachineSim::preheated(SimCfg::default(), params.zone_setpoints_c);
    let mut machine = MachineBuilder::new()
        .with_sensors(sim.sensors())
        .with_actuators(sim.actuators())
        .with_params(params)
        .with_clock(Box::new(VirtualClock::new()))
        .build()?;
    for _ in 0..100 {
        machine.step()?;
    }
    tracing::info!("self-check passed: 100 idle ticks, no faults");
    Ok(())
}
