//! The machine façade: one explicit instance owning every piece of
//! controller state, wired together by a validating builder.
//!
//! A `Machine` drives one tick per `step`/`step_from_frame` call:
//! acquisition, safety, thermal cadence, phase logic, actuator output,
//! and — on the tick a cycle completes — the ordered
//! quality → SPC → sink → optimizer pipeline.

use crate::cycle::{CycleHistory, CycleRecord};
use crate::error::{BuildError, FaultCause, Result};
use crate::optimizer::{
    OptimizerClient, PROTOCOL_VERSION, QualitySummary, RecommendationGate, Submission,
};
use crate::params::{ParamDeltas, ProcessParams};
use crate::phase::{MotionGains, Phase, ProcessController};
use crate::quality::{MaterialProps, QualityPredictor};
use crate::safety::{SafetyLimits, SafetyMonitor};
use crate::sink::{CycleSink, CycleSummary};
use crate::spc::{METRICS, SpcEngine, SpecLimits};
use crate::thermal::{ThermalCfg, ZoneRegulator};
use eyre::WrapErr;
use molder_traits::clock::{Clock, MonotonicClock};
use molder_traits::{Actuators, SensorFrame, SensorSuite, ZONE_COUNT};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Operator/remote commands, serialized against the tick by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    StartCycle,
    StopCycle,
    EmergencyStop,
    ResetFault,
    UpdateParams(ParamDeltas),
}

/// Outcome of one machine tick.
#[derive(Debug)]
pub enum MachineStatus {
    Idle,
    Running(Phase),
    Faulted(FaultCause),
    /// A cycle finalized this tick; quality/SPC/sink/optimizer have run.
    CycleComplete(Box<CycleSummary>),
}

pub struct Machine<S: SensorSuite, A: Actuators> {
    sensors: S,
    actuators: A,
    controller: ProcessController,
    safety: SafetyMonitor,
    thermal: ZoneRegulator,
    predictor: QualityPredictor,
    spc: SpcEngine,
    gate: RecommendationGate,
    optimizer: Option<OptimizerClient>,
    sink: Option<Box<dyn CycleSink>>,
    history: CycleHistory,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    tick_period_us: u64,
    thermal_period_us: u64,
    last_thermal_us: Option<u64>,
    heater_pct: [f32; ZONE_COUNT],
    sensor_timeout: Duration,
    /// Last frame accepted from acquisition; safety and thermal read it
    /// when the current tick has no fresh frame.
    last_frame: SensorFrame,
    /// Operator parameter update awaiting the next idle tick.
    pending_deltas: Option<ParamDeltas>,
    submit_every: u32,
    halt_after_unstable: u32,
    unstable_streak: u32,
    /// Latched by sustained-instability escalation; start commands are
    /// refused until an explicit StopCycle acknowledges it.
    inhibited: bool,
    pub cycles_completed: u64,
    pub cycles_rejected: u64,
}

// Map a boxed hardware error to a typed ControlError for reports.
fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> crate::error::ControlError {
    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        crate::error::ControlError::Timeout
    } else {
        crate::error::ControlError::Hardware(s)
    }
}

impl<S: SensorSuite, A: Actuators> Machine<S, A> {
    pub fn phase(&self) -> Phase {
        self.controller.phase()
    }

    pub fn params(&self) -> &ProcessParams {
        self.controller.params()
    }

    pub fn spc(&self) -> &SpcEngine {
        &self.spc
    }

    pub fn history(&self) -> &CycleHistory {
        &self.history
    }

    pub fn zones_ready(&self) -> bool {
        self.thermal.all_ready()
    }

    /// True once instability escalation has latched production off.
    pub fn production_inhibited(&self) -> bool {
        self.inhibited
    }

    /// Process one operator command. Parameter updates are buffered and
    /// applied at the next idle tick, never mid-cycle.
    pub fn command(&mut self, cmd: Command) {
        match cmd {
            Command::StartCycle => {
                if self.inhibited {
                    tracing::warn!("start refused: production inhibited by SPC escalation");
                } else {
                    self.controller.request_start();
                }
            }
            Command::StopCycle => {
                self.inhibited = false;
                self.controller.request_stop();
            }
            Command::EmergencyStop => {
                self.safety.command_estop();
                tracing::warn!("emergency stop commanded");
            }
            Command::ResetFault => {
                let now_us = self.clock.us_since(self.epoch);
                if self.safety.try_reset(&self.last_frame) {
                    if self.controller.reset_fault(now_us) {
                        self.thermal.reset();
                        tracing::info!("fault reset, machine idle");
                    }
                } else {
                    tracing::warn!("fault reset refused: interlock condition still present");
                }
            }
            Command::UpdateParams(deltas) => {
                self.pending_deltas = Some(deltas);
            }
        }
    }

    /// One tick in direct mode: acquire inside the loop, then run the
    /// tick body. Acquisition failure feeds the stale-frame path.
    pub fn step(&mut self) -> Result<MachineStatus> {
        let frame = match self.sensors.read(self.sensor_timeout) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::debug!(error = %e, "sensor read failed, holding last frame");
                None
            }
        };
        self.step_from_frame(frame)
    }

    /// One tick from an externally acquired frame (sampled mode).
    pub fn step_from_frame(&mut self, frame: Option<SensorFrame>) -> Result<MachineStatus> {
        let now_us = self.clock.us_since(self.epoch);
        if let Some(f) = frame.filter(|f| f.valid) {
            self.last_frame = f;
        }

        // Safety first: nothing else consumes the frame until the
        // interlocks have been evaluated.
        let safety_state = self.safety.evaluate(&self.last_frame);

        // Thermal cadence, independent of the phase machine.
        let due = match self.last_thermal_us {
            Some(prev) => now_us.saturating_sub(prev) >= self.thermal_period_us,
            None => true,
        };
        if due {
            self.last_thermal_us = Some(now_us);
            let setpoints = self.controller.params().zone_setpoints_c;
            self.heater_pct =
                self.thermal
                    .compute(&setpoints, &self.last_frame, now_us / 1000);
        }

        let out = self
            .controller
            .tick(now_us, frame.as_ref(), safety_state, self.thermal.all_ready());

        if let Some(cause) = out.entered_fault {
            // Same-tick guarantee: every output zeroed, relief raised.
            self.heater_pct = [0.0; ZONE_COUNT];
            self.actuators
                .all_stop()
                .map_err(|e| crate::error::Report::new(map_hw_error(&*e)))
                .wrap_err("all_stop on fault entry")?;
            self.clock.sleep(Duration::from_micros(self.tick_period_us));
            return Ok(MachineStatus::Faulted(cause));
        }

        let mut cmd = out.duty;
        cmd.heater_pct = if self.controller.phase() == Phase::Fault {
            [0.0; ZONE_COUNT]
        } else {
            self.heater_pct
        };
        self.actuators
            .apply(&cmd)
            .map_err(|e| crate::error::Report::new(map_hw_error(&*e)))
            .wrap_err("apply duty command")?;

        // Harvest any optimizer result; the gate holds it until idle.
        if let Some(client) = &self.optimizer
            && let Some(rec) = client.poll()
        {
            self.gate.offer(rec);
        }

        let status = if let Some(record) = out.finalized {
            let summary = self.finish_cycle(record, now_us);
            MachineStatus::CycleComplete(Box::new(summary))
        } else {
            match self.controller.phase() {
                Phase::Idle => MachineStatus::Idle,
                Phase::Fault => MachineStatus::Faulted(
                    self.controller
                        .fault_cause()
                        .unwrap_or(FaultCause::Estop),
                ),
                p => MachineStatus::Running(p),
            }
        };

        // Parameter mutation is only legal while idle.
        if self.controller.phase() == Phase::Idle {
            self.apply_pending_params(now_us);
        }

        self.clock.sleep(Duration::from_micros(self.tick_period_us));
        Ok(status)
    }

    /// Ordered completion pipeline: quality, SPC, sink, optimizer.
    fn finish_cycle(&mut self, record: CycleRecord, now_us: u64) -> CycleSummary {
        let prediction = self.predictor.predict(&record, self.controller.params());
        self.cycles_completed += 1;
        if prediction.rejected {
            self.cycles_rejected += 1;
            tracing::info!(
                cycle = record.index,
                weight_g = prediction.predicted_weight_g,
                class = prediction.class.as_str(),
                "part flagged for rejection"
            );
        }

        let metric_values = [
            f64::from(record.peak_cavity_bar),
            f64::from(prediction.predicted_weight_g),
            record.cycle_time_ms(),
            f64::from(record.melt_c),
        ];
        for (metric, value) in METRICS.iter().zip(metric_values) {
            self.spc.update(metric, value);
        }

        // Instability is advisory; escalation to a stop is opt-in config.
        if self.spc.all_stable() {
            self.unstable_streak = 0;
        } else {
            self.unstable_streak += 1;
            if self.halt_after_unstable > 0 && self.unstable_streak >= self.halt_after_unstable {
                tracing::warn!(
                    streak = self.unstable_streak,
                    "sustained SPC instability, inhibiting further cycles"
                );
                self.inhibited = true;
                self.controller.request_stop();
            }
        }

        let summary = CycleSummary::new(&record, &prediction);
        if let Some(sink) = self.sink.as_mut()
            && let Err(e) = sink.append(&summary)
        {
            tracing::warn!(error = %e, "cycle sink append failed");
        }

        if let Some(client) = &self.optimizer
            && self.submit_every > 0
            && self.cycles_completed % u64::from(self.submit_every) == 0
        {
            client.submit(Submission {
                version: PROTOCOL_VERSION,
                cycle_index: record.index,
                submitted_at_us: now_us,
                features: Self::cycle_features(&record, &summary),
                spc: self.spc.summaries(),
                quality: QualitySummary::from(&prediction),
            });
        }

        self.history.push(record);
        summary
    }

    fn cycle_features(record: &CycleRecord, summary: &CycleSummary) -> BTreeMap<String, f64> {
        let mut f = BTreeMap::new();
        f.insert("peak_cavity_bar".into(), f64::from(record.peak_cavity_bar));
        f.insert("avg_cavity_bar".into(), f64::from(record.avg_cavity_bar));
        f.insert("balance_pct".into(), f64::from(record.balance_pct));
        f.insert("pack_integral_bar_ms".into(), record.pack_integral_bar_ms);
        f.insert("melt_c".into(), f64::from(record.melt_c));
        f.insert("cycle_time_ms".into(), summary.cycle_time_ms);
        f.insert(
            "predicted_weight_g".into(),
            f64::from(summary.predicted_weight_g),
        );
        f
    }

    /// Apply buffered operator deltas, then any gated recommendation.
    /// Both go through validation; a delta set that violates bounds is
    /// dropped whole.
    fn apply_pending_params(&mut self, now_us: u64) {
        if let Some(deltas) = self.pending_deltas.take() {
            match deltas.apply_to(self.controller.params()) {
                Ok(next) => {
                    if let Err(e) = self.controller.swap_params(next) {
                        tracing::warn!(error = %e, "operator parameter update rejected");
                    } else {
                        tracing::info!("operator parameter update applied");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "operator parameter update invalid"),
            }
        }

        if let Some(rec) = self.gate.take_applicable(now_us) {
            match rec.deltas.apply_to(self.controller.params()) {
                Ok(next) => {
                    if self.controller.swap_params(next).is_ok() {
                        tracing::info!(
                            confidence = rec.confidence,
                            improvement = rec.predicted_improvement,
                            "optimizer recommendation applied"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "optimizer recommendation violates bounds, dropped");
                }
            }
        }
    }
}

// Type-state markers for the builder
pub struct Missing;

/// Builder for `Machine`. Sensors and actuators are enforced by
/// type-state; everything else is validated in `build()`.
pub struct MachineBuilder<S, A> {
    sensors: S,
    actuators: A,
    params: Option<ProcessParams>,
    safety: SafetyLimits,
    thermal: ThermalCfg,
    material: MaterialProps,
    gains: MotionGains,
    spc_window: usize,
    spc_limits: BTreeMap<String, SpecLimits>,
    halt_after_unstable: u32,
    min_confidence: f64,
    staleness_ms: u64,
    submit_every: u32,
    control_hz: u32,
    thermal_hz: u32,
    sensor_timeout_ms: u64,
    history_capacity: usize,
    optimizer: Option<OptimizerClient>,
    sink: Option<Box<dyn CycleSink>>,
    clock: Option<Box<dyn Clock + Send + Sync>>,
}

impl MachineBuilder<Missing, Missing> {
    pub fn new() -> Self {
        Self {
            sensors: Missing,
            actuators: Missing,
            params: None,
            safety: SafetyLimits::default(),
            thermal: ThermalCfg::default(),
            material: MaterialProps::default(),
            gains: MotionGains::default(),
            spc_window: 50,
            spc_limits: BTreeMap::new(),
            halt_after_unstable: 0,
            min_confidence: 0.70,
            staleness_ms: 60_000,
            submit_every: 1,
            control_hz: 1000,
            thermal_hz: 5,
            sensor_timeout_ms: 2,
            history_capacity: 256,
            optimizer: None,
            sink: None,
            clock: None,
        }
    }
}

impl Default for MachineBuilder<Missing, Missing> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> MachineBuilder<S, A> {
    pub fn with_sensors<S2: SensorSuite>(self, sensors: S2) -> MachineBuilder<S2, A> {
        MachineBuilder {
            sensors,
            actuators: self.actuators,
            params: self.params,
            safety: self.safety,
            thermal: self.thermal,
            material: self.material,
            gains: self.gains,
            spc_window: self.spc_window,
            spc_limits: self.spc_limits,
            halt_after_unstable: self.halt_after_unstable,
            min_confidence: self.min_confidence,
            staleness_ms: self.staleness_ms,
            submit_every: self.submit_every,
            control_hz: self.control_hz,
            thermal_hz: self.thermal_hz,
            sensor_timeout_ms: self.sensor_timeout_ms,
            history_capacity: self.history_capacity,
            optimizer: self.optimizer,
            sink: self.sink,
            clock: self.clock,
        }
    }

    pub fn with_actuators<A2: Actuators>(self, actuators: A2) -> MachineBuilder<S, A2> {
        MachineBuilder {
            sensors: self.sensors,
            actuators,
            params: self.params,
            safety: self.safety,
            thermal: self.thermal,
            material: self.material,
            gains: self.gains,
            spc_window: self.spc_window,
            spc_limits: self.spc_limits,
            halt_after_unstable: self.halt_after_unstable,
            min_confidence: self.min_confidence,
            staleness_ms: self.staleness_ms,
            submit_every: self.submit_every,
            control_hz: self.control_hz,
            thermal_hz: self.thermal_hz,
            sensor_timeout_ms: self.sensor_timeout_ms,
            history_capacity: self.history_capacity,
            optimizer: self.optimizer,
            sink: self.sink,
            clock: self.clock,
        }
    }

    pub fn with_params(mut self, params: ProcessParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_safety_limits(mut self, limits: SafetyLimits) -> Self {
        self.safety = limits;
        self
    }

    pub fn with_thermal(mut self, cfg: ThermalCfg) -> Self {
        self.thermal = cfg;
        self
    }

    pub fn with_material(mut self, material: MaterialProps) -> Self {
        self.material = material;
        self
    }

    pub fn with_motion_gains(mut self, gains: MotionGains) -> Self {
        self.gains = gains;
        self
    }

    pub fn with_spc(mut self, window: usize, limits: BTreeMap<String, SpecLimits>) -> Self {
        self.spc_window = window;
        self.spc_limits = limits;
        self
    }

    /// Opt-in escalation: withdraw start requests after this many
    /// consecutive unstable cycles (0 = advisory only).
    pub fn with_unstable_halt(mut self, cycles: u32) -> Self {
        self.halt_after_unstable = cycles;
        self
    }

    pub fn with_optimizer(mut self, client: OptimizerClient) -> Self {
        self.optimizer = Some(client);
        self
    }

    pub fn with_optimizer_gating(mut self, min_confidence: f64, staleness_ms: u64) -> Self {
        self.min_confidence = min_confidence;
        self.staleness_ms = staleness_ms;
        self
    }

    pub fn with_submit_every(mut self, cycles: u32) -> Self {
        self.submit_every = cycles;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn CycleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_rates(mut self, control_hz: u32, thermal_hz: u32) -> Self {
        self.control_hz = control_hz;
        self.thermal_hz = thermal_hz;
        self
    }

    pub fn with_sensor_timeout_ms(mut self, ms: u64) -> Self {
        self.sensor_timeout_ms = ms;
        self
    }

    /// Provide a custom clock implementation; defaults to MonotonicClock.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl<S: SensorSuite, A: Actuators> MachineBuilder<S, A> {
    /// Validate and assemble the machine.
    pub fn build(self) -> Result<Machine<S, A>> {
        let params = self
            .params
            .ok_or_else(|| crate::error::Report::new(BuildError::MissingParams))?;

        if self.control_hz == 0 || self.thermal_hz == 0 {
            return Err(crate::error::Report::new(BuildError::InvalidConfig(
                "control and thermal rates must be > 0",
            )));
        }
        if self.thermal_hz > self.control_hz {
            return Err(crate::error::Report::new(BuildError::InvalidConfig(
                "thermal rate must not exceed control rate",
            )));
        }
        if self.sensor_timeout_ms == 0 {
            return Err(crate::error::Report::new(BuildError::InvalidConfig(
                "sensor timeout must be >= 1 ms",
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(crate::error::Report::new(BuildError::InvalidConfig(
                "optimizer confidence threshold must be in [0, 1]",
            )));
        }
        if self.spc_window < 2 {
            return Err(crate::error::Report::new(BuildError::InvalidConfig(
                "spc window must hold at least 2 samples",
            )));
        }
        // Recipe setpoints must respect the absolute safety ceilings.
        for (zone, (&sp, &ceil)) in params
            .zone_setpoints_c
            .iter()
            .zip(self.safety.max_zone_c.iter())
            .enumerate()
        {
            if sp >= ceil {
                tracing::error!(zone, setpoint = sp, ceiling = ceil, "setpoint over ceiling");
                return Err(crate::error::Report::new(BuildError::InvalidConfig(
                    "zone setpoint at or above its absolute ceiling",
                )));
            }
        }
        if params.pressure_ceiling_bar > self.safety.max_cavity_bar {
            return Err(crate::error::Report::new(BuildError::InvalidConfig(
                "recipe pressure ceiling above the machine ceiling",
            )));
        }

        let controller = ProcessController::new(
            params,
            self.gains,
            self.control_hz,
            self.safety.stale_frame_ticks,
        )
        .map_err(crate::error::Report::new)?;

        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(b) => Arc::from(b),
            None => Arc::new(MonotonicClock::new()),
        };
        let epoch = clock.now();
        let thermal = ZoneRegulator::new(self.thermal, self.safety.max_zone_c);

        Ok(Machine {
            sensors: self.sensors,
            actuators: self.actuators,
            controller,
            safety: SafetyMonitor::new(self.safety),
            thermal,
            predictor: QualityPredictor::new(self.material),
            spc: SpcEngine::new(self.spc_window, self.spc_limits),
            gate: RecommendationGate::new(
                self.min_confidence,
                self.staleness_ms.saturating_mul(1000),
            ),
            optimizer: self.optimizer,
            sink: self.sink,
            history: CycleHistory::new(self.history_capacity),
            clock,
            epoch,
            tick_period_us: crate::util::period_us(self.control_hz),
            thermal_period_us: crate::util::period_us(self.thermal_hz),
            last_thermal_us: None,
            heater_pct: [0.0; ZONE_COUNT],
            sensor_timeout: Duration::from_millis(self.sensor_timeout_ms),
            last_frame: SensorFrame::empty(),
            pending_deltas: None,
            submit_every: self.submit_every,
            halt_after_unstable: self.halt_after_unstable,
            unstable_streak: 0,
            inhibited: false,
            cycles_completed: 0,
            cycles_rejected: 0,
        })
    }
}

