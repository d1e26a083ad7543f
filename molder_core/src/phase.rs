//! The cyclic phase state machine.
//!
//! Driven by a non-blocking periodic `tick`; every "wait N ms" in the
//! cycle is a stored deadline checked against the tick timestamp, never a
//! sleep. Safety preemption is evaluated before any phase logic and wins
//! over every other transition.
//!
//! Hot-path comparisons (positions, pressures, the gate-seal plateau) run
//! on quantized integers cached at parameter-swap time, so a tick does no
//! float threshold work and no allocation.

use crate::cycle::CycleRecord;
use crate::error::FaultCause;
use crate::params::{ParamCache, ProcessParams};
use crate::pid::{PidGains, PidLoop};
use crate::safety::SafetyState;
use crate::util::{to_cbar, to_um};
use molder_traits::{CAVITY_COUNT, DutyCommand, SensorFrame};

/// Cycle phases. `Fault` is terminal until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ClampClose,
    Injection,
    PackHold,
    Cooling,
    Ejection,
    ClampOpen,
    Plasticizing,
    Fault,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ClampClose => "clamp_close",
            Self::Injection => "injection",
            Self::PackHold => "pack_hold",
            Self::Cooling => "cooling",
            Self::Ejection => "ejection",
            Self::ClampOpen => "clamp_open",
            Self::Plasticizing => "plasticizing",
            Self::Fault => "fault",
        }
    }

    /// Phases where commands are derived from live readings and a stale
    /// frame is dangerous.
    fn is_critical(&self) -> bool {
        matches!(self, Self::Injection | Self::PackHold)
    }
}

/// Result of one control tick.
#[derive(Debug)]
pub struct TickOutput {
    /// Motion duties for this tick; heater duties are owned by the
    /// thermal regulator and merged by the machine.
    pub duty: DutyCommand,
    /// Present exactly once per completed cycle, on the tick that
    /// re-enters Idle.
    pub finalized: Option<CycleRecord>,
    /// Present on the tick that entered Fault.
    pub entered_fault: Option<FaultCause>,
}

/// Velocity and pressure loop gains for the two motion loops.
#[derive(Debug, Clone, Copy)]
pub struct MotionGains {
    pub velocity: (f32, f32, f32),
    pub pressure: (f32, f32, f32),
}

impl Default for MotionGains {
    fn default() -> Self {
        Self {
            velocity: (1.8, 0.4, 0.02),
            pressure: (0.25, 0.08, 0.0),
        }
    }
}

pub struct ProcessController {
    params: ProcessParams,
    cache: ParamCache,
    phase: Phase,
    phase_entered_us: u64,
    tick_period_us: u64,
    velocity_pid: PidLoop,
    pressure_pid: PidLoop,
    active_stage: usize,
    live: Option<CycleRecord>,
    cycles_started: u64,
    /// Cross-channel average cavity pressure last tick (centibar), for
    /// the gate-seal plateau detector.
    prev_avg_cbar: Option<i32>,
    /// Last frame accepted as good; held while readings go stale.
    held_frame: SensorFrame,
    stale_ticks: u32,
    stale_limit: u32,
    start_requested: bool,
    fault_cause: Option<FaultCause>,
    /// Cycles canceled by a fault (diagnostics).
    pub aborted_cycles: u64,
}

impl ProcessController {
    pub fn new(
        params: ProcessParams,
        gains: MotionGains,
        tick_hz: u32,
        stale_limit: u32,
    ) -> Result<Self, crate::error::BuildError> {
        params.validate()?;
        let cache = ParamCache::new(&params);
        Ok(Self {
            params,
            cache,
            phase: Phase::Idle,
            phase_entered_us: 0,
            tick_period_us: crate::util::period_us(tick_hz),
            velocity_pid: PidLoop::new(PidGains::duty(
                gains.velocity.0,
                gains.velocity.1,
                gains.velocity.2,
            )),
            pressure_pid: PidLoop::new(PidGains::duty(
                gains.pressure.0,
                gains.pressure.1,
                gains.pressure.2,
            )),
            active_stage: 0,
            live: None,
            cycles_started: 0,
            prev_avg_cbar: None,
            held_frame: SensorFrame::empty(),
            stale_ticks: 0,
            stale_limit: stale_limit.max(1),
            start_requested: false,
            fault_cause: None,
            aborted_cycles: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn params(&self) -> &ProcessParams {
        &self.params
    }

    pub fn fault_cause(&self) -> Option<FaultCause> {
        self.fault_cause
    }

    pub fn live_record(&self) -> Option<&CycleRecord> {
        self.live.as_ref()
    }

    /// Request a cycle start; honored at the next Idle tick with ready
    /// zones and a clear safety state.
    pub fn request_start(&mut self) {
        self.start_requested = true;
    }

    /// Withdraw any pending start request. A cycle already in flight runs
    /// to completion; immediate abort is the emergency stop's job.
    pub fn request_stop(&mut self) {
        self.start_requested = false;
    }

    /// Swap in new parameters. Only legal while idle; the caller
    /// serializes this against the tick.
    pub fn swap_params(&mut self, params: ProcessParams) -> Result<(), crate::error::BuildError> {
        if self.phase != Phase::Idle {
            return Err(crate::error::BuildError::InvalidConfig(
                "parameters may only change while idle",
            ));
        }
        params.validate()?;
        self.cache = ParamCache::new(&params);
        self.params = params;
        Ok(())
    }

    /// Leave Fault, if the safety state allows it. The caller must have
    /// already run `SafetyMonitor::try_reset` successfully.
    pub fn reset_fault(&mut self, now_us: u64) -> bool {
        if self.phase != Phase::Fault {
            return false;
        }
        self.fault_cause = None;
        self.velocity_pid.reset();
        self.pressure_pid.reset();
        self.prev_avg_cbar = None;
        self.stale_ticks = 0;
        self.enter(Phase::Idle, now_us);
        true
    }

    /// One control tick. `frame` is the freshest acquisition, if any;
    /// `safety` is this tick's already-evaluated interlock state;
    /// `zones_ready` gates the Idle -> ClampClose transition.
    pub fn tick(
        &mut self,
        now_us: u64,
        frame: Option<&SensorFrame>,
        safety: SafetyState,
        zones_ready: bool,
    ) -> TickOutput {
        // Stale handling: hold the last good frame up to the bound, then
        // escalate. Commands are never derived from older data than that.
        let frame = match frame {
            Some(f) if f.valid => {
                self.held_frame = *f;
                self.stale_ticks = 0;
                self.held_frame
            }
            _ => {
                self.stale_ticks = self.stale_ticks.saturating_add(1);
                if self.phase.is_critical() && self.stale_ticks > self.stale_limit {
                    return self.trip(FaultCause::SensorStale, now_us);
                }
                self.held_frame
            }
        };

        // Safety preemption first, before any phase logic.
        if safety.tripped() && self.phase != Phase::Fault {
            let cause = safety.cause().unwrap_or(FaultCause::Estop);
            return self.trip(cause, now_us);
        }

        let avg_bar = Self::cavity_average(&frame);
        let balance_pct = Self::cavity_balance_pct(&frame, avg_bar);
        let pack_dt_ms = if self.phase == Phase::PackHold {
            self.tick_period_us as f64 / 1000.0
        } else {
            0.0
        };
        if let Some(rec) = self.live.as_mut() {
            rec.record_tick(&frame, avg_bar, balance_pct, pack_dt_ms);
        }

        let elapsed_ms = now_us.saturating_sub(self.phase_entered_us) / 1000;
        let mut duty = DutyCommand::idle();
        let mut finalized = None;

        match self.phase {
            Phase::Idle => {
                if self.start_requested && zones_ready && !safety.tripped() {
                    self.start_requested = false;
                    self.cycles_started += 1;
                    let mut rec = CycleRecord::start(self.cycles_started, now_us);
                    rec.log_phase(Phase::ClampClose, now_us);
                    self.live = Some(rec);
                    self.enter(Phase::ClampClose, now_us);
                    duty.clamp_pct = 100.0;
                }
            }
            Phase::ClampClose => {
                duty.clamp_pct = 100.0;
                if elapsed_ms >= self.params.timing.clamp_settle_ms {
                    self.velocity_pid.reset();
                    self.active_stage = 0;
                    self.advance(Phase::Injection, now_us);
                }
            }
            Phase::Injection => {
                duty.clamp_pct = 100.0;
                let pos_um = to_um(frame.position_mm);
                // Stage advance: trigger position reached and a further
                // stage exists.
                while self.active_stage + 1 < self.cache.stages_um.len()
                    && pos_um >= self.cache.stages_um[self.active_stage].1
                {
                    self.active_stage += 1;
                    tracing::debug!(stage = self.active_stage, "velocity stage advance");
                }
                let last_um = self
                    .cache
                    .stages_um
                    .last()
                    .map(|&(_, p)| p)
                    .unwrap_or(i32::MAX);
                if pos_um >= self.cache.transfer_um || pos_um >= last_um {
                    self.pressure_pid.reset();
                    self.prev_avg_cbar = None;
                    self.advance(Phase::PackHold, now_us);
                    duty.injection_pct = 0.0;
                } else {
                    let target_v = self.cache.stages_um[self.active_stage].0;
                    let cmd = self.velocity_pid.update(
                        target_v,
                        frame.velocity_mm_s,
                        self.dt_s(),
                    );
                    // Pressure protection outranks velocity tracking.
                    duty.injection_pct = if self.max_cavity_cbar(&frame) > self.cache.ceiling_cbar {
                        0.0
                    } else {
                        cmd
                    };
                }
            }
            Phase::PackHold => {
                duty.clamp_pct = 100.0;
                let avg_cbar = to_cbar(avg_bar);
                let sealed = self.gate_sealed(avg_cbar);
                self.prev_avg_cbar = Some(avg_cbar);
                if sealed || elapsed_ms >= self.params.pack_hold_span_ms() {
                    if sealed {
                        tracing::debug!(avg_bar, "gate seal detected");
                    }
                    self.advance(Phase::Cooling, now_us);
                } else {
                    let target_bar = self.pack_target_bar(elapsed_ms);
                    duty.pack_pct = self.pressure_pid.update(target_bar, avg_bar, self.dt_s());
                }
            }
            Phase::Cooling => {
                duty.clamp_pct = 100.0;
                if elapsed_ms >= self.params.cooling_ms {
                    self.advance(Phase::Ejection, now_us);
                }
            }
            Phase::Ejection => {
                if elapsed_ms >= self.params.timing.ejection_ms {
                    self.advance(Phase::ClampOpen, now_us);
                }
            }
            Phase::ClampOpen => {
                if elapsed_ms >= self.params.timing.clamp_open_ms {
                    self.advance(Phase::Plasticizing, now_us);
                }
            }
            Phase::Plasticizing => {
                duty.back_pressure_pct = self.params.plasticize_back_pressure_pct;
                let pos_um = to_um(frame.position_mm);
                if pos_um <= self.cache.shot_ready_um {
                    // Shot accumulated: the cycle is complete.
                    if let Some(mut rec) = self.live.take() {
                        rec.finalize(now_us);
                        finalized = Some(rec);
                    }
                    self.enter(Phase::Idle, now_us);
                    duty.back_pressure_pct = 0.0;
                } else if elapsed_ms >= self.params.timing.plasticize_timeout_ms {
                    return self.trip(FaultCause::PlasticizeTimeout, now_us);
                }
            }
            Phase::Fault => {
                duty = self.fault_duty();
            }
        }

        TickOutput {
            duty,
            finalized,
            entered_fault: None,
        }
    }

    fn dt_s(&self) -> f32 {
        self.tick_period_us as f32 / 1_000_000.0
    }

    fn cavity_average(frame: &SensorFrame) -> f32 {
        frame.cavity_bar.iter().sum::<f32>() / CAVITY_COUNT as f32
    }

    /// Largest fractional deviation of any channel from the average, %.
    fn cavity_balance_pct(frame: &SensorFrame, avg_bar: f32) -> f32 {
        if avg_bar <= 0.0 {
            return 0.0;
        }
        frame
            .cavity_bar
            .iter()
            .map(|&p| (p - avg_bar).abs() / avg_bar * 100.0)
            .fold(0.0, f32::max)
    }

    fn max_cavity_cbar(&self, frame: &SensorFrame) -> i32 {
        frame
            .cavity_bar
            .iter()
            .map(|&p| to_cbar(p))
            .max()
            .unwrap_or(0)
    }

    /// Plateau detector: fractional drop of the tick-average cavity
    /// pressure against the previous tick, in basis points.
    fn gate_sealed(&self, avg_cbar: i32) -> bool {
        let Some(prev) = self.prev_avg_cbar else {
            return false;
        };
        if prev <= 0 || avg_cbar >= prev {
            return false;
        }
        let drop_bp = i64::from(prev - avg_cbar) * 10_000 / i64::from(prev);
        drop_bp >= self.cache.seal_drop_bp
    }

    /// Active pack target by cumulative stage duration, then hold.
    pub fn pack_target_bar(&self, elapsed_ms: u64) -> f32 {
        let mut cumulative = 0u64;
        for stage in &self.params.pack_stages {
            cumulative = cumulative.saturating_add(stage.duration_ms);
            if elapsed_ms < cumulative {
                return stage.pressure_bar;
            }
        }
        self.params.hold_pressure_bar
    }

    fn fault_duty(&self) -> DutyCommand {
        if self.fault_cause == Some(FaultCause::OverPressure) {
            DutyCommand::relieve()
        } else {
            DutyCommand::idle()
        }
    }

    fn advance(&mut self, next: Phase, now_us: u64) {
        if let Some(rec) = self.live.as_mut() {
            rec.log_phase(next, now_us);
        }
        self.enter(next, now_us);
    }

    fn enter(&mut self, next: Phase, now_us: u64) {
        tracing::trace!(from = self.phase.as_str(), to = next.as_str(), "phase");
        self.phase = next;
        self.phase_entered_us = now_us;
    }

    fn trip(&mut self, cause: FaultCause, now_us: u64) -> TickOutput {
        if self.live.take().is_some() {
            self.aborted_cycles += 1;
        }
        self.fault_cause = Some(cause);
        self.start_requested = false;
        self.enter(Phase::Fault, now_us);
        tracing::error!(cause = %cause, "fault: cycle canceled, outputs stopped");
        TickOutput {
            duty: self.fault_duty(),
            finalized: None,
            entered_fault: Some(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ProcessParams;

    fn controller() -> ProcessController {
        ProcessController::new(
            ProcessParams::default(),
            MotionGains::default(),
            1000,
            5,
        )
        .unwrap()
    }

    fn frame(position_mm: f32, velocity: f32, cavity: f32) -> SensorFrame {
        SensorFrame {
            cavity_bar: [cavity; 4],
            barrel_c: [205.0, 215.0, 225.0],
            nozzle_c: 230.0,
            mold_c: 45.0,
            position_mm,
            velocity_mm_s: velocity,
            valid: true,
            ..SensorFrame::empty()
        }
    }

    #[test]
    fn idle_until_start_and_zones_ready() {
        let mut c = controller();
        let f = frame(0.0, 0.0, 0.0);
        c.tick(0, Some(&f), SafetyState::default(), true);
        assert_eq!(c.phase(), Phase::Idle);

        c.request_start();
        c.tick(1000, Some(&f), SafetyState::default(), false);
        assert_eq!(c.phase(), Phase::Idle, "zones not ready");

        c.tick(2000, Some(&f), SafetyState::default(), true);
        assert_eq!(c.phase(), Phase::ClampClose);
    }

    #[test]
    fn safety_trip_faults_within_one_tick_and_zeroes_duty() {
        let mut c = controller();
        let f = frame(0.0, 0.0, 0.0);
        c.request_start();
        c.tick(0, Some(&f), SafetyState::default(), true);
        assert_eq!(c.phase(), Phase::ClampClose);

        let tripped = SafetyState {
            over_pressure: true,
            ..SafetyState::default()
        };
        let out = c.tick(1000, Some(&f), tripped, true);
        assert_eq!(c.phase(), Phase::Fault);
        assert_eq!(out.entered_fault, Some(FaultCause::OverPressure));
        assert_eq!(out.duty.injection_pct, 0.0);
        assert_eq!(out.duty.clamp_pct, 0.0);
        assert!(out.duty.vent, "pressure fault raises relief");
        assert_eq!(c.aborted_cycles, 1);
    }

    #[test]
    fn stale_frames_hold_then_escalate_in_injection() {
        let mut c = controller();
        let f = frame(0.0, 0.0, 0.0);
        c.request_start();
        c.tick(0, Some(&f), SafetyState::default(), true);
        // settle clamp
        let mut t = 0;
        while c.phase() == Phase::ClampClose {
            t += 1000;
            c.tick(t, Some(&f), SafetyState::default(), true);
        }
        assert_eq!(c.phase(), Phase::Injection);

        // Five stale ticks are tolerated, the sixth escalates.
        for _ in 0..5 {
            t += 1000;
            let out = c.tick(t, None, SafetyState::default(), true);
            assert!(out.entered_fault.is_none());
        }
        t += 1000;
        let out = c.tick(t, None, SafetyState::default(), true);
        assert_eq!(out.entered_fault, Some(FaultCause::SensorStale));
        assert_eq!(c.phase(), Phase::Fault);
    }

    #[test]
    fn reset_fault_returns_to_idle() {
        let mut c = controller();
        let f = frame(0.0, 0.0, 0.0);
        let tripped = SafetyState {
            estop: true,
            ..SafetyState::default()
        };
        c.tick(0, Some(&f), tripped, true);
        assert_eq!(c.phase(), Phase::Fault);
        assert!(c.reset_fault(1000));
        assert_eq!(c.phase(), Phase::Idle);
        assert_eq!(c.fault_cause(), None);
    }

    #[test]
    fn params_swap_refused_mid_cycle() {
        let mut c = controller();
        let f = frame(0.0, 0.0, 0.0);
        c.request_start();
        c.tick(0, Some(&f), SafetyState::default(), true);
        assert_eq!(c.phase(), Phase::ClampClose);
        assert!(c.swap_params(ProcessParams::default()).is_err());
    }

    #[test]
    fn pack_target_follows_profile_then_hold() {
        let c = controller();
        assert_eq!(c.pack_target_bar(0), 450.0);
        assert_eq!(c.pack_target_bar(1499), 450.0);
        assert_eq!(c.pack_target_bar(1500), 380.0);
        assert_eq!(c.pack_target_bar(2499), 380.0);
        assert_eq!(c.pack_target_bar(2500), 320.0);
        assert_eq!(c.pack_target_bar(100_000), 320.0);
    }

    #[test]
    fn gate_seal_requires_fractional_drop() {
        let mut c = controller();
        c.prev_avg_cbar = Some(40_000); // 400 bar
        // 3% drop, threshold 4%
        assert!(!c.gate_sealed(38_800));
        // 4% drop
        assert!(c.gate_sealed(38_400));
        // rising pressure never seals
        c.prev_avg_cbar = Some(40_000);
        assert!(!c.gate_sealed(41_000));
    }
}
