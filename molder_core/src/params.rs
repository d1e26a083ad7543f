//! Process parameters: the recipe the state machine executes.
//!
//! Parameters are validated on build and again after every delta
//! application; the running controller only ever sees a validated copy,
//! and swaps happen exclusively while the machine is idle.

use crate::error::BuildError;
use crate::util::{to_cbar, to_um};

/// One injection velocity stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityStage {
    pub velocity_mm_s: f32,
    pub until_position_mm: f32,
}

/// One pack-pressure stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackStage {
    pub pressure_bar: f32,
    pub duration_ms: u64,
}

/// Fixed inter-phase intervals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTiming {
    pub clamp_settle_ms: u64,
    pub ejection_ms: u64,
    pub clamp_open_ms: u64,
    pub plasticize_timeout_ms: u64,
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            clamp_settle_ms: 500,
            ejection_ms: 800,
            clamp_open_ms: 600,
            plasticize_timeout_ms: 20_000,
        }
    }
}

/// The full recipe. Mutated only between cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessParams {
    pub velocity_stages: Vec<VelocityStage>,
    pub transfer_position_mm: f32,
    pub pack_stages: Vec<PackStage>,
    pub hold_pressure_bar: f32,
    pub hold_ms: u64,
    pub zone_setpoints_c: [f32; 5],
    pub cooling_ms: u64,
    pub target_weight_g: f32,
    pub weight_tol_g: f32,
    pub pressure_ceiling_bar: f32,
    pub gate_seal_drop: f32,
    pub plasticize_back_pressure_pct: f32,
    pub shot_ready_mm: f32,
    pub timing: CycleTiming,
}

impl Default for ProcessParams {
    fn default() -> Self {
        Self {
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
            pack_stages: vec![
                PackStage {
                    pressure_bar: 450.0,
                    duration_ms: 1500,
                },
                PackStage {
                    pressure_bar: 380.0,
                    duration_ms: 1000,
                },
            ],
            hold_pressure_bar: 320.0,
            hold_ms: 1500,
            zone_setpoints_c: [205.0, 215.0, 225.0, 230.0, 45.0],
            cooling_ms: 8000,
            target_weight_g: 24.0,
            weight_tol_g: 0.5,
            pressure_ceiling_bar: 600.0,
            gate_seal_drop: 0.04,
            plasticize_back_pressure_pct: 25.0,
            shot_ready_mm: 0.5,
            timing: CycleTiming::default(),
        }
    }
}

impl ProcessParams {
    /// Structural validation; absolute-bound cross-checks live in the
    /// safety limits and the machine builder.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.velocity_stages.is_empty() {
            return Err(BuildError::InvalidConfig("velocity stages must not be empty"));
        }
        let mut prev_um = i32::MIN;
        for s in &self.velocity_stages {
            if !s.velocity_mm_s.is_finite() || s.velocity_mm_s <= 0.0 {
                return Err(BuildError::InvalidConfig("stage velocity must be > 0"));
            }
            let p = to_um(s.until_position_mm);
            if p <= prev_um {
                return Err(BuildError::InvalidConfig(
                    "stage positions must be strictly increasing",
                ));
            }
            prev_um = p;
        }
        // Stage exhaustion is the transfer fallback; a transfer position
        // beyond the final stage end could never be reached.
        let transfer_um = to_um(self.transfer_position_mm);
        if transfer_um <= 0 || transfer_um > prev_um {
            return Err(BuildError::InvalidConfig(
                "transfer position must be positive and within the final velocity stage",
            ));
        }
        if self.pack_stages.is_empty() {
            return Err(BuildError::InvalidConfig("pack stages must not be empty"));
        }
        for s in &self.pack_stages {
            if !s.pressure_bar.is_finite() || s.pressure_bar <= 0.0 {
                return Err(BuildError::InvalidConfig("pack pressure must be > 0"));
            }
            if s.duration_ms == 0 {
                return Err(BuildError::InvalidConfig("pack duration must be >= 1 ms"));
            }
        }
        if !self.hold_pressure_bar.is_finite() || self.hold_pressure_bar <= 0.0 {
            return Err(BuildError::InvalidConfig("hold pressure must be > 0"));
        }
        if !self.pressure_ceiling_bar.is_finite() || self.pressure_ceiling_bar <= 0.0 {
            return Err(BuildError::InvalidConfig("pressure ceiling must be > 0"));
        }
        if self
            .pack_stages
            .iter()
            .any(|s| s.pressure_bar > self.pressure_ceiling_bar)
            || self.hold_pressure_bar > self.pressure_ceiling_bar
        {
            return Err(BuildError::InvalidConfig(
                "pack/hold targets must not exceed the pressure ceiling",
            ));
        }
        if !(self.gate_seal_drop > 0.0 && self.gate_seal_drop < 1.0) {
            return Err(BuildError::InvalidConfig("gate_seal_drop must be in (0, 1)"));
        }
        if self.target_weight_g <= 0.0 || self.weight_tol_g <= 0.0 {
            return Err(BuildError::InvalidConfig(
                "target weight and tolerance must be > 0",
            ));
        }
        if !(0.0..=100.0).contains(&self.plasticize_back_pressure_pct) {
            return Err(BuildError::InvalidConfig(
                "plasticize back pressure must be in [0, 100] %",
            ));
        }
        if self.shot_ready_mm < 0.0 {
            return Err(BuildError::InvalidConfig("shot_ready_mm must be >= 0"));
        }
        Ok(())
    }

    /// Total configured pack/hold span in milliseconds (liveness timeout
    /// for the PackHold phase).
    pub fn pack_hold_span_ms(&self) -> u64 {
        self.pack_stages
            .iter()
            .map(|s| s.duration_ms)
            .sum::<u64>()
            .saturating_add(self.hold_ms)
    }

    /// Reference pressure-time integral implied by the configured pack
    /// profile (bar·ms). The quality predictor scales against this.
    pub fn reference_integral(&self) -> f64 {
        let staged: f64 = self
            .pack_stages
            .iter()
            .map(|s| f64::from(s.pressure_bar) * s.duration_ms as f64)
            .sum();
        staged + f64::from(self.hold_pressure_bar) * self.hold_ms as f64
    }
}

/// Integer caches for per-tick comparisons; recomputed once per swap.
#[derive(Debug, Clone)]
pub(crate) struct ParamCache {
    /// (target velocity mm/s, trigger position um) per stage.
    pub stages_um: Vec<(f32, i32)>,
    pub transfer_um: i32,
    pub ceiling_cbar: i32,
    pub shot_ready_um: i32,
    /// Gate-seal drop threshold in basis points of the previous average.
    pub seal_drop_bp: i64,
}

impl ParamCache {
    pub fn new(p: &ProcessParams) -> Self {
        Self {
            stages_um: p
                .velocity_stages
                .iter()
                .map(|s| (s.velocity_mm_s, to_um(s.until_position_mm)))
                .collect(),
            transfer_um: to_um(p.transfer_position_mm),
            ceiling_cbar: to_cbar(p.pressure_ceiling_bar),
            shot_ready_um: to_um(p.shot_ready_mm),
            seal_drop_bp: (f64::from(p.gate_seal_drop) * 10_000.0).round() as i64,
        }
    }
}

/// A partial parameter adjustment, from the operator or the optimizer.
///
/// Every field is an optional *delta* against the current recipe; absent
/// fields leave their target untouched. Application always goes through
/// `apply_to`, which re-validates the result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParamDeltas {
    /// Added to every pack stage pressure (bar).
    pub pack_pressure_bar: Option<f32>,
    /// Added to the hold pressure (bar).
    pub hold_pressure_bar: Option<f32>,
    /// Added to the hold duration (ms, may be negative).
    pub hold_ms: Option<i64>,
    /// Added to the cooling duration (ms, may be negative).
    pub cooling_ms: Option<i64>,
    /// Added to every zone setpoint (C).
    pub zone_temp_c: Option<f32>,
    /// Multiplier on every stage velocity (1.0 = unchanged).
    pub velocity_scale: Option<f32>,
}

impl ParamDeltas {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to a copy of `base` and validate. Returns the mutated params
    /// or the validation error; `base` itself is never touched.
    pub fn apply_to(&self, base: &ProcessParams) -> Result<ProcessParams, BuildError> {
        let mut p = base.clone();
        if let Some(d) = self.pack_pressure_bar {
            for s in &mut p.pack_stages {
                s.pressure_bar += d;
            }
        }
        if let Some(d) = self.hold_pressure_bar {
            p.hold_pressure_bar += d;
        }
        if let Some(d) = self.hold_ms {
            p.hold_ms = add_ms(p.hold_ms, d);
        }
        if let Some(d) = self.cooling_ms {
            p.cooling_ms = add_ms(p.cooling_ms, d);
        }
        if let Some(d) = self.zone_temp_c {
            for sp in &mut p.zone_setpoints_c {
                *sp += d;
            }
        }
        if let Some(k) = self.velocity_scale {
            for s in &mut p.velocity_stages {
                s.velocity_mm_s *= k;
            }
        }
        p.validate()?;
        Ok(p)
    }
}

fn add_ms(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}
