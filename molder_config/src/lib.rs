#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and tolerance-table parsing for the molding controller.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - The SPC tolerance CSV loader enforces headers and rejects
//!   inverted or non-finite engineering limits before they reach the
//!   capability computation.
use serde::Deserialize;
use serde::de::Deserializer;
use std::collections::BTreeMap;

/// SPC tolerance CSV schema.
///
/// Expected headers:
/// metric,usl,lsl
///
/// Example:
/// metric,usl,lsl
/// peak_pressure,620.0,380.0
/// predicted_weight,24.6,23.4
#[derive(Debug, Deserialize, Clone)]
pub struct SpecLimitRow {
    pub metric: String,
    pub usl: f64,
    pub lsl: f64,
}

/// One injection velocity stage: run at `velocity_mm_s` until the screw
/// reaches `until_position_mm`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct VelocityStage {
    pub velocity_mm_s: f32,
    pub until_position_mm: f32,
}

/// One pack-pressure stage: hold `pressure_bar` for `duration_ms`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct PackStage {
    pub pressure_bar: f32,
    pub duration_ms: u64,
}

/// Recipe: everything the operator tunes per part/material.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessCfg {
    /// Ordered velocity profile. Accepts either:
    /// - array of tables: [{ velocity_mm_s = 30.0, until_position_mm = 10.0 }, ...]
    /// - array of pairs: [[30.0, 10.0], [60.0, 30.0]]
    #[serde(deserialize_with = "de_velocity_stages")]
    pub velocity_stages: Vec<VelocityStage>,
    /// Velocity-to-pressure transfer position (mm).
    pub transfer_position_mm: f32,
    /// Ordered pack profile. Same tuple-or-table flexibility as above.
    #[serde(deserialize_with = "de_pack_stages")]
    pub pack_stages: Vec<PackStage>,
    pub hold_pressure_bar: f32,
    pub hold_ms: u64,
    /// Zone setpoints in C: barrel rear/mid/front, nozzle, mold.
    pub zone_setpoints_c: [f32; 5],
    pub cooling_ms: u64,
    pub target_weight_g: f32,
    pub weight_tol_g: f32,
    /// Recipe pressure ceiling (bar). Injection duty is cut to zero above it.
    pub pressure_ceiling_bar: f32,
    /// Fractional cavity-pressure drop that counts as gate seal.
    pub gate_seal_drop: f32,
    /// Back-pressure duty while plasticizing (%).
    pub plasticize_back_pressure_pct: f32,
    /// Screw position at which the next shot is considered accumulated (mm).
    pub shot_ready_mm: f32,
}

impl Default for ProcessCfg {
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
        }
    }
}

/// Fixed inter-phase intervals (machine constants, not recipe values).
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct TimingCfg {
    pub clamp_settle_ms: u64,
    pub ejection_ms: u64,
    pub clamp_open_ms: u64,
    pub plasticize_timeout_ms: u64,
    /// Control tick rate (Hz). On the order of 1 kHz.
    pub control_hz: u32,
    /// Thermal regulation rate (Hz). On the order of 1-10 Hz.
    pub thermal_hz: u32,
}

impl Default for TimingCfg {
    fn default() -> Self {
        Self {
            clamp_settle_ms: 500,
            ejection_ms: 800,
            clamp_open_ms: 600,
            plasticize_timeout_ms: 20_000,
            control_hz: 1000,
            thermal_hz: 5,
        }
    }
}

/// Absolute machine-protection ceilings, independent of any recipe.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct SafetyCfg {
    /// Absolute cavity pressure ceiling (bar).
    pub max_cavity_bar: f32,
    /// Absolute zone temperature ceilings in C (barrel x3, nozzle, mold).
    pub max_zone_c: [f32; 5],
    /// Absolute clamp force ceiling (kN).
    pub max_clamp_kn: f32,
    /// Consecutive e-stop polls required to latch.
    pub estop_debounce_n: u8,
    /// Consecutive ticks a stale/invalid frame is tolerated in a critical
    /// phase before escalating to a fault.
    pub stale_frame_ticks: u32,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            max_cavity_bar: 800.0,
            max_zone_c: [280.0, 280.0, 280.0, 290.0, 90.0],
            max_clamp_kn: 1200.0,
            estop_debounce_n: 2,
            stale_frame_ticks: 5,
        }
    }
}

/// Per-zone thermal regulation settings (shared across zones; gains are
/// per-zone because the mold loop is much slower than the barrel loops).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ThermalCfg {
    /// |reading - setpoint| tolerance per zone (C).
    pub tolerance_c: [f32; 5],
    /// Zones must sit inside tolerance this long before "ready" (ms).
    pub ready_hold_ms: u64,
    /// PID gains per zone: (kp, ki, kd).
    pub gains: [(f32, f32, f32); 5],
}

impl Default for ThermalCfg {
    fn default() -> Self {
        Self {
            tolerance_c: [5.0, 5.0, 5.0, 5.0, 3.0],
            ready_hold_ms: 2000,
            gains: [
                (20.0, 0.2, 0.0),
                (20.0, 0.2, 0.0),
                (20.0, 0.2, 0.0),
                (20.0, 0.2, 0.0),
                (10.0, 0.1, 0.0),
            ],
        }
    }
}

/// SPC engine settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpcCfg {
    /// Samples per metric window.
    pub window: usize,
    /// Per-metric engineering limits; metric name -> (usl, lsl).
    pub limits: BTreeMap<String, (f64, f64)>,
    /// Halt production after this many consecutive unstable cycles
    /// (0 = never; instability stays advisory).
    pub halt_after_unstable_cycles: u32,
}

impl Default for SpcCfg {
    fn default() -> Self {
        Self {
            window: 50,
            limits: BTreeMap::new(),
            halt_after_unstable_cycles: 0,
        }
    }
}

/// Material constants consumed by the quality predictor.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MaterialCfg {
    /// Reference melt temperature (C).
    pub melt_ref_c: f32,
    /// Acceptable melt deviation band (C) used for normalization.
    pub melt_band_c: f32,
}

impl Default for MaterialCfg {
    fn default() -> Self {
        Self {
            melt_ref_c: 230.0,
            melt_band_c: 15.0,
        }
    }
}

/// Optimizer link gating.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct OptimizerCfg {
    /// Minimum confidence to apply a recommendation.
    pub min_confidence: f64,
    /// Maximum recommendation age at application time (ms).
    pub staleness_ms: u64,
    /// Submit a feature summary every N completed cycles.
    pub submit_every: u32,
}

impl Default for OptimizerCfg {
    fn default() -> Self {
        Self {
            min_confidence: 0.70,
            staleness_ms: 60_000,
            submit_every: 1,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Background frame feed thread; control loop consumes latest frame.
    #[default]
    Sampled,
    /// Read sensors inside the control loop.
    Direct,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RunnerCfg {
    pub mode: RunMode,
    /// Max sensor wait per read (ms).
    pub sensor_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub process: ProcessCfg,
    pub timing: TimingCfg,
    pub safety: SafetyCfg,
    pub thermal: ThermalCfg,
    pub spc: SpcCfg,
    pub material: MaterialCfg,
    pub optimizer: OptimizerCfg,
    pub logging: Logging,
    pub runner: RunnerCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Structural validation beyond what serde can express. Absolute-bound
/// cross-checks against `SafetyCfg` happen again in the core builder.
pub fn validate(cfg: &Config) -> eyre::Result<()> {
    let p = &cfg.process;
    if p.velocity_stages.is_empty() {
        eyre::bail!("process.velocity_stages must not be empty");
    }
    for w in p.velocity_stages.windows(2) {
        if w[1].until_position_mm <= w[0].until_position_mm {
            eyre::bail!("process.velocity_stages positions must be strictly increasing");
        }
    }
    for s in &p.velocity_stages {
        if !s.velocity_mm_s.is_finite() || s.velocity_mm_s <= 0.0 {
            eyre::bail!("velocity stage speed must be finite and > 0");
        }
    }
    if p.pack_stages.is_empty() {
        eyre::bail!("process.pack_stages must not be empty");
    }
    for s in &p.pack_stages {
        if !s.pressure_bar.is_finite() || s.pressure_bar <= 0.0 {
            eyre::bail!("pack stage pressure must be finite and > 0");
        }
        if s.duration_ms == 0 {
            eyre::bail!("pack stage duration must be >= 1 ms");
        }
    }
    let final_stage_mm = p
        .velocity_stages
        .last()
        .map(|s| s.until_position_mm)
        .unwrap_or(0.0);
    if p.transfer_position_mm <= 0.0 || p.transfer_position_mm > final_stage_mm {
        eyre::bail!("transfer_position_mm must be positive and within the final velocity stage");
    }
    if !(0.0..1.0).contains(&p.gate_seal_drop) || p.gate_seal_drop <= 0.0 {
        eyre::bail!("gate_seal_drop must be in (0, 1)");
    }
    if p.weight_tol_g <= 0.0 || p.target_weight_g <= 0.0 {
        eyre::bail!("target weight and tolerance must be > 0");
    }
    if p.pressure_ceiling_bar > cfg.safety.max_cavity_bar {
        eyre::bail!("recipe pressure ceiling exceeds the absolute machine ceiling");
    }
    for (zone, (&sp, &ceil)) in p
        .zone_setpoints_c
        .iter()
        .zip(cfg.safety.max_zone_c.iter())
        .enumerate()
    {
        if sp >= ceil {
            eyre::bail!("zone {zone} setpoint {sp} C is at or above its ceiling {ceil} C");
        }
    }
    if cfg.timing.control_hz == 0 || cfg.timing.thermal_hz == 0 {
        eyre::bail!("control_hz and thermal_hz must be > 0");
    }
    if cfg.timing.thermal_hz > cfg.timing.control_hz {
        eyre::bail!("thermal_hz must not exceed control_hz");
    }
    if cfg.spc.window < 2 {
        eyre::bail!("spc.window must be >= 2");
    }
    if !(0.0..=1.0).contains(&cfg.optimizer.min_confidence) {
        eyre::bail!("optimizer.min_confidence must be in [0, 1]");
    }
    for (metric, &(usl, lsl)) in &cfg.spc.limits {
        check_limit_pair(metric, usl, lsl)?;
    }
    Ok(())
}

fn check_limit_pair(metric: &str, usl: f64, lsl: f64) -> eyre::Result<()> {
    if !usl.is_finite() || !lsl.is_finite() {
        eyre::bail!("spec limits for {metric} must be finite");
    }
    if usl <= lsl {
        eyre::bail!("spec limits for {metric} are inverted (usl {usl} <= lsl {lsl})");
    }
    Ok(())
}

/// Load a per-metric engineering tolerance table from CSV with a strict
/// `metric,usl,lsl` header. Later rows override earlier ones for the
/// same metric name.
pub fn load_spec_limits(csv_text: &str) -> eyre::Result<BTreeMap<String, (f64, f64)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    {
        let headers = rdr.headers()?;
        let expected = ["metric", "usl", "lsl"];
        let got: Vec<&str> = headers.iter().collect();
        if got != expected {
            eyre::bail!(
                "spec-limit CSV must have headers metric,usl,lsl (got {})",
                got.join(",")
            );
        }
    }

    let mut out = BTreeMap::new();
    for row in rdr.deserialize::<SpecLimitRow>() {
        let row = row?;
        check_limit_pair(&row.metric, row.usl, row.lsl)?;
        out.insert(row.metric, (row.usl, row.lsl));
    }
    if out.is_empty() {
        eyre::bail!("spec-limit CSV contains no rows");
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VelocityStageToml {
    Pair((f32, f32)),
    Table {
        velocity_mm_s: f32,
        until_position_mm: f32,
    },
}

fn de_velocity_stages<'de, D>(deserializer: D) -> Result<Vec<VelocityStage>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Vec<VelocityStageToml>> = Option::deserialize(deserializer)?;
    let mut out = Vec::new();
    if let Some(items) = opt {
        for s in items {
            match s {
                VelocityStageToml::Pair((v, p)) => out.push(VelocityStage {
                    velocity_mm_s: v,
                    until_position_mm: p,
                }),
                VelocityStageToml::Table {
                    velocity_mm_s,
                    until_position_mm,
                } => out.push(VelocityStage {
                    velocity_mm_s,
                    until_position_mm,
                }),
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PackStageToml {
    Pair((f32, u64)),
    Table { pressure_bar: f32, duration_ms: u64 },
}

fn de_pack_stages<'de, D>(deserializer: D) -> Result<Vec<PackStage>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Vec<PackStageToml>> = Option::deserialize(deserializer)?;
    let mut out = Vec::new();
    if let Some(items) = opt {
        for s in items {
            match s {
                PackStageToml::Pair((p, d)) => out.push(PackStage {
                    pressure_bar: p,
                    duration_ms: d,
                }),
                PackStageToml::Table {
                    pressure_bar,
                    duration_ms,
                } => out.push(PackStage {
                    pressure_bar,
                    duration_ms,
                }),
            }
        }
    }
    Ok(out)
}
