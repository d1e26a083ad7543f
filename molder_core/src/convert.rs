//! Conversions from the serde-facing config schemas into core structs.

use crate::params::{CycleTiming, PackStage, ProcessParams, VelocityStage};
use crate::quality::MaterialProps;
use crate::safety::SafetyLimits;
use crate::spc::SpecLimits;
use crate::thermal::ThermalCfg;
use std::collections::BTreeMap;

impl From<&molder_config::ProcessCfg> for ProcessParams {
    fn from(c: &molder_config::ProcessCfg) -> Self {
        Self {
            velocity_stages: c
                .velocity_stages
                .iter()
                .map(|s| VelocityStage {
                    velocity_mm_s: s.velocity_mm_s,
                    until_position_mm: s.until_position_mm,
                })
                .collect(),
            transfer_position_mm: c.transfer_position_mm,
            pack_stages: c
                .pack_stages
                .iter()
                .map(|s| PackStage {
                    pressure_bar: s.pressure_bar,
                    duration_ms: s.duration_ms,
                })
                .collect(),
            hold_pressure_bar: c.hold_pressure_bar,
            hold_ms: c.hold_ms,
            zone_setpoints_c: c.zone_setpoints_c,
            cooling_ms: c.cooling_ms,
            target_weight_g: c.target_weight_g,
            weight_tol_g: c.weight_tol_g,
            pressure_ceiling_bar: c.pressure_ceiling_bar,
            gate_seal_drop: c.gate_seal_drop,
            plasticize_back_pressure_pct: c.plasticize_back_pressure_pct,
            shot_ready_mm: c.shot_ready_mm,
            timing: CycleTiming::default(),
        }
    }
}

/// Full conversion including the timing block, which lives in a separate
/// TOML table from the recipe.
pub fn process_params(cfg: &molder_config::Config) -> ProcessParams {
    let mut p = ProcessParams::from(&cfg.process);
    p.timing = CycleTiming {
        clamp_settle_ms: cfg.timing.clamp_settle_ms,
        ejection_ms: cfg.timing.ejection_ms,
        clamp_open_ms: cfg.timing.clamp_open_ms,
        plasticize_timeout_ms: cfg.timing.plasticize_timeout_ms,
    };
    p
}

impl From<&molder_config::SafetyCfg> for SafetyLimits {
    fn from(c: &molder_config::SafetyCfg) -> Self {
        Self {
            max_cavity_bar: c.max_cavity_bar,
            max_zone_c: c.max_zone_c,
            max_clamp_kn: c.max_clamp_kn,
            estop_debounce_n: c.estop_debounce_n.max(1),
            stale_frame_ticks: c.stale_frame_ticks.max(1),
        }
    }
}

impl From<&molder_config::ThermalCfg> for ThermalCfg {
    fn from(c: &molder_config::ThermalCfg) -> Self {
        Self {
            tolerance_c: c.tolerance_c,
            ready_hold_ms: c.ready_hold_ms,
            gains: c.gains,
        }
    }
}

impl From<&molder_config::MaterialCfg> for MaterialProps {
    fn from(c: &molder_config::MaterialCfg) -> Self {
        Self {
            melt_ref_c: c.melt_ref_c,
            melt_band_c: c.melt_band_c,
        }
    }
}

/// Per-metric engineering limits from the config map.
pub fn spec_limits(cfg: &molder_config::SpcCfg) -> BTreeMap<String, SpecLimits> {
    cfg.limits
        .iter()
        .map(|(name, &(usl, lsl))| (name.clone(), SpecLimits { usl, lsl }))
        .collect()
}
