//! Per-cycle quality prediction: weight estimate, dimensional and
//! strength indices, a blended score, and the accept/reject decision.
//!
//! Rejection is an OR of the classification and a hard weight-tolerance
//! check; a part can classify above Reject and still be rejected on
//! weight alone.

use crate::cycle::CycleRecord;
use crate::params::ProcessParams;

/// Material constants the predictor needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialProps {
    /// Reference melt temperature (C).
    pub melt_ref_c: f32,
    /// Acceptable melt deviation band (C), used for normalization.
    pub melt_band_c: f32,
}

impl Default for MaterialProps {
    fn default() -> Self {
        Self {
            melt_ref_c: 230.0,
            melt_band_c: 15.0,
        }
    }
}

/// Ordered quality classes, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityClass {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Reject,
}

impl QualityClass {
    /// Class boundaries: Excellent >= 95, Good >= 85, Acceptable >= 75,
    /// Poor >= 60, else Reject.
    pub fn from_score(score: f64) -> Self {
        if score >= 95.0 {
            Self::Excellent
        } else if score >= 85.0 {
            Self::Good
        } else if score >= 75.0 {
            Self::Acceptable
        } else if score >= 60.0 {
            Self::Poor
        } else {
            Self::Reject
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
            Self::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityPrediction {
    pub predicted_weight_g: f32,
    /// 0..100, decreases with cavity imbalance.
    pub dimensional_index: f64,
    /// 0..100, blends melt deviation and peak-pressure ratio.
    pub strength_index: f64,
    /// 0..100 blended score.
    pub score: f64,
    pub class: QualityClass,
    /// Class is Reject OR weight outside target ± tolerance.
    pub rejected: bool,
}

/// Score blend weights: weight conformance dominates, the indices split
/// the remainder.
const W_WEIGHT: f64 = 0.4;
const W_DIMENSIONAL: f64 = 0.3;
const W_STRENGTH: f64 = 0.3;
/// Score lost per percent of cavity imbalance.
const BALANCE_SCORE_SLOPE: f64 = 4.0;
/// Weight-conformance score at exactly one tolerance of deviation.
const WEIGHT_SCORE_AT_TOL: f64 = 50.0;

pub struct QualityPredictor {
    material: MaterialProps,
}

impl QualityPredictor {
    pub fn new(material: MaterialProps) -> Self {
        Self { material }
    }

    pub fn material(&self) -> &MaterialProps {
        &self.material
    }

    /// Evaluate one finalized cycle against the recipe it ran under.
    pub fn predict(&self, record: &CycleRecord, params: &ProcessParams) -> QualityPrediction {
        let predicted_weight_g = self.predict_weight(record, params);

        let weight_dev = f64::from((predicted_weight_g - params.target_weight_g).abs());
        let tol = f64::from(params.weight_tol_g);
        let weight_score = (100.0 - WEIGHT_SCORE_AT_TOL * weight_dev / tol).clamp(0.0, 100.0);

        let dimensional_index =
            (100.0 - BALANCE_SCORE_SLOPE * f64::from(record.balance_pct)).clamp(0.0, 100.0);

        let strength_index = self.strength_index(record, params);

        let score = W_WEIGHT * weight_score
            + W_DIMENSIONAL * dimensional_index
            + W_STRENGTH * strength_index;
        let class = QualityClass::from_score(score);

        let weight_out = weight_dev > tol;
        let rejected = class == QualityClass::Reject || weight_out;

        QualityPrediction {
            predicted_weight_g,
            dimensional_index,
            strength_index,
            score,
            class,
            rejected,
        }
    }

    /// Weight estimate: target weight scaled by the measured pack/hold
    /// integral relative to the reference integral the profile implies.
    fn predict_weight(&self, record: &CycleRecord, params: &ProcessParams) -> f32 {
        let reference = params.reference_integral();
        if reference <= 0.0 {
            return 0.0;
        }
        let ratio = record.pack_integral_bar_ms / reference;
        (f64::from(params.target_weight_g) * ratio) as f32
    }

    /// Blend of normalized melt deviation and peak-pressure ratio.
    fn strength_index(&self, record: &CycleRecord, params: &ProcessParams) -> f64 {
        let melt_dev = f64::from((record.melt_c - self.material.melt_ref_c).abs())
            / f64::from(self.material.melt_band_c.max(0.1));

        // Expected peak is the strongest configured pack target; deviation
        // in either direction erodes the index.
        let expected_peak = params
            .pack_stages
            .iter()
            .map(|s| s.pressure_bar)
            .fold(params.hold_pressure_bar, f32::max);
        let peak_ratio = if expected_peak > 0.0 {
            f64::from(record.peak_cavity_bar / expected_peak)
        } else {
            0.0
        };
        let pressure_dev = (peak_ratio - 1.0).abs();

        (100.0 - 60.0 * melt_dev - 40.0 * pressure_dev).clamp(0.0, 100.0)
    }
}
