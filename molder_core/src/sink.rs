//! Append-only cycle log seam. One record per finalized cycle; the
//! storage format is the sink implementation's concern.

use crate::cycle::CycleRecord;
use crate::phase::Phase;
use crate::quality::QualityPrediction;

/// Everything a log consumer needs about one finished cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_index: u64,
    pub started_us: u64,
    pub completed_us: u64,
    pub cycle_time_ms: f64,
    /// Phase entry timeline (phase name, entry timestamp us).
    pub phases: Vec<(&'static str, u64)>,
    pub peak_cavity_bar: f32,
    pub avg_cavity_bar: f32,
    pub balance_pct: f32,
    pub pack_integral_bar_ms: f64,
    pub melt_c: f32,
    pub peak_clamp_kn: f32,
    pub predicted_weight_g: f32,
    pub quality_score: f64,
    pub quality_class: &'static str,
    pub rejected: bool,
}

impl CycleSummary {
    pub fn new(record: &CycleRecord, prediction: &QualityPrediction) -> Self {
        Self {
            cycle_index: record.index,
            started_us: record.started_us,
            completed_us: record.completed_us.unwrap_or(record.started_us),
            cycle_time_ms: record.cycle_time_ms(),
            phases: record
                .phase_log
                .iter()
                .map(|&(p, t)| (p.as_str(), t))
                .collect(),
            peak_cavity_bar: record.peak_cavity_bar,
            avg_cavity_bar: record.avg_cavity_bar,
            balance_pct: record.balance_pct,
            pack_integral_bar_ms: record.pack_integral_bar_ms,
            melt_c: record.melt_c,
            peak_clamp_kn: record.peak_clamp_kn,
            predicted_weight_g: prediction.predicted_weight_g,
            quality_score: prediction.score,
            quality_class: prediction.class.as_str(),
            rejected: prediction.rejected,
        }
    }

    /// Span of one phase from the timeline, if present.
    pub fn phase_entry(&self, phase: Phase) -> Option<u64> {
        self.phases
            .iter()
            .find(|&&(name, _)| name == phase.as_str())
            .map(|&(_, t)| t)
    }
}

/// Append-only sink for finalized cycles. Implementations must be quick;
/// they run on the supervisory path, not the control tick.
pub trait CycleSink {
    fn append(&mut self, summary: &CycleSummary) -> std::io::Result<()>;
}

/// Keeps summaries in memory; the default when no external sink is wired.
#[derive(Default)]
pub struct MemorySink {
    pub entries: Vec<CycleSummary>,
}

impl CycleSink for MemorySink {
    fn append(&mut self, summary: &CycleSummary) -> std::io::Result<()> {
        self.entries.push(summary.clone());
        Ok(())
    }
}
