//! JSON-lines cycle log sink: one object per finalized cycle.

use molder_core::sink::{CycleSink, CycleSummary};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl CycleSink for JsonlSink {
    fn append(&mut self, s: &CycleSummary) -> std::io::Result<()> {
        let phases: Vec<serde_json::Value> = s
            .phases
            .iter()
            .map(|&(name, t_us)| serde_json::json!({ "phase": name, "entered_us": t_us }))
            .collect();
        let line = serde_json::json!({
            "cycle": s.cycle_index,
            "started_us": s.started_us,
            "completed_us": s.completed_us,
            "cycle_time_ms": s.cycle_time_ms,
            "phases": phases,
            "peak_cavity_bar": s.peak_cavity_bar,
            "avg_cavity_bar": s.avg_cavity_bar,
            "balance_pct": s.balance_pct,
            "pack_integral_bar_ms": s.pack_integral_bar_ms,
            "melt_c": s.melt_c,
            "peak_clamp_kn": s.peak_clamp_kn,
            "predicted_weight_g": s.predicted_weight_g,
            "quality_score": s.quality_score,
            "quality_class": s.quality_class,
            "rejected": s.rejected,
        });
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}
