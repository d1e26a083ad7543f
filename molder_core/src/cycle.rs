//! Per-cycle aggregation: one live record owned by the state machine,
//! finalized into a bounded history when the machine returns to idle.
//!
//! All per-tick updates are O(1) and allocation-free; the phase timeline
//! vector is pre-allocated for the nine phases.

use crate::phase::Phase;
use molder_traits::{CAVITY_COUNT, SensorFrame};
use std::collections::VecDeque;

/// Everything measured over one molding cycle.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    /// Monotone cycle counter, assigned at cycle start.
    pub index: u64,
    /// Cycle start in microseconds since the controller epoch.
    pub started_us: u64,
    /// Phase entry timestamps, in order of entry.
    pub phase_log: Vec<(Phase, u64)>,
    /// Highest single-channel cavity pressure seen (bar).
    pub peak_cavity_bar: f32,
    /// Running mean of the cross-channel average pressure (bar).
    pub avg_cavity_bar: f32,
    /// Worst cavity balance deviation over the cycle (%).
    pub balance_pct: f32,
    /// Pressure-time integral accumulated during PackHold (bar·ms).
    pub pack_integral_bar_ms: f64,
    /// Running mean nozzle (melt) temperature (C).
    pub melt_c: f32,
    /// Peak clamp force (kN).
    pub peak_clamp_kn: f32,
    /// Furthest screw travel (mm).
    pub peak_position_mm: f32,
    /// Ticks aggregated into the pressure means.
    pressure_samples: u32,
    /// Ticks aggregated into the melt mean.
    melt_samples: u32,
    /// Set exactly once, when the machine re-enters idle.
    pub completed_us: Option<u64>,
}

impl CycleRecord {
    pub fn start(index: u64, now_us: u64) -> Self {
        Self {
            index,
            started_us: now_us,
            phase_log: Vec::with_capacity(9),
            peak_cavity_bar: 0.0,
            avg_cavity_bar: 0.0,
            balance_pct: 0.0,
            pack_integral_bar_ms: 0.0,
            melt_c: 0.0,
            peak_clamp_kn: 0.0,
            peak_position_mm: 0.0,
            pressure_samples: 0,
            melt_samples: 0,
            completed_us: None,
        }
    }

    pub fn log_phase(&mut self, phase: Phase, now_us: u64) {
        self.phase_log.push((phase, now_us));
    }

    /// Fold one tick's readings in. `avg_bar`/`balance_pct` are the
    /// cross-channel figures already computed by the controller;
    /// `pack_dt_ms` is nonzero only while PackHold is integrating.
    pub fn record_tick(
        &mut self,
        frame: &SensorFrame,
        avg_bar: f32,
        balance_pct: f32,
        pack_dt_ms: f64,
    ) {
        for ch in 0..CAVITY_COUNT {
            if frame.cavity_bar[ch] > self.peak_cavity_bar {
                self.peak_cavity_bar = frame.cavity_bar[ch];
            }
        }
        self.pressure_samples = self.pressure_samples.saturating_add(1);
        let n = self.pressure_samples as f32;
        self.avg_cavity_bar += (avg_bar - self.avg_cavity_bar) / n;
        if balance_pct > self.balance_pct {
            self.balance_pct = balance_pct;
        }
        if pack_dt_ms > 0.0 {
            self.pack_integral_bar_ms += f64::from(avg_bar) * pack_dt_ms;
        }
        self.melt_samples = self.melt_samples.saturating_add(1);
        let m = self.melt_samples as f32;
        self.melt_c += (frame.nozzle_c - self.melt_c) / m;
        if frame.clamp_kn > self.peak_clamp_kn {
            self.peak_clamp_kn = frame.clamp_kn;
        }
        if frame.position_mm > self.peak_position_mm {
            self.peak_position_mm = frame.position_mm;
        }
    }

    /// Stamp completion. The record must not be mutated afterwards.
    pub fn finalize(&mut self, now_us: u64) {
        debug_assert!(self.completed_us.is_none(), "cycle finalized twice");
        self.completed_us = Some(now_us);
    }

    /// Total cycle time in milliseconds; zero until finalized.
    pub fn cycle_time_ms(&self) -> f64 {
        self.completed_us
            .map(|end| (end.saturating_sub(self.started_us)) as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    /// Microseconds spent in `phase`, from its first entry to the next
    /// phase entry (or cycle completion for the last phase).
    pub fn phase_span_us(&self, phase: Phase) -> Option<u64> {
        let idx = self.phase_log.iter().position(|&(p, _)| p == phase)?;
        let start = self.phase_log[idx].1;
        let end = self
            .phase_log
            .get(idx + 1)
            .map(|&(_, t)| t)
            .or(self.completed_us)?;
        Some(end.saturating_sub(start))
    }
}

/// Bounded buffer of finalized records, oldest evicted on overflow.
/// Owned by the machine; everything else gets shared references.
#[derive(Debug)]
pub struct CycleHistory {
    records: VecDeque<CycleRecord>,
    capacity: usize,
}

impl CycleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: CycleRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&CycleRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CycleRecord> {
        self.records.iter()
    }
}
