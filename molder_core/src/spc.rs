//! Statistical process control over per-cycle metrics.
//!
//! One fixed-capacity window per metric; statistics recompute on every
//! insert. Control limits derive from the observed window (mean ± 3σ);
//! capability indices derive from the configured engineering limits,
//! never from the data itself. Instability is advisory: it raises a
//! warning and counters, production is not halted here.

use std::collections::BTreeMap;
use std::collections::VecDeque;

/// Metrics tracked per finalized cycle.
pub const METRICS: [&str; 4] = [
    "peak_pressure",
    "predicted_weight",
    "cycle_time",
    "melt_temp",
];

/// Sigma multiplier for control limits.
const LIMIT_SIGMA: f64 = 3.0;
/// Rule b: consecutive points on one side of the mean.
const RUN_SAME_SIDE: usize = 9;
/// Rule c: consecutive strictly monotonic points.
const RUN_MONOTONIC: usize = 6;
/// Rule d: consecutive alternating points.
const RUN_ALTERNATING: usize = 14;

/// Engineering tolerance for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpecLimits {
    pub usl: f64,
    pub lsl: f64,
}

/// Which chart rule fired, with cumulative counters in the window owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartRule {
    OutsideLimits,
    SameSideRun,
    MonotonicRun,
    AlternatingRun,
}

/// Rolling window and derived statistics for one metric.
#[derive(Debug, Clone)]
pub struct SpcWindow {
    values: VecDeque<f64>,
    capacity: usize,
    spec: Option<SpecLimits>,
    /// True once the buffer has filled at least once; statistics are not
    /// considered valid before that.
    pub filled: bool,
    pub mean: f64,
    pub std_dev: f64,
    pub ucl: f64,
    pub lcl: f64,
    pub cp: Option<f64>,
    pub cpk: Option<f64>,
    pub stable: bool,
    /// Cumulative rule-violation counters, in rule order a..d.
    pub violations: [u64; 4],
}

impl SpcWindow {
    fn new(capacity: usize, spec: Option<SpecLimits>) -> Self {
        let capacity = capacity.max(2);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            spec,
            filled: false,
            mean: 0.0,
            std_dev: 0.0,
            ucl: 0.0,
            lcl: 0.0,
            cp: None,
            cpk: None,
            stable: true,
            violations: [0; 4],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    fn insert(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        if self.values.len() == self.capacity {
            self.filled = true;
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let n = self.values.len();
        if n == 0 {
            return;
        }
        let nf = n as f64;
        self.mean = self.values.iter().sum::<f64>() / nf;
        self.std_dev = if n < 2 {
            0.0
        } else {
            let ss: f64 = self
                .values
                .iter()
                .map(|v| {
                    let d = v - self.mean;
                    d * d
                })
                .sum();
            (ss / (nf - 1.0)).sqrt()
        };
        self.ucl = self.mean + LIMIT_SIGMA * self.std_dev;
        self.lcl = self.mean - LIMIT_SIGMA * self.std_dev;

        (self.cp, self.cpk) = match (self.spec, self.std_dev) {
            (Some(spec), sd) if sd > 0.0 => {
                let cp = (spec.usl - spec.lsl) / (6.0 * sd);
                let cpu = (spec.usl - self.mean) / (3.0 * sd);
                let cpl = (self.mean - spec.lsl) / (3.0 * sd);
                (Some(cp), Some(cpu.min(cpl)))
            }
            _ => (None, None),
        };

        let fired = self.evaluate_rules();
        self.stable = fired.is_empty();
        for rule in fired {
            let slot = match rule {
                ChartRule::OutsideLimits => 0,
                ChartRule::SameSideRun => 1,
                ChartRule::MonotonicRun => 2,
                ChartRule::AlternatingRun => 3,
            };
            self.violations[slot] += 1;
        }
    }

    /// Apply the four chart rules, in order, against the current window.
    fn evaluate_rules(&self) -> Vec<ChartRule> {
        let mut fired = Vec::new();
        let vals: Vec<f64> = self.values.iter().copied().collect();
        let n = vals.len();

        // (a) any point outside the control limits
        if self.std_dev > 0.0 && vals.iter().any(|&v| v > self.ucl || v < self.lcl) {
            fired.push(ChartRule::OutsideLimits);
        }

        // (b) >= 9 consecutive points on the same side of the mean
        let mut run = 0usize;
        let mut side = 0i8;
        let mut same_side = false;
        for &v in &vals {
            let s = if v > self.mean {
                1
            } else if v < self.mean {
                -1
            } else {
                0
            };
            if s != 0 && s == side {
                run += 1;
            } else {
                side = s;
                run = usize::from(s != 0);
            }
            if run >= RUN_SAME_SIDE {
                same_side = true;
            }
        }
        if same_side {
            fired.push(ChartRule::SameSideRun);
        }

        // (c) >= 6 consecutive strictly monotonic points
        if n >= RUN_MONOTONIC {
            let mut inc = 1usize;
            let mut dec = 1usize;
            let mut monotonic = false;
            for w in vals.windows(2) {
                if w[1] > w[0] {
                    inc += 1;
                    dec = 1;
                } else if w[1] < w[0] {
                    dec += 1;
                    inc = 1;
                } else {
                    inc = 1;
                    dec = 1;
                }
                if inc >= RUN_MONOTONIC || dec >= RUN_MONOTONIC {
                    monotonic = true;
                }
            }
            if monotonic {
                fired.push(ChartRule::MonotonicRun);
            }
        }

        // (d) >= 14 consecutive alternating up/down points
        if n >= RUN_ALTERNATING {
            let mut run_len = 1usize;
            let mut last_dir = 0i8;
            let mut alternating = false;
            for w in vals.windows(2) {
                let dir = if w[1] > w[0] {
                    1
                } else if w[1] < w[0] {
                    -1
                } else {
                    0
                };
                if dir != 0 && dir == -last_dir {
                    run_len += 1;
                } else if dir != 0 {
                    run_len = 2;
                } else {
                    run_len = 1;
                }
                last_dir = dir;
                if run_len >= RUN_ALTERNATING {
                    alternating = true;
                }
            }
            if alternating {
                fired.push(ChartRule::AlternatingRun);
            }
        }

        fired
    }
}

/// Aggregated snapshot for optimizer submissions and operator display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpcSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub cp: Option<f64>,
    pub cpk: Option<f64>,
    pub stable: bool,
}

pub struct SpcEngine {
    windows: BTreeMap<String, SpcWindow>,
    capacity: usize,
    limits: BTreeMap<String, SpecLimits>,
}

impl SpcEngine {
    pub fn new(capacity: usize, limits: BTreeMap<String, SpecLimits>) -> Self {
        Self {
            windows: BTreeMap::new(),
            capacity,
            limits,
        }
    }

    /// Fold one finalized-cycle value into its metric window and return
    /// the recomputed window.
    pub fn update(&mut self, metric: &str, value: f64) -> &SpcWindow {
        let window = self.windows.entry(metric.to_owned()).or_insert_with(|| {
            SpcWindow::new(self.capacity, self.limits.get(metric).copied())
        });
        let was_stable = window.stable;
        window.insert(value);
        if was_stable && !window.stable {
            tracing::warn!(metric, mean = window.mean, "spc instability detected");
        }
        window
    }

    pub fn window(&self, metric: &str) -> Option<&SpcWindow> {
        self.windows.get(metric)
    }

    /// True if every tracked window currently reports stable.
    pub fn all_stable(&self) -> bool {
        self.windows.values().all(|w| w.stable)
    }

    /// Per-metric summaries, never the raw buffers.
    pub fn summaries(&self) -> BTreeMap<String, SpcSummary> {
        self.windows
            .iter()
            .map(|(name, w)| {
                (
                    name.clone(),
                    SpcSummary {
                        mean: w.mean,
                        std_dev: w.std_dev,
                        cp: w.cp,
                        cpk: w.cpk,
                        stable: w.stable,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(capacity: usize, usl: f64, lsl: f64) -> SpcEngine {
        let mut limits = BTreeMap::new();
        limits.insert("m".to_owned(), SpecLimits { usl, lsl });
        SpcEngine::new(capacity, limits)
    }

    #[test]
    fn hand_computed_statistics() {
        let mut eng = engine_with(5, 16.0, 4.0);
        for v in [10.0, 12.0, 8.0, 11.0, 9.0] {
            eng.update("m", v);
        }
        let w = eng.window("m").unwrap();
        assert!(w.filled);
        assert!((w.mean - 10.0).abs() < 1e-12);
        // sample std dev of [10,12,8,11,9]: variance = 10/4 = 2.5
        let sd = 2.5f64.sqrt();
        assert!((w.std_dev - sd).abs() < 1e-12);
        assert!((w.ucl - (10.0 + 3.0 * sd)).abs() < 1e-12);
        assert!((w.lcl - (10.0 - 3.0 * sd)).abs() < 1e-12);
        let cp = (16.0 - 4.0) / (6.0 * sd);
        assert!((w.cp.unwrap() - cp).abs() < 1e-12);
        // centered distribution: cpk == cp
        assert!((w.cpk.unwrap() - cp).abs() < 1e-12);
    }

    #[test]
    fn off_center_cpk_takes_nearer_limit() {
        let mut eng = engine_with(4, 20.0, 0.0);
        for v in [14.0, 16.0, 14.0, 16.0] {
            eng.update("m", v);
        }
        let w = eng.window("m").unwrap();
        let sd = w.std_dev;
        let expect = (20.0 - 15.0) / (3.0 * sd);
        assert!((w.cpk.unwrap() - expect).abs() < 1e-12);
        assert!(w.cpk.unwrap() < w.cp.unwrap());
    }

    #[test]
    fn same_side_run_flags_on_ninth_point() {
        let mut eng = engine_with(50, 100.0, 0.0);
        // Establish a mean below the run values; the last baseline point
        // sits below the mean so the run starts at the first 12.0.
        for i in 0..10 {
            eng.update("m", if i % 2 == 0 { 11.0 } else { 9.0 });
        }
        // Eight above-mean points: still stable on rule (b).
        for _ in 0..8 {
            let w = eng.update("m", 12.0);
            assert_eq!(w.violations[1], 0, "run rule must not fire before 9");
        }
        let w = eng.update("m", 12.0);
        assert!(!w.stable);
        assert!(w.violations[1] > 0);
    }

    #[test]
    fn monotonic_run_flags_six_rising_points() {
        let mut eng = engine_with(50, 1000.0, -1000.0);
        // Alternate first so the trend is the only violation candidate.
        for v in [10.0, 9.5, 10.5, 9.0] {
            eng.update("m", v);
        }
        for v in [10.0, 11.0, 12.0, 13.0, 14.0] {
            eng.update("m", v);
        }
        let w = eng.update("m", 15.0);
        assert!(w.violations[2] > 0);
    }

    #[test]
    fn zero_spread_has_no_capability() {
        let mut eng = engine_with(3, 10.0, 0.0);
        for _ in 0..3 {
            eng.update("m", 5.0);
        }
        let w = eng.window("m").unwrap();
        assert_eq!(w.cp, None);
        assert_eq!(w.cpk, None);
    }

    #[test]
    fn not_filled_until_capacity_reached() {
        let mut eng = engine_with(5, 10.0, 0.0);
        for v in [1.0, 2.0, 3.0, 4.0] {
            assert!(!eng.update("m", v).filled);
        }
        assert!(eng.update("m", 5.0).filled);
        // Eviction keeps it filled.
        assert!(eng.update("m", 6.0).filled);
        assert_eq!(eng.window("m").unwrap().len(), 5);
    }

    #[test]
    fn summaries_expose_no_raw_buffers() {
        let mut eng = engine_with(3, 10.0, 0.0);
        eng.update("m", 5.0);
        let s = eng.summaries();
        assert!((s["m"].mean - 5.0).abs() < 1e-12);
    }
}
