//! Asynchronous optimizer link and recommendation gating.
//!
//! The optimizer is a loosely-coupled peer on its own schedule. From the
//! controller's side both directions are non-blocking bounded channels: a
//! full or disconnected peer degrades to "no recommendation available",
//! never a stall. Submissions carry aggregated summaries only — raw
//! buffers never cross the node boundary.
//!
//! The in-process advisor spawner exists for single-box deployments and
//! tests; each advisor owns one thread that is shut down when its handle
//! drops, preventing thread leaks.

use crate::params::ParamDeltas;
use crate::quality::QualityPrediction;
use crate::spc::SpcSummary;
use crossbeam_channel as xch;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Bumped on any incompatible change to the message structs.
pub const PROTOCOL_VERSION: u16 = 1;

/// Aggregated quality state for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySummary {
    pub score: f64,
    pub class: &'static str,
    pub rejected: bool,
    pub predicted_weight_g: f32,
}

impl From<&QualityPrediction> for QualitySummary {
    fn from(q: &QualityPrediction) -> Self {
        Self {
            score: q.score,
            class: q.class.as_str(),
            rejected: q.rejected,
            predicted_weight_g: q.predicted_weight_g,
        }
    }
}

/// One per-cycle feature summary sent to the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub version: u16,
    pub cycle_index: u64,
    /// Submission time in microseconds on the controller's epoch; echo it
    /// into `Recommendation::issued_at_us` so staleness is judged on one
    /// timebase.
    pub submitted_at_us: u64,
    pub features: BTreeMap<String, f64>,
    pub spc: BTreeMap<String, SpcSummary>,
    pub quality: QualitySummary,
}

/// A proposed parameter adjustment from the optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recommendation {
    pub version: u16,
    pub deltas: ParamDeltas,
    pub predicted_improvement: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Issue time in microseconds on the controller's epoch.
    pub issued_at_us: u64,
}

/// Controller-side endpoint. Both calls are non-blocking.
pub struct OptimizerClient {
    tx: xch::Sender<Submission>,
    rx: xch::Receiver<Recommendation>,
}

impl OptimizerClient {
    pub fn from_channels(tx: xch::Sender<Submission>, rx: xch::Receiver<Recommendation>) -> Self {
        Self { tx, rx }
    }

    /// Fire-and-forget. A full or disconnected channel drops the
    /// submission; production is never affected.
    pub fn submit(&self, submission: Submission) {
        match self.tx.try_send(submission) {
            Ok(()) => {}
            Err(xch::TrySendError::Full(s)) => {
                tracing::debug!(cycle = s.cycle_index, "optimizer busy, submission dropped");
            }
            Err(xch::TrySendError::Disconnected(s)) => {
                tracing::debug!(cycle = s.cycle_index, "optimizer gone, submission dropped");
            }
        }
    }

    /// Most recent unconsumed result, if any. Never blocks.
    pub fn poll(&self) -> Option<Recommendation> {
        self.rx.try_iter().last()
    }
}

/// Join-on-drop handle for an in-process advisor thread.
pub struct AdvisorHandle {
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl Drop for AdvisorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("advisor thread joined"),
                Err(e) => tracing::warn!(?e, "advisor thread panicked during shutdown"),
            }
        }
    }
}

/// Spawn an advisor function on its own thread, returning the
/// controller-side client and the thread handle.
///
/// The advisor sees each submission in order and may return a
/// recommendation. Response capacity is one: the controller only ever
/// cares about the newest result.
pub fn spawn_advisor<F>(mut advisor: F) -> (OptimizerClient, AdvisorHandle)
where
    F: FnMut(&Submission) -> Option<Recommendation> + Send + 'static,
{
    let (sub_tx, sub_rx) = xch::bounded::<Submission>(4);
    let (rec_tx, rec_rx) = xch::bounded::<Recommendation>(1);
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    let join_handle = std::thread::spawn(move || {
        loop {
            if shutdown_clone.load(Ordering::Relaxed) {
                break;
            }
            // Timed recv so shutdown is honored even when idle.
            match sub_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(submission) => {
                    if let Some(rec) = advisor(&submission)
                        && rec_tx.try_send(rec).is_err()
                    {
                        // An unconsumed older result still sits in the
                        // channel; the controller will supersede it on its
                        // next poll. Dropping the newer one here is the
                        // bounded-capacity trade.
                        tracing::debug!("recommendation channel full, result dropped");
                    }
                }
                Err(xch::RecvTimeoutError::Timeout) => {}
                Err(xch::RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::trace!("advisor thread exiting");
    });

    (
        OptimizerClient::from_channels(sub_tx, rec_rx),
        AdvisorHandle {
            shutdown,
            join_handle: Some(join_handle),
        },
    )
}

/// Buffers the newest eligible recommendation and releases it only at
/// idle, enforcing confidence and staleness bounds.
pub struct RecommendationGate {
    pub min_confidence: f64,
    pub staleness_us: u64,
    pending: Option<Recommendation>,
    pub applied: u64,
    pub discarded: u64,
}

impl RecommendationGate {
    pub fn new(min_confidence: f64, staleness_us: u64) -> Self {
        Self {
            min_confidence,
            staleness_us,
            pending: None,
            applied: 0,
            discarded: 0,
        }
    }

    /// Offer a polled result. Low confidence or a version mismatch is
    /// discarded immediately; an eligible result replaces any older
    /// pending one (newest wins).
    pub fn offer(&mut self, rec: Recommendation) {
        if rec.version != PROTOCOL_VERSION {
            self.discarded += 1;
            tracing::warn!(version = rec.version, "recommendation version mismatch");
            return;
        }
        if rec.confidence < self.min_confidence {
            self.discarded += 1;
            tracing::debug!(
                confidence = rec.confidence,
                threshold = self.min_confidence,
                "recommendation below confidence threshold"
            );
            return;
        }
        self.pending = Some(rec);
    }

    /// Release the pending recommendation for application. Called only
    /// while the machine is idle; staleness is judged now, at
    /// application time, not at arrival.
    pub fn take_applicable(&mut self, now_us: u64) -> Option<Recommendation> {
        let rec = self.pending.take()?;
        let age = now_us.saturating_sub(rec.issued_at_us);
        if age > self.staleness_us {
            self.discarded += 1;
            tracing::debug!(age_us = age, "recommendation stale, discarded");
            return None;
        }
        self.applied += 1;
        Some(rec)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(confidence: f64, issued_at_us: u64) -> Recommendation {
        Recommendation {
            version: PROTOCOL_VERSION,
            deltas: ParamDeltas {
                hold_pressure_bar: Some(5.0),
                ..ParamDeltas::default()
            },
            predicted_improvement: 0.1,
            confidence,
            issued_at_us,
        }
    }

    #[test]
    fn low_confidence_discarded_at_offer() {
        let mut gate = RecommendationGate::new(0.70, 1_000_000);
        gate.offer(rec(0.60, 0));
        assert!(!gate.has_pending());
        assert_eq!(gate.discarded, 1);
        assert_eq!(gate.take_applicable(0), None);
    }

    #[test]
    fn eligible_result_buffers_until_taken() {
        let mut gate = RecommendationGate::new(0.70, 1_000_000);
        gate.offer(rec(0.85, 100));
        assert!(gate.has_pending());
        let taken = gate.take_applicable(500_000).unwrap();
        assert_eq!(taken.confidence, 0.85);
        assert!(!gate.has_pending());
    }

    #[test]
    fn staleness_judged_at_application_time() {
        let mut gate = RecommendationGate::new(0.70, 1_000_000);
        gate.offer(rec(0.9, 0));
        // Aged past the bound while the machine was mid-cycle.
        assert_eq!(gate.take_applicable(2_000_000), None);
        assert_eq!(gate.discarded, 1);
    }

    #[test]
    fn newest_pending_wins() {
        let mut gate = RecommendationGate::new(0.5, u64::MAX);
        gate.offer(rec(0.6, 10));
        gate.offer(rec(0.8, 20));
        let taken = gate.take_applicable(30).unwrap();
        assert_eq!(taken.issued_at_us, 20);
    }

    #[test]
    fn version_mismatch_discarded() {
        let mut gate = RecommendationGate::new(0.0, u64::MAX);
        let mut bad = rec(0.9, 0);
        bad.version = PROTOCOL_VERSION + 1;
        gate.offer(bad);
        assert!(!gate.has_pending());
    }

    #[test]
    fn client_tolerates_missing_peer() {
        let (tx, _rx_keep) = xch::bounded::<Submission>(1);
        let (rec_tx, rec_rx) = xch::bounded::<Recommendation>(1);
        drop(rec_tx);
        let client = OptimizerClient::from_channels(tx, rec_rx);
        client.submit(Submission {
            version: PROTOCOL_VERSION,
            cycle_index: 1,
            submitted_at_us: 0,
            features: BTreeMap::new(),
            spc: BTreeMap::new(),
            quality: QualitySummary {
                score: 90.0,
                class: "good",
                rejected: false,
                predicted_weight_g: 24.0,
            },
        });
        // Channel full: second submit drops silently.
        client.submit(Submission {
            version: PROTOCOL_VERSION,
            cycle_index: 2,
            submitted_at_us: 0,
            features: BTreeMap::new(),
            spc: BTreeMap::new(),
            quality: QualitySummary {
                score: 90.0,
                class: "good",
                rejected: false,
                predicted_weight_g: 24.0,
            },
        });
        assert_eq!(client.poll(), None);
    }

    #[test]
    fn advisor_round_trip() {
        let (client, _handle) = spawn_advisor(|s: &Submission| {
            Some(Recommendation {
                version: PROTOCOL_VERSION,
                deltas: ParamDeltas::default(),
                predicted_improvement: 0.0,
                confidence: 0.9,
                issued_at_us: s.cycle_index,
            })
        });
        client.submit(Submission {
            version: PROTOCOL_VERSION,
            cycle_index: 7,
            submitted_at_us: 0,
            features: BTreeMap::new(),
            spc: BTreeMap::new(),
            quality: QualitySummary {
                score: 90.0,
                class: "good",
                rejected: false,
                predicted_weight_g: 24.0,
            },
        });
        // Poll until the advisor thread answers.
        let mut got = None;
        for _ in 0..200 {
            if let Some(r) = client.poll() {
                got = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got.unwrap().issued_at_us, 7);
    }
}
