//! Background sensor acquisition.
//!
//! Spawns a thread that owns the `SensorSuite`, pushes the latest frame
//! via a bounded channel, and tracks the last-ok timestamp for watchdog
//! logic. The control loop stays non-blocking: it consumes `latest()`
//! and judges staleness itself.
//!
//! Safety: each `FrameFeed` spawns exactly one thread that is shut down
//! when the feed is dropped, preventing thread leaks.
use crossbeam_channel as xch;
use molder_traits::clock::Clock;
use molder_traits::{SensorFrame, SensorSuite};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct FrameFeed {
    rx: xch::Receiver<SensorFrame>,
    last_ok: Arc<AtomicU64>,
    epoch: Instant,
    /// Shutdown flag for immediate response (atomic for lock-free check)
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl FrameFeed {
    /// Rate-paced acquisition at `hz`.
    pub fn spawn<S: SensorSuite + Send + 'static, C: Clock + Send + Sync + 'static>(
        mut sensors: S,
        hz: u32,
        timeout: Duration,
        clock: C,
    ) -> Self {
        let (tx, rx) = xch::bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let last_ok = Arc::new(AtomicU64::new(0));
        let last_ok_clone = last_ok.clone();
        let period = Duration::from_micros(crate::util::period_us(hz));
        let epoch = clock.now();

        let join_handle = std::thread::spawn(move || {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    tracing::debug!("frame feed received shutdown signal");
                    break;
                }

                match sensors.read(timeout) {
                    Ok(frame) => {
                        if frame.valid {
                            let now = clock.us_since(epoch);
                            last_ok_clone.store(now, Ordering::Relaxed);
                        }
                        // Never block on a slow consumer: a full slot just
                        // drops this frame, a gone consumer ends the thread.
                        match tx.try_send(frame) {
                            Ok(()) | Err(xch::TrySendError::Full(_)) => {}
                            Err(xch::TrySendError::Disconnected(_)) => {
                                tracing::debug!("frame feed consumer disconnected, exiting");
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        // Transient acquisition error: the controller's
                        // stale-frame bound is the watchdog.
                    }
                }

                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }
                clock.sleep(period);
            }
            tracing::trace!("frame feed exiting cleanly");
        });

        Self {
            rx,
            last_ok,
            epoch,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    /// Freshest frame produced since the last call, if any.
    pub fn latest(&self) -> Option<SensorFrame> {
        self.rx.try_iter().last()
    }

    /// Microseconds since the last valid acquisition, per the caller's
    /// notion of "now" on this feed's epoch.
    pub fn stalled_for(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.last_ok.load(Ordering::Relaxed))
    }

    /// Convenience: stall time using a real monotonic clock.
    pub fn stalled_for_now(&self) -> u64 {
        let now_us = {
            let dur = Instant::now().saturating_duration_since(self.epoch);
            dur.as_micros().min(u128::from(u64::MAX)) as u64
        };
        self.stalled_for(now_us)
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // The thread exits between reads, after the in-flight read's
        // timeout at worst.
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("frame feed thread joined"),
                Err(e) => tracing::warn!(?e, "frame feed thread panicked during shutdown"),
            }
        }
    }
}
