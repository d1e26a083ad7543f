//! Test and helper mocks for molder_core

use molder_traits::{Actuators, DutyCommand, SensorFrame, SensorSuite};
use std::sync::{Arc, Mutex};

/// A sensor suite that always errors on read; useful when driving the
/// machine with externally acquired frames via `step_from_frame`.
pub struct NoopSensors;

impl SensorSuite for NoopSensors {
    fn read(
        &mut self,
        _timeout: std::time::Duration,
    ) -> Result<SensorFrame, Box<dyn std::error::Error + Send + Sync>> {
        Err(Box::new(std::io::Error::other("noop sensors")))
    }
}

/// Replays a prepared frame sequence, then repeats the final frame.
pub struct ScriptedSensors {
    frames: Vec<SensorFrame>,
    idx: usize,
}

impl ScriptedSensors {
    pub fn new(frames: Vec<SensorFrame>) -> Self {
        Self { frames, idx: 0 }
    }
}

impl SensorSuite for ScriptedSensors {
    fn read(
        &mut self,
        _timeout: std::time::Duration,
    ) -> Result<SensorFrame, Box<dyn std::error::Error + Send + Sync>> {
        if self.frames.is_empty() {
            return Err(Box::new(std::io::Error::other("script empty")));
        }
        let i = self.idx.min(self.frames.len() - 1);
        self.idx = self.idx.saturating_add(1);
        Ok(self.frames[i])
    }
}

/// Records every applied command; shareable with the test body.
#[derive(Clone, Default)]
pub struct SpyActuators {
    pub applied: Arc<Mutex<Vec<DutyCommand>>>,
    pub stops: Arc<Mutex<u32>>,
}

impl SpyActuators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<DutyCommand> {
        self.applied.lock().ok().and_then(|v| v.last().copied())
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.lock().map(|n| *n).unwrap_or(0)
    }
}

impl Actuators for SpyActuators {
    fn apply(
        &mut self,
        cmd: &DutyCommand,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Ok(mut v) = self.applied.lock() {
            v.push(*cmd);
        }
        Ok(())
    }

    fn all_stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Ok(mut n) = self.stops.lock() {
            *n += 1;
        }
        if let Ok(mut v) = self.applied.lock() {
            v.push(DutyCommand::relieve());
        }
        Ok(())
    }
}
