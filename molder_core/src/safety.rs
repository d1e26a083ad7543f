//! Safety interlocks: evaluated every tick, before anything else touches
//! the frame, with override authority over all other components.
//!
//! Flags latch on trip and can only clear through an explicit reset, and
//! only once the underlying condition itself reads clear. There is no way
//! to force-clear a flag.

use crate::error::FaultCause;
use crate::util::to_cbar;
use molder_traits::{SensorFrame, ZONE_COUNT};

/// Absolute machine-protection ceilings, independent of any recipe.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    pub max_cavity_bar: f32,
    pub max_zone_c: [f32; ZONE_COUNT],
    pub max_clamp_kn: f32,
    /// Consecutive asserted polls required to latch the e-stop input.
    pub estop_debounce_n: u8,
    /// Consecutive stale/invalid frames tolerated in a critical phase.
    pub stale_frame_ticks: u32,
}

impl Default for SafetyLimits {
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

/// Latched interlock flags. Any true flag forces `Fault` within the tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyState {
    pub estop: bool,
    pub gate_open: bool,
    pub over_temp: bool,
    pub over_pressure: bool,
    pub over_force: bool,
}

impl SafetyState {
    pub fn tripped(&self) -> bool {
        self.estop || self.gate_open || self.over_temp || self.over_pressure || self.over_force
    }

    /// First tripped flag, for fault reporting.
    pub fn cause(&self) -> Option<FaultCause> {
        if self.estop {
            Some(FaultCause::Estop)
        } else if self.gate_open {
            Some(FaultCause::GateOpen)
        } else if self.over_temp {
            Some(FaultCause::OverTemperature)
        } else if self.over_pressure {
            Some(FaultCause::OverPressure)
        } else if self.over_force {
            Some(FaultCause::OverForce)
        } else {
            None
        }
    }
}

pub struct SafetyMonitor {
    limits: SafetyLimits,
    state: SafetyState,
    estop_count: u8,
    /// Remote emergency-stop command, latched like the hardware input.
    remote_estop: bool,
    max_cavity_cbar: i32,
}

impl SafetyMonitor {
    pub fn new(limits: SafetyLimits) -> Self {
        let max_cavity_cbar = to_cbar(limits.max_cavity_bar);
        Self {
            limits,
            state: SafetyState::default(),
            estop_count: 0,
            remote_estop: false,
            max_cavity_cbar,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Latch an operator/remote emergency stop. Takes effect on the next
    /// evaluation, clears only through `try_reset`.
    pub fn command_estop(&mut self) {
        self.remote_estop = true;
    }

    /// Evaluate all interlock conditions against a frame. Returns the
    /// latched state after evaluation; the caller compares against the
    /// previous tick to detect a false-to-true transition.
    pub fn evaluate(&mut self, frame: &SensorFrame) -> SafetyState {
        // Debounced hardware e-stop; the remote command latches instantly.
        if frame.estop {
            self.estop_count = self.estop_count.saturating_add(1);
            if self.estop_count >= self.limits.estop_debounce_n {
                self.state.estop = true;
            }
        } else {
            self.estop_count = 0;
        }
        if self.remote_estop {
            self.state.estop = true;
        }

        if frame.gate_open {
            self.state.gate_open = true;
        }
        for zone in 0..ZONE_COUNT {
            if frame.zone_c(zone) > self.limits.max_zone_c[zone] {
                self.state.over_temp = true;
            }
        }
        if frame
            .cavity_bar
            .iter()
            .any(|&p| to_cbar(p) > self.max_cavity_cbar)
        {
            self.state.over_pressure = true;
        }
        if frame.clamp_kn > self.limits.max_clamp_kn {
            self.state.over_force = true;
        }
        self.state
    }

    /// True if every underlying condition currently reads clear.
    fn conditions_clear(&self, frame: &SensorFrame) -> bool {
        !frame.estop
            && !self.remote_estop
            && !frame.gate_open
            && (0..ZONE_COUNT).all(|z| frame.zone_c(z) <= self.limits.max_zone_c[z])
            && frame
                .cavity_bar
                .iter()
                .all(|&p| to_cbar(p) <= self.max_cavity_cbar)
            && frame.clamp_kn <= self.limits.max_clamp_kn
    }

    /// Explicit reset request. A no-op returning false while any raw
    /// condition still holds; on success all latches and counters clear.
    pub fn try_reset(&mut self, frame: &SensorFrame) -> bool {
        // The reset request itself releases the remote latch; the hardware
        // input and every analog condition must read clear on their own.
        self.remote_estop = false;
        if !self.conditions_clear(frame) {
            return false;
        }
        self.state = SafetyState::default();
        self.estop_count = 0;
        true
    }
}
