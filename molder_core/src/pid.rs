//! Explicit PID control loop with no hidden aliasing.
//!
//! One instance per controlled channel; the caller owns the instance and
//! passes setpoint/reading each update, so there is no shared global state
//! between loops.

/// Gains and output limits for one loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Integrator magnitude clamp in output units (anti-windup).
    pub integral_limit: f32,
    pub output_min: f32,
    pub output_max: f32,
}

impl PidGains {
    /// Duty-output gains: output clamped to [0, 100] %.
    pub fn duty(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral_limit: 100.0,
            output_min: 0.0,
            output_max: 100.0,
        }
    }
}

/// Integrator and derivative state for one loop.
#[derive(Debug, Clone)]
pub struct PidLoop {
    gains: PidGains,
    integral: f32,
    last_error: Option<f32>,
}

impl PidLoop {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: None,
        }
    }

    /// One update. `dt_s` must be > 0; non-positive or non-finite dt
    /// degrades to a pure proportional response for this step.
    pub fn update(&mut self, setpoint: f32, reading: f32, dt_s: f32) -> f32 {
        let g = self.gains;
        let error = setpoint - reading;
        if !error.is_finite() {
            return g.output_min;
        }

        let dt_ok = dt_s.is_finite() && dt_s > 0.0;
        if dt_ok {
            self.integral = (self.integral + error * g.ki * dt_s)
                .clamp(-g.integral_limit, g.integral_limit);
        }
        let derivative = match (self.last_error, dt_ok) {
            (Some(prev), true) => (error - prev) / dt_s,
            _ => 0.0,
        };
        self.last_error = Some(error);

        (g.kp * error + self.integral + g.kd * derivative).clamp(g.output_min, g.output_max)
    }

    /// Clear integrator and derivative memory (phase entry, fault reset).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}
