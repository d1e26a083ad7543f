//! Simulated molding machine: first-order fill, packing, gate-seal and
//! thermal dynamics behind the standard sensor/actuator traits.
//!
//! The sensor and actuator halves share one state cell; physics advances
//! one tick per `apply` call, so simulated time follows the control loop
//! exactly and a full production run is deterministic under a test clock.

pub mod error;

use error::SimError;
use molder_traits::{
    Actuators, CAVITY_COUNT, DutyCommand, SensorFrame, SensorSuite, ZONE_COUNT,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plant constants. Defaults describe a small electric press.
#[derive(Debug, Clone, Copy)]
pub struct SimCfg {
    /// Physics step per actuator apply (s); match the control period.
    pub dt_s: f32,
    /// Screw velocity at 100 % injection duty (mm/s).
    pub max_velocity_mm_s: f32,
    /// Stroke at which the cavity is volumetrically full (mm).
    pub fill_stroke_mm: f32,
    /// Cavity pressure at 100 % pack duty, steady state (bar).
    pub pack_gain_bar: f32,
    /// Pressure response time constant (s).
    pub pressure_tau_s: f32,
    /// Cumulative pack time after which the gate freezes (ms).
    pub seal_after_ms: f32,
    /// Per-tick fractional pressure decay once sealed.
    pub seal_decay: f32,
    /// Clamp force at 100 % clamp duty (kN).
    pub clamp_gain_kn: f32,
    /// Screw retract speed at 100 % back-pressure duty (mm/s).
    pub retract_mm_s: f32,
    /// Zone heat-up rate at 100 % heater duty (C/s).
    pub heat_rate_c_s: f32,
    /// Passive cooling coefficient toward ambient (1/s).
    pub loss_coeff: f32,
    pub ambient_c: f32,
    /// Per-channel cavity spread amplitude (fraction of average).
    pub cavity_spread: f32,
}

impl Default for SimCfg {
    fn default() -> Self {
        Self {
            dt_s: 0.001,
            max_velocity_mm_s: 120.0,
            fill_stroke_mm: 30.0,
            pack_gain_bar: 620.0,
            pressure_tau_s: 0.05,
            seal_after_ms: 1800.0,
            seal_decay: 0.05,
            clamp_gain_kn: 900.0,
            retract_mm_s: 60.0,
            heat_rate_c_s: 3.6,
            loss_coeff: 0.01,
            ambient_c: 23.0,
            cavity_spread: 0.01,
        }
    }
}

#[derive(Debug)]
struct SimState {
    cfg: SimCfg,
    position_mm: f32,
    velocity_mm_s: f32,
    cavity_avg_bar: f32,
    zone_c: [f32; ZONE_COUNT],
    clamp_kn: f32,
    sealed: bool,
    pack_accum_ms: f32,
    sim_time_us: u64,
    // xorshift state for the deterministic channel spread
    rng: u32,
    // test fault injection
    estop: bool,
    gate_open: bool,
    fail_reads: u32,
    last_cmd: DutyCommand,
}

impl SimState {
    fn step(&mut self, cmd: &DutyCommand) {
        let dt = self.cfg.dt_s;
        self.last_cmd = *cmd;
        self.sim_time_us = self.sim_time_us.saturating_add((dt * 1e6) as u64);

        // Clamp: first-order toward commanded force.
        let clamp_target = cmd.clamp_pct / 100.0 * self.cfg.clamp_gain_kn;
        self.clamp_kn += (clamp_target - self.clamp_kn) * (dt / 0.1).min(1.0);

        // Screw motion: injection drives forward, back pressure retracts.
        let v_target = cmd.injection_pct / 100.0 * self.cfg.max_velocity_mm_s;
        self.velocity_mm_s += (v_target - self.velocity_mm_s) * (dt / 0.02).min(1.0);
        self.position_mm += self.velocity_mm_s * dt;
        if cmd.back_pressure_pct > 0.0 {
            self.position_mm -= cmd.back_pressure_pct / 100.0 * self.cfg.retract_mm_s * dt;
            self.velocity_mm_s = 0.0;
        }
        self.position_mm = self.position_mm.clamp(0.0, self.cfg.fill_stroke_mm * 1.2);

        // Cavity pressure: fill fraction under injection, valve-driven
        // while packing, frozen-gate decay after seal, fast vent dump.
        let fill_frac = (self.position_mm / self.cfg.fill_stroke_mm).clamp(0.0, 1.0);
        if cmd.vent {
            self.cavity_avg_bar *= 0.5;
        } else if self.sealed {
            self.cavity_avg_bar *= 1.0 - self.cfg.seal_decay;
        } else if cmd.pack_pct > 0.0 {
            self.pack_accum_ms += dt * 1000.0;
            if self.pack_accum_ms >= self.cfg.seal_after_ms {
                self.sealed = true;
                tracing::debug!(t_us = self.sim_time_us, "gate frozen");
            }
            let target = cmd.pack_pct / 100.0 * self.cfg.pack_gain_bar;
            self.cavity_avg_bar +=
                (target - self.cavity_avg_bar) * (dt / self.cfg.pressure_tau_s).min(1.0);
        } else if cmd.injection_pct > 0.0 {
            let target = fill_frac * fill_frac * 350.0 * (cmd.injection_pct / 100.0);
            self.cavity_avg_bar +=
                (target - self.cavity_avg_bar) * (dt / self.cfg.pressure_tau_s).min(1.0);
        } else {
            self.cavity_avg_bar *= 0.98;
        }

        // A fresh shot un-freezes the model for the next cycle.
        if self.position_mm <= 1.0 && self.sealed {
            self.sealed = false;
            self.pack_accum_ms = 0.0;
        }

        // Zone thermals: heater input against passive loss.
        for z in 0..ZONE_COUNT {
            let heat = cmd.heater_pct[z] / 100.0 * self.cfg.heat_rate_c_s;
            let loss = self.cfg.loss_coeff * (self.zone_c[z] - self.cfg.ambient_c);
            self.zone_c[z] += (heat - loss) * dt;
        }
    }

    fn next_noise(&mut self) -> f32 {
        // xorshift32; deterministic spread, zero mean
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }

    fn frame(&mut self) -> SensorFrame {
        let mut cavity = [0.0f32; CAVITY_COUNT];
        for slot in cavity.iter_mut() {
            let spread = self.next_noise() * self.cfg.cavity_spread;
            *slot = (self.cavity_avg_bar * (1.0 + spread)).max(0.0);
        }
        SensorFrame {
            cavity_bar: cavity,
            barrel_c: [self.zone_c[0], self.zone_c[1], self.zone_c[2]],
            nozzle_c: self.zone_c[3],
            mold_c: self.zone_c[4],
            ambient_c: self.cfg.ambient_c,
            position_mm: self.position_mm,
            velocity_mm_s: self.velocity_mm_s,
            clamp_kn: self.clamp_kn,
            estop: self.estop,
            gate_open: self.gate_open,
            valid: true,
            timestamp_us: self.sim_time_us,
        }
    }
}

/// One simulated machine; hand out sensor/actuator halves and a test
/// handle as needed.
pub struct MachineSim {
    state: Arc<Mutex<SimState>>,
}

impl MachineSim {
    pub fn new(cfg: SimCfg) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                cfg,
                position_mm: 0.0,
                velocity_mm_s: 0.0,
                cavity_avg_bar: 0.0,
                zone_c: [cfg.ambient_c; ZONE_COUNT],
                clamp_kn: 0.0,
                sealed: false,
                pack_accum_ms: 0.0,
                sim_time_us: 0,
                rng: 0x9E37_79B9,
                estop: false,
                gate_open: false,
                fail_reads: 0,
                last_cmd: DutyCommand::idle(),
            })),
        }
    }

    /// Start with every zone already at its setpoint, skipping the long
    /// heat-up ramp.
    pub fn preheated(cfg: SimCfg, zone_c: [f32; ZONE_COUNT]) -> Self {
        let sim = Self::new(cfg);
        if let Ok(mut s) = sim.state.lock() {
            s.zone_c = zone_c;
        }
        sim
    }

    pub fn sensors(&self) -> SimSensors {
        SimSensors {
            state: self.state.clone(),
        }
    }

    pub fn actuators(&self) -> SimActuators {
        SimActuators {
            state: self.state.clone(),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for MachineSim {
    fn default() -> Self {
        Self::new(SimCfg::default())
    }
}

/// Sensor half: never blocks, returns the current state as one frame.
pub struct SimSensors {
    state: Arc<Mutex<SimState>>,
}

impl SensorSuite for SimSensors {
    fn read(
        &mut self,
        _timeout: Duration,
    ) -> Result<SensorFrame, Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| SimError::Timeout)?;
        if s.fail_reads > 0 {
            s.fail_reads -= 1;
            return Err(Box::new(SimError::InjectedFault));
        }
        Ok(s.frame())
    }
}

/// Actuator half: each applied command advances the plant one step.
pub struct SimActuators {
    state: Arc<Mutex<SimState>>,
}

impl Actuators for SimActuators {
    fn apply(
        &mut self,
        cmd: &DutyCommand,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| SimError::ActuatorOffline)?;
        s.step(cmd);
        Ok(())
    }

    fn all_stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| SimError::ActuatorOffline)?;
        let relieve = DutyCommand::relieve();
        s.step(&relieve);
        Ok(())
    }
}

/// Test/demo control: fault injection and state inspection.
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn set_estop(&self, pressed: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.estop = pressed;
        }
    }

    pub fn set_gate_open(&self, open: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.gate_open = open;
        }
    }

    /// Make the next `n` sensor reads fail.
    pub fn fail_reads(&self, n: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_reads = n;
        }
    }

    pub fn position_mm(&self) -> f32 {
        self.state.lock().map(|s| s.position_mm).unwrap_or(0.0)
    }

    pub fn cavity_avg_bar(&self) -> f32 {
        self.state.lock().map(|s| s.cavity_avg_bar).unwrap_or(0.0)
    }

    pub fn last_cmd(&self) -> DutyCommand {
        self.state
            .lock()
            .map(|s| s.last_cmd)
            .unwrap_or(DutyCommand::idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_duty_moves_the_screw() {
        let sim = MachineSim::default();
        let mut act = sim.actuators();
        let mut sen = sim.sensors();
        let cmd = DutyCommand {
            injection_pct: 50.0,
            ..DutyCommand::idle()
        };
        for _ in 0..500 {
            act.apply(&cmd).unwrap();
        }
        let frame = sen.read(Duration::from_millis(1)).unwrap();
        assert!(frame.position_mm > 5.0, "screw moved: {}", frame.position_mm);
        assert!(frame.velocity_mm_s > 30.0);
    }

    #[test]
    fn pack_duty_builds_then_seals_then_decays() {
        let sim = MachineSim::new(SimCfg {
            seal_after_ms: 100.0,
            ..SimCfg::default()
        });
        let mut act = sim.actuators();
        let cmd = DutyCommand {
            pack_pct: 80.0,
            ..DutyCommand::idle()
        };
        for _ in 0..100 {
            act.apply(&cmd).unwrap();
        }
        let before = sim.handle().cavity_avg_bar();
        assert!(before > 100.0);
        // Sealed now: pressure decays tick over tick.
        act.apply(&cmd).unwrap();
        let after = sim.handle().cavity_avg_bar();
        assert!(after < before);
    }

    #[test]
    fn injected_read_failures_then_recover() {
        let sim = MachineSim::default();
        let mut sen = sim.sensors();
        sim.handle().fail_reads(2);
        assert!(sen.read(Duration::from_millis(1)).is_err());
        assert!(sen.read(Duration::from_millis(1)).is_err());
        assert!(sen.read(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn heaters_warm_their_zone() {
        let sim = MachineSim::default();
        let mut act = sim.actuators();
        let mut sen = sim.sensors();
        let mut cmd = DutyCommand::idle();
        cmd.heater_pct[0] = 100.0;
        for _ in 0..5000 {
            act.apply(&cmd).unwrap();
        }
        let frame = sen.read(Duration::from_millis(1)).unwrap();
        assert!(frame.barrel_c[0] > 35.0);
        assert!((frame.barrel_c[1] - 23.0).abs() < 2.0, "unheated zone stays cold");
    }
}
