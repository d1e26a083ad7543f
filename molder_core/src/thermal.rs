//! Zone temperature regulation: one independent PID loop per thermal
//! zone, running on its own period, active in every phase except Fault.

use crate::pid::{PidGains, PidLoop};
use molder_traits::{SensorFrame, ZONE_COUNT};

/// Per-zone regulation settings.
#[derive(Debug, Clone)]
pub struct ThermalCfg {
    pub tolerance_c: [f32; ZONE_COUNT],
    /// Zones must hold inside tolerance this long before "ready" (ms).
    pub ready_hold_ms: u64,
    /// (kp, ki, kd) per zone.
    pub gains: [(f32, f32, f32); ZONE_COUNT],
}

impl Default for ThermalCfg {
    fn default() -> Self {
        Self {
            tolerance_c: [5.0, 5.0, 5.0, 5.0, 3.0],
            ready_hold_ms: 2000,
            gains: [
                (20.0, 0.2, 0.0),
                (20.0, 0.2, 0.0),
                (20.0, 0.2, 0.0),
                (20.0, 0.2, 0.0),
                (10.0, 0.1, 0.0),
            ],
        }
    }
}

pub struct ZoneRegulator {
    cfg: ThermalCfg,
    loops: [PidLoop; ZONE_COUNT],
    /// Absolute ceilings, mirrored from the safety limits so an
    /// over-ceiling zone is zeroed in the same compute call that would
    /// otherwise drive it.
    ceilings_c: [f32; ZONE_COUNT],
    /// Since when every zone has been inside tolerance (ms timestamp).
    in_band_since_ms: Option<u64>,
    last_update_ms: Option<u64>,
    ready: bool,
}

impl ZoneRegulator {
    pub fn new(cfg: ThermalCfg, ceilings_c: [f32; ZONE_COUNT]) -> Self {
        let loops = cfg
            .gains
            .map(|(kp, ki, kd)| PidLoop::new(PidGains::duty(kp, ki, kd)));
        Self {
            cfg,
            loops,
            ceilings_c,
            in_band_since_ms: None,
            last_update_ms: None,
            ready: false,
        }
    }

    /// One regulation pass. Returns heater duties in [0, 100] per zone;
    /// zones at or above their absolute ceiling get zero duty.
    pub fn compute(
        &mut self,
        setpoints_c: &[f32; ZONE_COUNT],
        frame: &SensorFrame,
        now_ms: u64,
    ) -> [f32; ZONE_COUNT] {
        let dt_s = match self.last_update_ms {
            Some(prev) => (now_ms.saturating_sub(prev)) as f32 / 1000.0,
            None => 0.0,
        };
        self.last_update_ms = Some(now_ms);

        let mut duties = [0.0f32; ZONE_COUNT];
        let mut all_in_band = true;
        for zone in 0..ZONE_COUNT {
            let reading = frame.zone_c(zone);
            if reading >= self.ceilings_c[zone] {
                self.loops[zone].reset();
                duties[zone] = 0.0;
            } else {
                duties[zone] = self.loops[zone].update(setpoints_c[zone], reading, dt_s);
            }
            if (reading - setpoints_c[zone]).abs() > self.cfg.tolerance_c[zone] {
                all_in_band = false;
            }
        }

        // Sustained-window readiness: in band continuously for ready_hold_ms.
        if all_in_band {
            let since = *self.in_band_since_ms.get_or_insert(now_ms);
            self.ready = now_ms.saturating_sub(since) >= self.cfg.ready_hold_ms;
        } else {
            self.in_band_since_ms = None;
            self.ready = false;
        }
        duties
    }

    /// Every zone inside tolerance for the sustained interval. Gates the
    /// Idle -> ClampClose transition.
    pub fn all_ready(&self) -> bool {
        self.ready
    }

    /// Clear loop state and readiness (fault entry/reset).
    pub fn reset(&mut self) {
        for l in &mut self.loops {
            l.reset();
        }
        self.in_band_since_ms = None;
        self.last_update_ms = None;
        self.ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(temps: [f32; ZONE_COUNT]) -> SensorFrame {
        SensorFrame {
            barrel_c: [temps[0], temps[1], temps[2]],
            nozzle_c: temps[3],
            mold_c: temps[4],
            valid: true,
            ..SensorFrame::empty()
        }
    }

    const SETPOINTS: [f32; ZONE_COUNT] = [205.0, 215.0, 225.0, 230.0, 45.0];

    #[test]
    fn cold_zones_drive_heaters_hard() {
        let mut reg = ZoneRegulator::new(ThermalCfg::default(), [280.0, 280.0, 280.0, 290.0, 90.0]);
        let duties = reg.compute(&SETPOINTS, &frame_at([20.0; ZONE_COUNT]), 0);
        assert!(duties.iter().all(|&d| d == 100.0));
        assert!(!reg.all_ready());
    }

    #[test]
    fn ready_requires_sustained_window() {
        let cfg = ThermalCfg {
            ready_hold_ms: 1000,
            ..ThermalCfg::default()
        };
        let mut reg = ZoneRegulator::new(cfg, [280.0, 280.0, 280.0, 290.0, 90.0]);
        let at_temp = frame_at(SETPOINTS);
        reg.compute(&SETPOINTS, &at_temp, 0);
        assert!(!reg.all_ready());
        reg.compute(&SETPOINTS, &at_temp, 500);
        assert!(!reg.all_ready());
        reg.compute(&SETPOINTS, &at_temp, 1000);
        assert!(reg.all_ready());

        // Excursion resets the window.
        let mut hot = SETPOINTS;
        hot[1] += 20.0;
        reg.compute(&SETPOINTS, &frame_at(hot), 1200);
        assert!(!reg.all_ready());
        reg.compute(&SETPOINTS, &at_temp, 1400);
        assert!(!reg.all_ready());
    }

    #[test]
    fn zone_over_ceiling_gets_zero_duty() {
        let mut reg = ZoneRegulator::new(ThermalCfg::default(), [280.0, 280.0, 280.0, 290.0, 90.0]);
        let mut temps = [20.0; ZONE_COUNT];
        temps[2] = 285.0; // over the 280 C barrel ceiling
        let duties = reg.compute(&SETPOINTS, &frame_at(temps), 0);
        assert_eq!(duties[2], 0.0);
        assert_eq!(duties[0], 100.0);
    }
}
