//! TOML schema parsing and validation behavior.

use molder_config::{Config, load_toml, validate};
use rstest::rstest;

const GOOD: &str = r#"
[process]
velocity_stages = [[30.0, 10.0], [60.0, 30.0]]
transfer_position_mm = 30.0
pack_stages = [
    { pressure_bar = 450.0, duration_ms = 1500 },
    { pressure_bar = 380.0, duration_ms = 1000 },
]
hold_pressure_bar = 320.0
hold_ms = 1500
zone_setpoints_c = [205.0, 215.0, 225.0, 230.0, 45.0]
cooling_ms = 8000
target_weight_g = 24.0
weight_tol_g = 0.5
pressure_ceiling_bar = 600.0
gate_seal_drop = 0.04
plasticize_back_pressure_pct = 25.0
shot_ready_mm = 0.5

[timing]
control_hz = 1000
thermal_hz = 5

[spc]
window = 50

[spc.limits]
peak_pressure = [620.0, 380.0]
predicted_weight = [24.6, 23.4]

[optimizer]
min_confidence = 0.7
staleness_ms = 60000
"#;

#[test]
fn good_config_parses_and_validates() {
    let cfg = load_toml(GOOD).expect("parse");
    validate(&cfg).expect("validate");
    assert_eq!(cfg.process.velocity_stages.len(), 2);
    assert_eq!(cfg.process.velocity_stages[1].velocity_mm_s, 60.0);
    assert_eq!(cfg.process.pack_stages[0].duration_ms, 1500);
    assert_eq!(cfg.spc.limits["peak_pressure"], (620.0, 380.0));
    assert_eq!(cfg.optimizer.staleness_ms, 60_000);
}

#[test]
fn stage_lists_accept_pairs_and_tables() {
    let toml = r#"
[process]
velocity_stages = [
    { velocity_mm_s = 20.0, until_position_mm = 8.0 },
    [55.0, 28.0],
]
transfer_position_mm = 28.0
pack_stages = [[400.0, 2000]]
"#;
    let cfg = load_toml(toml).expect("parse");
    assert_eq!(cfg.process.velocity_stages.len(), 2);
    assert_eq!(cfg.process.velocity_stages[0].until_position_mm, 8.0);
    assert_eq!(cfg.process.velocity_stages[1].velocity_mm_s, 55.0);
    assert_eq!(cfg.process.pack_stages[0].pressure_bar, 400.0);
}

#[test]
fn defaults_validate() {
    validate(&Config::default()).expect("default config must be valid");
}

#[rstest]
#[case::unordered_stages("velocity_stages = [[30.0, 20.0], [60.0, 10.0]]\ntransfer_position_mm = 10.0")]
#[case::empty_stages("velocity_stages = []")]
#[case::zero_velocity("velocity_stages = [[0.0, 10.0]]\ntransfer_position_mm = 10.0")]
#[case::transfer_beyond_final("transfer_position_mm = 99.0")]
#[case::seal_out_of_range("gate_seal_drop = 1.5")]
#[case::zero_tolerance("weight_tol_g = 0.0")]
fn bad_process_values_fail_validation(#[case] body: &str) {
    let toml = format!("[process]\n{body}\n");
    let cfg = load_toml(&toml).expect("parse should succeed, validation should not");
    assert!(validate(&cfg).is_err(), "expected rejection for: {body}");
}

#[test]
fn ceiling_above_machine_limit_rejected() {
    let toml = r#"
[process]
pressure_ceiling_bar = 900.0

[safety]
max_cavity_bar = 800.0
"#;
    let cfg = load_toml(toml).expect("parse");
    assert!(validate(&cfg).is_err());
}

#[test]
fn setpoint_at_zone_ceiling_rejected() {
    let toml = r#"
[process]
zone_setpoints_c = [205.0, 215.0, 280.0, 230.0, 45.0]
"#;
    let cfg = load_toml(toml).expect("parse");
    assert!(validate(&cfg).is_err());
}

#[test]
fn thermal_rate_cannot_exceed_control_rate() {
    let toml = r#"
[timing]
control_hz = 100
thermal_hz = 200
"#;
    let cfg = load_toml(toml).expect("parse");
    assert!(validate(&cfg).is_err());
}

#[test]
fn inverted_spc_limits_rejected() {
    let toml = r#"
[spc.limits]
cycle_time = [10.0, 30.0]
"#;
    let cfg = load_toml(toml).expect("parse");
    assert!(validate(&cfg).is_err());
}
