#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core molding-cycle control logic (hardware-agnostic).
//!
//! This crate provides the hardware-independent process controller. All
//! hardware interactions go through the `molder_traits::SensorSuite` and
//! `molder_traits::Actuators` traits.
//!
//! ## Architecture
//!
//! - **Safety**: latched interlocks with override authority (`safety`)
//! - **Phases**: deadline-driven cycle state machine (`phase`)
//! - **Control**: explicit PID loops for motion and heat (`pid`, `thermal`)
//! - **Quality**: per-cycle prediction and accept/reject (`quality`)
//! - **SPC**: rolling control charts per metric (`spc`)
//! - **Optimizer**: asynchronous advisory link with gating (`optimizer`)
//! - **Machine**: one façade instance owning all of the above (`machine`)
//!
//! ## Fixed-Point Hot Path
//!
//! The 1 kHz tick compares positions and pressures as quantized `i32`
//! (micrometers, centibar) with saturating arithmetic, so phase
//! thresholds are deterministic across platforms. See `util::to_cbar`
//! and `util::to_um`.

pub mod convert;
pub mod cycle;
pub mod error;
pub mod feed;
pub mod machine;
pub mod mocks;
pub mod optimizer;
pub mod params;
pub mod phase;
pub mod pid;
pub mod quality;
pub mod runner;
pub mod safety;
pub mod sink;
pub mod spc;
pub mod thermal;
pub mod util;

pub use cycle::{CycleHistory, CycleRecord};
pub use error::{BuildError, ControlError, FaultCause, Result};
pub use machine::{Command, Machine, MachineBuilder, MachineStatus, Missing};
pub use optimizer::{
    OptimizerClient, PROTOCOL_VERSION, Recommendation, RecommendationGate, Submission,
    spawn_advisor,
};
pub use params::{CycleTiming, PackStage, ParamDeltas, ProcessParams, VelocityStage};
pub use phase::{MotionGains, Phase, ProcessController};
pub use quality::{MaterialProps, QualityClass, QualityPrediction, QualityPredictor};
pub use safety::{SafetyLimits, SafetyMonitor, SafetyState};
pub use sink::{CycleSink, CycleSummary, MemorySink};
pub use spc::{SpcEngine, SpcSummary, SpcWindow, SpecLimits};
pub use thermal::{ThermalCfg, ZoneRegulator};
