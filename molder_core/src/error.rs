use thiserror::Error;

/// What tripped the machine into `Fault`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    #[error("emergency stop asserted")]
    Estop,
    #[error("safety gate open")]
    GateOpen,
    #[error("zone temperature over ceiling")]
    OverTemperature,
    #[error("cavity pressure over ceiling")]
    OverPressure,
    #[error("clamp force over ceiling")]
    OverForce,
    #[error("sensor readings stale beyond hold bound")]
    SensorStale,
    #[error("shot accumulation timed out")]
    PlasticizeTimeout,
}

#[derive(Debug, Error, Clone)]
pub enum ControlError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for sensors")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing sensor suite")]
    MissingSensors,
    #[error("missing actuators")]
    MissingActuators,
    #[error("missing process parameters")]
    MissingParams,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
