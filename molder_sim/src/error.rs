use thiserror::Error;

/// Simulated acquisition/output failures, injectable from tests.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    #[error("timeout waiting for frame")]
    Timeout,
    #[error("acquisition fault injected")]
    InjectedFault,
    #[error("actuator channel offline")]
    ActuatorOffline,
}
