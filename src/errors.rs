use thiserror::Error;

/// The error enumeration for the whole simulation crate.
///
/// Every failure mode is fatal to the current simulation: the driver tears
/// down before surfacing any of these to the host. Integrator variants carry
/// the solver's own diagnostic in their message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("simulation already initialized")]
    AlreadyInitialized,
    #[error("simulation not initialized")]
    NotInitialized,
    #[error("invalid argument shape: {0}")]
    InvalidArgumentShape(String),
    #[error("log interval too small compared to tmax: float(tmax + log_interval) = float(tmax)")]
    LogIntervalTooSmall,
    #[error("values in log_times must be non-decreasing")]
    LogTimesNonDecreasing,
    #[error("unknown variable in logging map: {0}")]
    UnknownLoggedVariable(String),
    #[error("memory allocation failed: {0}")]
    OutOfMemory(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("invalid pacing: {0}")]
    InvalidPacing(String),
    #[error("integrator convergence failure: {0}")]
    IntegratorConvergence(String),
    #[error("integrator setup failed: {0}")]
    IntegratorSetup(String),
    #[error("illegal integrator input: {0}")]
    IntegratorInput(String),
    #[error("right-hand side function failed: {0}")]
    RhsFailed(String),
    #[error("root finding function failed: {0}")]
    RootFuncFailed(String),
    #[error("maximum number of zero-length steps taken at t={0}")]
    ZeroStepLimit(f64),
    #[error("overflow in logged step count: simulation too long")]
    CountOverflow,
    #[error("simulation cancelled")]
    Cancelled,
    #[error("call to append failed on logging sink: {0}")]
    LogAppendFailed(String),
    #[error("call to append failed on sensitivity sink: {0}")]
    SensitivityAppendFailed(String),
}
