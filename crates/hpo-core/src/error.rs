use thiserror::Error;

/// Configuration-time errors raised while describing or allocating a search space.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("continuous space requires lbound < ubound, got [{lbound}, {ubound})")]
    InvalidBounds { lbound: f64, ubound: f64 },

    #[error("stepped space requires start <= end, got start={start}, end={end}")]
    InvalidRange { start: f64, end: f64 },

    #[error("stepped space requires a positive step, got {step}")]
    NonPositiveStep { step: f64 },

    #[error("fixed space requires at least one choice")]
    EmptyFixedSpace,

    #[error("grid search needs a finite step budget but `max_steps` is unset and a continuous dimension is present")]
    UnboundedContinuous,

    #[error("random search exhausted every distinct point in a finite search space")]
    NoMoreRandomSample,

    #[error("bayes search does not support `Fixed` spaces")]
    FixedUnsupportedByBayes,
}

/// Errors raised while evaluating a result expression against a finished run.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("no field named `{0}` in this context")]
    UnknownField(String),

    #[error("index {0} out of range (len {1})")]
    IndexOutOfRange(usize, usize),

    #[error("expected {expected}, got {actual}")]
    TypeMismatch { expected: &'static str, actual: &'static str },

    #[error("unknown aggregate function `{0}`")]
    UnknownCall(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// Top-level error returned by a runner once its session or service fails.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Space(#[from] SpaceError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("service is {0}")]
    ServiceNotRunning(&'static str),

    #[error("service is busy: {0}")]
    ServiceBusy(String),

    #[error("service is no longer accepting tasks")]
    ServiceClosed,

    #[error("session failed: {0}")]
    SessionFailed(String),
}
