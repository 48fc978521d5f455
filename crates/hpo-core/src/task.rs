//! Per-trial request/response types.
//!
//! Grounded in `ditk/hpo/runner/runner.py`: a `Task` carries one sampled
//! configuration through the service; `RunResult` wraps a successful
//! evaluation; `RunFailed`/`RunSkipped` are the two distinguished failure
//! modes a session's `_return_on_*` hooks branch on; `Skip` is the signal an
//! evaluation function raises to discard a trial without counting it as a
//! failure.

use crate::expr::{EvalContext, Expr};
use crate::template::ConfigValue;
use std::fmt;

/// Stamp the measured wall-clock seconds into a trial's metrics, per the
/// §3 invariant that `metrics` always contains at least `{"time": seconds}`
/// (`ditk/hpo/runner/log.py` reads `result.metrics['time']`/
/// `error.metrics['time']` unconditionally). Folds into an existing map if
/// the evaluation function returned one, otherwise wraps whatever it
/// returned under its own `"time"` key so the field is always present.
pub fn with_time(metrics: ConfigValue, seconds: f64) -> ConfigValue {
    match metrics {
        ConfigValue::Map(mut m) => {
            m.insert("time".to_string(), ConfigValue::Float(seconds));
            ConfigValue::Map(m)
        }
        ConfigValue::Null => {
            let mut m = std::collections::BTreeMap::new();
            m.insert("time".to_string(), ConfigValue::Float(seconds));
            ConfigValue::Map(m)
        }
        other => {
            let mut m = std::collections::BTreeMap::new();
            m.insert("time".to_string(), ConfigValue::Float(seconds));
            m.insert("value".to_string(), other);
            ConfigValue::Map(m)
        }
    }
}

/// One unit of work sent to the [`crate::service::ThreadService`]: an
/// algorithm-assigned id plus the sampled configuration to evaluate, plus
/// whatever algorithm-private state the session needs back on its own
/// success callback (e.g. bayes's raw probe vector, read by nothing outside
/// the session that put it there).
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub config: ConfigValue,
    pub attachment: Option<Vec<f64>>,
}

impl Task {
    pub fn new(id: u64, config: ConfigValue) -> Self {
        Task { id, config, attachment: None }
    }

    pub fn with_attachment(id: u64, config: ConfigValue, attachment: Vec<f64>) -> Self {
        Task { id, config, attachment: Some(attachment) }
    }
}

/// Raised by the user's evaluation function to discard this trial without
/// counting it as a failure (it does not consume a retry attempt and is not
/// ranked).
#[derive(Debug)]
pub struct Skip {
    pub metrics: ConfigValue,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trial skipped")
    }
}

impl std::error::Error for Skip {}

/// A finished, successful evaluation: the raw return value, whatever side
/// metrics the evaluation function recorded, and which expression the
/// algorithm should read as the scalar objective.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub config: ConfigValue,
    pub ret: ConfigValue,
    pub metrics: ConfigValue,
    target: Expr,
}

impl RunResult {
    pub fn new(config: ConfigValue, ret: ConfigValue, metrics: ConfigValue, target: Expr) -> Self {
        RunResult { config, ret, metrics, target }
    }

    /// Evaluate the configured target expression against this result.
    pub fn value(&self) -> Result<ConfigValue, crate::error::ExprError> {
        let ctx = EvalContext { config: &self.config, ret: &self.ret, metrics: &self.metrics };
        self.target.eval(&ctx)
    }

    /// Evaluate an arbitrary expression against this result's context
    /// (used by stop conditions and rank-list "concerns" columns).
    pub fn get(&self, expr: &Expr) -> Result<ConfigValue, crate::error::ExprError> {
        let ctx = EvalContext { config: &self.config, ret: &self.ret, metrics: &self.metrics };
        expr.eval(&ctx)
    }
}

/// Every attempt for this trial exhausted `max_retries` without succeeding.
#[derive(Debug)]
pub struct RunFailed {
    pub error: Box<dyn std::error::Error + Send + Sync>,
    pub metrics: ConfigValue,
}

impl fmt::Display for RunFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run failed after retries: {}", self.error)
    }
}

impl std::error::Error for RunFailed {}

/// The trial was explicitly skipped via [`Skip`].
#[derive(Debug)]
pub struct RunSkipped {
    pub metrics: ConfigValue,
}

impl fmt::Display for RunSkipped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run skipped")
    }
}

impl std::error::Error for RunSkipped {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_time_folds_into_an_existing_map() {
        let mut m = std::collections::BTreeMap::new();
        m.insert("loss".to_string(), ConfigValue::Float(0.1));
        let metrics = with_time(ConfigValue::Map(m), 1.5);
        assert_eq!(metrics.get("time").and_then(ConfigValue::as_f64), Some(1.5));
        assert_eq!(metrics.get("loss").and_then(ConfigValue::as_f64), Some(0.1));
    }

    #[test]
    fn with_time_wraps_a_null_or_non_map_return() {
        let from_null = with_time(ConfigValue::Null, 0.25);
        assert_eq!(from_null.get("time").and_then(ConfigValue::as_f64), Some(0.25));

        let from_scalar = with_time(ConfigValue::Int(7), 0.5);
        assert_eq!(from_scalar.get("time").and_then(ConfigValue::as_f64), Some(0.5));
        assert_eq!(from_scalar.get("value").and_then(ConfigValue::as_f64), Some(7.0));
    }
}
