//! `ParallelSearchRunner`: the orchestration entry point.
//!
//! Grounded in `ditk/hpo/runner/runner.py`'s `Runner` and
//! `ditk/hpo/runner/event.py`'s `RunnerStatus`: a fluent configuration
//! surface builds one `ThreadService`/`Session` pair, wires both to a
//! strongly-typed `EventSink` fan-out (the Rust rendering of the Python
//! `EventModel.bind`/`trigger` pub-sub), and returns the rank list's top
//! entry once the session and service both finish.

use crate::algorithm::{Algorithm, Session, SessionParams};
use crate::error::CoreError;
use crate::expr::Expr;
use crate::rank::RankList;
use crate::service::{ExecOutcome, ServiceHooks, ThreadService};
use crate::task::{with_time, RunFailed, RunResult, RunSkipped, Task};
use crate::template::{ConfigValue, SpaceTemplate};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Raised by the user's evaluation function: either a [`crate::task::Skip`]
/// (discard this trial, no retry consumed) or a retryable failure.
pub enum EvalError {
    Skip(ConfigValue),
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

type EvalFn = dyn Fn(&ConfigValue) -> Result<(ConfigValue, ConfigValue), EvalError> + Send + Sync;

/// One method per lifecycle point in `ditk`'s `RunnerStatus`, each with a
/// no-op default so a sink observes only what it cares about. A runner may
/// register any number of sinks; each receives every event.
pub trait EventSink: Send + Sync {
    fn init(&self) {}
    fn init_ok(&self) {}
    fn run_start(&self) {}
    fn step(&self, task_id: u64, config: &ConfigValue) {
        let (_, _) = (task_id, config);
    }
    fn step_ok(&self, task_id: u64, result: &RunResult) {
        let (_, _) = (task_id, result);
    }
    fn step_fail(&self, task_id: u64, error: &str) {
        let (_, _) = (task_id, error);
    }
    fn step_skip(&self, task_id: u64) {
        let _ = task_id;
    }
    fn step_final(&self, task_id: u64) {
        let _ = task_id;
    }
    fn try_(&self, task_id: u64, attempt: u64) {
        let (_, _) = (task_id, attempt);
    }
    fn try_complete(&self, task_id: u64, attempt: u64, elapsed: Duration) {
        let (_, _, _) = (task_id, attempt, elapsed);
    }
    fn try_ok(&self, task_id: u64, attempt: u64) {
        let (_, _) = (task_id, attempt);
    }
    fn try_fail(&self, task_id: u64, attempt: u64, error: &str) {
        let (_, _, _) = (task_id, attempt, error);
    }
    fn try_skip(&self, task_id: u64, attempt: u64) {
        let (_, _) = (task_id, attempt);
    }
    fn run_complete(&self, best: Option<&RunResult>) {
        let _ = best;
    }
}

/// The default sink: logs every lifecycle point via the `log` facade, at the
/// detail level the event warrants (attempt-level chatter at `trace`, the
/// final result at `info`).
#[derive(Debug, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn init(&self) {
        log::info!("hpo: initializing search");
    }

    fn init_ok(&self) {
        log::info!("hpo: search initialized");
    }

    fn run_start(&self) {
        log::info!("hpo: search started");
    }

    fn step(&self, task_id: u64, config: &ConfigValue) {
        log::debug!("hpo: task {task_id} sampled {}", config.to_json());
    }

    fn step_ok(&self, task_id: u64, result: &RunResult) {
        log::info!("hpo: task {task_id} ok, target = {:?}", result.value().ok().map(|v| v.to_json()));
    }

    fn step_fail(&self, task_id: u64, error: &str) {
        log::warn!("hpo: task {task_id} failed: {error}");
    }

    fn step_skip(&self, task_id: u64) {
        log::debug!("hpo: task {task_id} skipped");
    }

    fn try_(&self, task_id: u64, attempt: u64) {
        log::trace!("hpo: task {task_id} attempt {attempt} starting");
    }

    fn try_complete(&self, task_id: u64, attempt: u64, elapsed: Duration) {
        log::trace!("hpo: task {task_id} attempt {attempt} took {elapsed:?}");
    }

    fn try_fail(&self, task_id: u64, attempt: u64, error: &str) {
        log::warn!("hpo: task {task_id} attempt {attempt} errored: {error}");
    }

    fn run_complete(&self, best: Option<&RunResult>) {
        match best {
            Some(r) => log::info!("hpo: search complete, best target = {:?}", r.value().ok().map(|v| v.to_json())),
            None => log::info!("hpo: search complete, no successful trials"),
        }
    }
}

/// The `ServiceHooks` implementation every `ParallelSearchRunner::run` wires
/// into one `ThreadService`. Holds everything the per-task attempt loop and
/// the success/stop pathways need: the user's evaluation function, the
/// shared rank list, the OR-composed stop predicates, and the event sinks.
pub struct RunnerHooks {
    eval: Arc<EvalFn>,
    max_retries: u64,
    target: Expr,
    rank: Arc<Mutex<RankList<RunResult>>>,
    stop_conditions: Vec<Expr>,
    sinks: Vec<Arc<dyn EventSink>>,
    is_cond_meet: Arc<AtomicBool>,
    service: OnceLock<Weak<ThreadService<RunnerHooks>>>,
}

impl RunnerHooks {
    /// A trivial always-succeeding hook set for algorithm unit tests that
    /// need a running `ThreadService` but don't exercise the runner itself.
    pub fn for_test() -> Self {
        RunnerHooks {
            eval: Arc::new(|cfg| Ok((cfg.clone(), ConfigValue::Null))),
            max_retries: 1,
            target: Expr::ret(),
            rank: Arc::new(Mutex::new(RankList::new(10, |_: &RunResult| 0.0, false))),
            stop_conditions: Vec::new(),
            sinks: Vec::new(),
            is_cond_meet: Arc::new(AtomicBool::new(false)),
            service: OnceLock::new(),
        }
    }

    fn fire(&self, f: impl Fn(&dyn EventSink)) {
        for sink in &self.sinks {
            f(sink.as_ref());
        }
    }

    pub fn is_cond_meet(&self) -> bool {
        self.is_cond_meet.load(Ordering::SeqCst)
    }
}

impl ServiceHooks for RunnerHooks {
    type Output = RunResult;

    fn before_exec(&self, task: &Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.fire(|s| s.step(task.id, &task.config));
        Ok(())
    }

    /// The per-task attempt loop (spec 4.8): up to `max_retries` attempts,
    /// a `Skip` raised by the evaluation function short-circuits immediately
    /// with no further retries, and every other failure is retried until the
    /// last attempt, whose error is carried by `RunFailed`.
    fn exec(&self, task: &Task) -> Result<RunResult, Box<dyn std::error::Error + Send + Sync>> {
        let mut last_err: Option<Box<dyn std::error::Error + Send + Sync>> = None;
        let mut last_metrics = ConfigValue::Null;

        for attempt in 0..self.max_retries {
            self.fire(|s| s.try_(task.id, attempt));
            let start = Instant::now();

            match (self.eval)(&task.config) {
                Ok((ret, metrics)) => {
                    let elapsed = start.elapsed();
                    self.fire(|s| s.try_ok(task.id, attempt));
                    self.fire(|s| s.try_complete(task.id, attempt, elapsed));
                    let metrics = with_time(metrics, elapsed.as_secs_f64());
                    return Ok(RunResult::new(task.config.clone(), ret, metrics, self.target.clone()));
                }
                Err(EvalError::Skip(metrics)) => {
                    let elapsed = start.elapsed();
                    self.fire(|s| s.try_skip(task.id, attempt));
                    self.fire(|s| s.try_complete(task.id, attempt, elapsed));
                    return Err(Box::new(RunSkipped { metrics: with_time(metrics, elapsed.as_secs_f64()) }));
                }
                Err(EvalError::Failed(e)) => {
                    let elapsed = start.elapsed();
                    self.fire(|s| s.try_fail(task.id, attempt, &e.to_string()));
                    self.fire(|s| s.try_complete(task.id, attempt, elapsed));
                    last_metrics = with_time(ConfigValue::Null, elapsed.as_secs_f64());
                    last_err = Some(e);
                }
            }
        }

        Err(Box::new(RunFailed { error: last_err.expect("max_retries >= 1"), metrics: last_metrics }))
    }

    fn after_exec(&self, task: &Task, result: &ExecOutcome<RunResult>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match result {
            ExecOutcome::Ok(r) => self.fire(|s| s.step_ok(task.id, r)),
            ExecOutcome::Err(e) if e.downcast_ref::<RunSkipped>().is_some() => self.fire(|s| s.step_skip(task.id)),
            ExecOutcome::Err(e) => {
                let msg = e.to_string();
                self.fire(|s| s.step_fail(task.id, &msg));
            }
        }
        self.fire(|s| s.step_final(task.id));
        Ok(())
    }

    /// Runs on the event pool: append a successful result to the rank list
    /// under its dedicated lock.
    fn after_sentback(&self, task: &Task, result: &ExecOutcome<RunResult>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = task;
        if let ExecOutcome::Ok(r) = result {
            self.rank.lock().unwrap().append(r.clone());
        }
        Ok(())
    }

    /// Runs on the callback pool: if any OR-composed stop predicate accepts
    /// this result, mark `is_cond_meet` and shut the service down (in-flight
    /// tasks finish, no new ones are admitted).
    fn after_callback(&self, task: &Task, result: &ExecOutcome<RunResult>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = task;
        if let ExecOutcome::Ok(r) = result {
            if self.stop_conditions.iter().any(|expr| matches_stop(expr, r)) {
                self.is_cond_meet.store(true, Ordering::SeqCst);
                if let Some(service) = self.service.get().and_then(Weak::upgrade) {
                    service.shutdown(false);
                }
            }
        }
        Ok(())
    }
}

fn matches_stop(expr: &Expr, result: &RunResult) -> bool {
    match result.get(expr) {
        Ok(ConfigValue::Bool(b)) => b,
        Ok(other) => other.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Err(_) => false,
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no optimization direction set: call maximize(expr, name) or minimize(expr, name)")]
    MissingTarget,
    #[error("no search space set: call spaces(template)")]
    MissingSpaces,
    #[error("no evaluation function set: call eval(f)")]
    MissingEval,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("run failed: {0}")]
    Failed(String),
}

/// The orchestrator: a fluent, order-free configuration surface over one
/// pluggable [`Algorithm`].
pub struct ParallelSearchRunner {
    algorithm: Arc<dyn Algorithm>,
    spaces: Option<SpaceTemplate>,
    eval: Option<Arc<EvalFn>>,
    max_steps: Option<u64>,
    max_workers: usize,
    max_retries: u64,
    target: Option<Expr>,
    maximize: Option<bool>,
    stop_conditions: Vec<Expr>,
    rank_capacity: usize,
    concerns: Vec<(String, Expr)>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl ParallelSearchRunner {
    pub fn new(algorithm: impl Algorithm + 'static) -> Self {
        ParallelSearchRunner {
            algorithm: Arc::new(algorithm),
            spaces: None,
            eval: None,
            max_steps: None,
            max_workers: 4,
            max_retries: 1,
            target: None,
            maximize: None,
            stop_conditions: Vec::new(),
            rank_capacity: 1,
            concerns: Vec::new(),
            sinks: vec![Arc::new(LoggingEventSink)],
        }
    }

    pub fn spaces(mut self, template: SpaceTemplate) -> Self {
        self.spaces = Some(template);
        self
    }

    pub fn eval(
        mut self,
        f: impl Fn(&ConfigValue) -> Result<(ConfigValue, ConfigValue), EvalError> + Send + Sync + 'static,
    ) -> Self {
        self.eval = Some(Arc::new(f));
        self
    }

    pub fn max_steps(mut self, n: u64) -> Self {
        self.max_steps = Some(n);
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u64) -> Self {
        self.max_retries = n.max(1);
        self
    }

    /// Exactly one of `maximize`/`minimize` must be called; whichever runs
    /// last wins. `name` labels the rank list's key column.
    pub fn maximize(mut self, expr: Expr, _name: impl Into<String>) -> Self {
        self.target = Some(expr);
        self.maximize = Some(true);
        self
    }

    pub fn minimize(mut self, expr: Expr, _name: impl Into<String>) -> Self {
        self.target = Some(expr);
        self.maximize = Some(false);
        self
    }

    pub fn stop_when(mut self, expr: Expr) -> Self {
        self.stop_conditions.push(expr);
        self
    }

    pub fn rank(mut self, n: usize) -> Self {
        self.rank_capacity = n.max(1);
        self
    }

    pub fn concern(mut self, expr: Expr, name: impl Into<String>) -> Self {
        self.concerns.push((name.into(), expr));
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// 1. verify a direction is set, 2. build the service/session/rank
    /// list, 3. start/join/shutdown, 4. re-raise any collected error, else
    /// return the rank list's top `(config, ret, metrics)`.
    pub fn run(self) -> Result<Option<(ConfigValue, ConfigValue, ConfigValue)>, RunnerError> {
        let target = self.target.ok_or(RunnerError::MissingTarget)?;
        let maximize = self.maximize.ok_or(RunnerError::MissingTarget)?;
        let template = self.spaces.ok_or(RunnerError::MissingSpaces)?;
        let eval = self.eval.ok_or(RunnerError::MissingEval)?;

        for sink in &self.sinks {
            sink.init();
        }

        let mut rank = RankList::new(
            self.rank_capacity,
            |r: &RunResult| r.value().ok().and_then(|v| v.as_f64()).unwrap_or(f64::NEG_INFINITY),
            maximize,
        );
        for (name, expr) in self.concerns {
            rank = rank.with_column(name, move |r: &RunResult| {
                r.get(&expr).map(|v| v.to_json().to_string()).unwrap_or_else(|_| "?".to_string())
            });
        }
        let rank = Arc::new(Mutex::new(rank));

        let hooks = RunnerHooks {
            eval,
            max_retries: self.max_retries,
            target,
            rank: Arc::clone(&rank),
            stop_conditions: self.stop_conditions,
            sinks: self.sinks.clone(),
            is_cond_meet: Arc::new(AtomicBool::new(false)),
            service: OnceLock::new(),
        };

        let service = ThreadService::new(hooks, self.max_workers);
        let _ = service.hooks().service.set(Arc::downgrade(&service));
        service.start();

        let params = SessionParams { max_steps: self.max_steps, maximize };
        let session = self.algorithm.get_session(template, Arc::clone(&service), params)?;

        for sink in &self.sinks {
            sink.init_ok();
        }
        for sink in &self.sinks {
            sink.run_start();
        }

        session.clone().start();
        session.join();
        service.shutdown(true);

        if let Some(err) = session.error().or_else(|| service.error()) {
            return Err(RunnerError::Failed(err));
        }

        let best = rank.lock().unwrap().best().cloned();
        for sink in &self.sinks {
            sink.run_complete(best.as_ref());
        }

        Ok(best.map(|r| (r.config.clone(), r.ret.clone(), r.metrics.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::GridAlgorithm;
    use crate::value::{quniform, uniform};

    fn quadratic_space() -> SpaceTemplate {
        SpaceTemplate::Map(vec![("x".to_string(), SpaceTemplate::Leaf(quniform(-5.0, 5.0, 1.0).unwrap()))])
    }

    #[test]
    fn missing_direction_is_an_error() {
        let _ = env_logger::builder().is_test(true).try_init();
        let runner = ParallelSearchRunner::new(GridAlgorithm::new()).spaces(quadratic_space()).eval(|cfg| {
            let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
            Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
        });
        assert!(matches!(runner.run(), Err(RunnerError::MissingTarget)));
    }

    #[test]
    fn grid_run_finds_the_maximum_near_zero() {
        let _ = env_logger::builder().is_test(true).try_init();
        let runner = ParallelSearchRunner::new(GridAlgorithm::new())
            .spaces(quadratic_space())
            .eval(|cfg| {
                let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
                Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
            })
            .max_workers(2)
            .max_steps(11)
            .maximize(Expr::ret(), "neg_square")
            .rank(3);

        let (config, ret, _metrics) = runner.run().unwrap().expect("at least one successful trial");
        assert_eq!(config.get("x").and_then(ConfigValue::as_f64), Some(0.0));
        assert_eq!(ret.as_f64(), Some(0.0));
    }

    #[test]
    fn stop_when_halts_before_exhausting_the_grid() {
        let _ = env_logger::builder().is_test(true).try_init();
        let space = SpaceTemplate::Map(vec![("x".to_string(), SpaceTemplate::Leaf(uniform(-5.0, 5.0).unwrap()))]);
        let runner = ParallelSearchRunner::new(GridAlgorithm::new())
            .spaces(space)
            .eval(|cfg| {
                let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
                Ok((ConfigValue::Float(x), ConfigValue::Null))
            })
            .max_workers(1)
            .max_steps(1000)
            .maximize(Expr::ret(), "x")
            .stop_when(Expr::ret().gt(Expr::Const(ConfigValue::Float(-100.0))))
            .rank(1);

        let result = runner.run().unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn skip_does_not_count_as_a_retry_and_is_not_ranked() {
        let _ = env_logger::builder().is_test(true).try_init();
        let runner = ParallelSearchRunner::new(GridAlgorithm::new())
            .spaces(quadratic_space())
            .eval(|cfg| {
                let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
                if x < -4.0 {
                    return Err(EvalError::Skip(ConfigValue::Null));
                }
                Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
            })
            .max_workers(2)
            .max_steps(11)
            .maximize(Expr::ret(), "neg_square")
            .rank(20);

        let best = runner.run().unwrap();
        assert!(best.is_some());
    }

    #[test]
    fn metrics_always_carries_the_measured_wall_time() {
        let _ = env_logger::builder().is_test(true).try_init();
        let runner = ParallelSearchRunner::new(GridAlgorithm::new())
            .spaces(quadratic_space())
            .eval(|cfg| {
                let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
                Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
            })
            .max_workers(2)
            .max_steps(11)
            .maximize(Expr::ret(), "neg_square")
            .concern(Expr::metrics().attr("time"), "time")
            .rank(1);

        let (_, _, metrics) = runner.run().unwrap().expect("at least one successful trial");
        let time = metrics.get("time").and_then(ConfigValue::as_f64).expect("metrics always carries time");
        assert!(time >= 0.0);
    }
}
