//! The algorithm/session contract shared by grid, random, and bayes search.
//!
//! Grounded in `ditk/hpo/algorithm/base/algorithm.py`: a `BaseAlgorithm`
//! builds one `BaseSession` per run; the session owns a driver thread that
//! runs the algorithm's sampling loop (`_run`), submitting tasks to the
//! shared service and transitioning `PENDING -> RUNNING -> DEAD`.

use crate::error::CoreError;
use crate::runner::RunnerHooks;
use crate::service::{ExecOutcome, ThreadService};
use crate::task::{RunResult, Task};
use crate::template::{ConfigValue, SpaceTemplate};
use crate::value::HyperValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Apply each leaf's transform pipeline to its raw sampled scalar, then
/// rebuild the user-shaped config. Shared by the grid/random/bayes drivers
/// since every one of them ends its sampling step the same way.
pub fn reconstruct_config(template: &SpaceTemplate, leaves: &[HyperValue], raw: &[f64]) -> ConfigValue {
    let transed: Vec<f64> = leaves.iter().zip(raw).map(|(hv, x)| hv.trans(*x)).collect();
    template.reconstruct(&transed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Running,
    Dead,
}

/// Shared state machine every concrete session delegates to: Rust has no
/// implementation inheritance, so composition stands in for the Python
/// base class's instance state.
pub struct SessionCore {
    state: Mutex<SessionState>,
    max_id: AtomicU64,
    error: Mutex<Option<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pub service: Arc<ThreadService<RunnerHooks>>,
}

impl SessionCore {
    pub fn new(service: Arc<ThreadService<RunnerHooks>>) -> Arc<Self> {
        Arc::new(SessionCore {
            state: Mutex::new(SessionState::Pending),
            max_id: AtomicU64::new(0),
            error: Mutex::new(None),
            handle: Mutex::new(None),
            service,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// Submit one sampled configuration, with optional algorithm-private
    /// attachment (e.g. bayes's raw probe vector). `on_return` is this
    /// session's own bookkeeping hook (e.g. bayes appends the observation to
    /// its surrogate); it is distinct from the runner-level rank/stop-condition
    /// hook, which fires independently on the service's event pool.
    pub fn put(
        self: &Arc<Self>,
        config: ConfigValue,
        attachment: Option<Vec<f64>>,
        on_return: impl Fn(&Task, &ExecOutcome<RunResult>) + Send + Sync + 'static,
    ) -> Result<(), CoreError> {
        if self.state() != SessionState::Running {
            return Err(CoreError::SessionFailed("session is not running".to_string()));
        }
        let id = self.max_id.fetch_add(1, Ordering::SeqCst);
        self.service.send(Task { id, config, attachment }, on_return, None)
    }

    /// Number of tasks this session has emitted so far.
    pub fn emitted(&self) -> u64 {
        self.max_id.load(Ordering::SeqCst)
    }

    /// Transition PENDING -> RUNNING and spawn the driver thread running
    /// `body` (the algorithm's `_run`). On completion the service is shut
    /// down and the session transitions to DEAD, whether or not `body`
    /// returned an error.
    pub fn start(self: &Arc<Self>, body: impl FnOnce() -> Result<(), CoreError> + Send + 'static) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Pending {
                return;
            }
            *state = SessionState::Running;
        }

        let core = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            if let Err(e) = body() {
                *core.error.lock().unwrap() = Some(e.to_string());
            }
            core.service.shutdown(false);
            *core.state.lock().unwrap() = SessionState::Dead;
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

/// One run of a search algorithm against a flattened space template.
pub trait Session: Send + Sync {
    fn start(self: Arc<Self>);
    fn join(&self);
    fn state(&self) -> SessionState;
    fn error(&self) -> Option<String>;
}

/// Runner-level settings every algorithm's session needs regardless of its
/// own strategy-specific configuration: `max_steps(n)` caps the total
/// number of tasks any session may emit, and `maximize` is the direction
/// `maximize(expr)`/`minimize(expr)` settled on (bayes needs it to normalize
/// its surrogate's targets; grid/random ignore it).
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub max_steps: Option<u64>,
    pub maximize: bool,
}

/// A pluggable search strategy, analogous to `BaseAlgorithm`.
pub trait Algorithm: Send + Sync {
    fn get_session(
        &self,
        template: SpaceTemplate,
        service: Arc<ThreadService<RunnerHooks>>,
        params: SessionParams,
    ) -> Result<Arc<dyn Session>, CoreError>;

    fn name(&self) -> &'static str;
}

/// `ServiceNoLongerAccept` raised by `put`/`send` once the service stops
/// taking new work; every session's sampling loop treats it as a clean
/// early-exit rather than an error.
pub fn is_service_closed(err: &CoreError) -> bool {
    matches!(err, CoreError::ServiceClosed)
}
