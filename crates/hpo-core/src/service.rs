//! A three-pool bounded worker service.
//!
//! Grounded in `ditk/hpo/utils/service.py`'s `ThreadService`: admission is
//! gated by `max_workers` concurrently in-flight tasks; each accepted task
//! runs `before_exec -> exec -> after_exec` on the exec pool, then
//! `fn_callback -> after_callback` on the callback pool and `after_sentback`
//! on the event pool concurrently. The worker-pool plumbing itself follows
//! `tools::selfplay`'s `tournament.rs` pattern of a fixed set of long-lived
//! threads draining a `crossbeam_channel::Receiver`.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Pending,
    Running,
    Closing,
    Dead,
}

impl ServiceState {
    fn label(self) -> &'static str {
        match self {
            ServiceState::Pending => "pending",
            ServiceState::Running => "running",
            ServiceState::Closing => "closing",
            ServiceState::Dead => "dead",
        }
    }
}

/// The outcome of one execution attempt: mirrors `ditk`'s
/// `Result = namedtuple('Result', ['ok', 'retval', 'error'])`.
pub enum ExecOutcome<O> {
    Ok(O),
    Err(Box<dyn Error + Send + Sync>),
}

impl<O> ExecOutcome<O> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecOutcome::Ok(_))
    }
}

type HookResult = Result<(), Box<dyn Error + Send + Sync>>;

/// The hook chain a concrete service (the search runner) implements.
pub trait ServiceHooks: Send + Sync + 'static {
    type Output: Send + 'static;

    fn before_exec(&self, task: &Task) -> HookResult {
        let _ = task;
        Ok(())
    }
    fn exec(&self, task: &Task) -> Result<Self::Output, Box<dyn Error + Send + Sync>>;
    fn after_exec(&self, task: &Task, result: &ExecOutcome<Self::Output>) -> HookResult {
        let (_, _) = (task, result);
        Ok(())
    }
    fn after_sentback(&self, task: &Task, result: &ExecOutcome<Self::Output>) -> HookResult {
        let (_, _) = (task, result);
        Ok(())
    }
    fn after_callback(&self, task: &Task, result: &ExecOutcome<Self::Output>) -> HookResult {
        let (_, _) = (task, result);
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(name: &'static str, n: usize) -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(0);
        let handles = (0..n.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool { sender: Some(tx), handles }
    }

    fn submit(&self, job: Job) {
        if let Some(tx) = &self.sender {
            let _ = tx.send(job);
        }
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

struct Inner {
    state: ServiceState,
    running_count: usize,
}

/// A bounded worker service driving one concrete [`ServiceHooks`]
/// implementation across three pools.
pub struct ThreadService<H: ServiceHooks> {
    hooks: Arc<H>,
    max_workers: usize,
    inner: Mutex<Inner>,
    exec_pool: Mutex<Option<WorkerPool>>,
    callback_pool: Mutex<Option<WorkerPool>>,
    event_pool: Mutex<Option<WorkerPool>>,
    closing: AtomicUsize,
    first_error: Mutex<Option<Box<dyn Error + Send + Sync>>>,
}

const BUSY_BACKOFF: Duration = Duration::from_millis(50);

impl<H: ServiceHooks> ThreadService<H> {
    pub fn new(hooks: H, max_workers: usize) -> Arc<Self> {
        Arc::new(ThreadService {
            hooks: Arc::new(hooks),
            max_workers: max_workers.max(1),
            inner: Mutex::new(Inner { state: ServiceState::Pending, running_count: 0 }),
            exec_pool: Mutex::new(None),
            callback_pool: Mutex::new(None),
            event_pool: Mutex::new(None),
            closing: AtomicUsize::new(0),
            first_error: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().unwrap().state
    }

    pub fn error(&self) -> Option<String> {
        self.first_error.lock().unwrap().as_ref().map(|e| e.to_string())
    }

    /// The hooks instance this service drives, so a caller that built it can
    /// wire a handle back into it after construction (e.g. the runner gives
    /// its hooks a weak reference to the service so a stop condition can
    /// trigger shutdown from inside `after_callback`).
    pub fn hooks(&self) -> &Arc<H> {
        &self.hooks
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        if guard.state == ServiceState::Pending {
            *self.exec_pool.lock().unwrap() = Some(WorkerPool::new("hpo-exec", self.max_workers));
            *self.callback_pool.lock().unwrap() = Some(WorkerPool::new("hpo-callback", default_pool_size()));
            *self.event_pool.lock().unwrap() = Some(WorkerPool::new("hpo-event", default_pool_size()));
            guard.state = ServiceState::Running;
            guard.running_count = 0;
        }
    }

    /// Submit `task` for execution. `fn_callback` runs on the callback pool
    /// once the exec stage finishes, before `after_callback`.
    pub fn send(
        self: &Arc<Self>,
        task: Task,
        fn_callback: impl Fn(&Task, &ExecOutcome<H::Output>) + Send + Sync + 'static,
        timeout: Option<Duration>,
    ) -> Result<(), CoreError> {
        let call_time = Instant::now();
        let mut tried = false;

        loop {
            if tried {
                if let Some(t) = timeout {
                    if call_time.elapsed() > t {
                        return Err(CoreError::ServiceBusy(format!(
                            "timed out after {:.2}s waiting for a free worker",
                            t.as_secs_f64()
                        )));
                    }
                }
                // timeout == None: retry indefinitely until a worker frees up
            }
            tried = true;

            let busy = {
                let mut guard = self.inner.lock().unwrap();
                match guard.state {
                    ServiceState::Pending => {
                        return Err(CoreError::ServiceNotRunning(guard.state.label()))
                    }
                    ServiceState::Running => {
                        if guard.running_count >= self.max_workers {
                            true
                        } else {
                            guard.running_count += 1;
                            false
                        }
                    }
                    ServiceState::Closing | ServiceState::Dead => return Err(CoreError::ServiceClosed),
                }
            };

            if busy {
                std::thread::sleep(BUSY_BACKOFF);
                continue;
            }

            self.submit_exec(task, fn_callback);
            return Ok(());
        }
    }

    fn submit_exec(
        self: &Arc<Self>,
        task: Task,
        fn_callback: impl Fn(&Task, &ExecOutcome<H::Output>) + Send + Sync + 'static,
    ) {
        let svc = Arc::clone(self);
        let job: Job = Box::new(move || svc.actual_exec(task, fn_callback));
        self.exec_pool.lock().unwrap().as_ref().expect("service not started").submit(job);
    }

    fn actual_exec(
        self: &Arc<Self>,
        task: Task,
        fn_callback: impl Fn(&Task, &ExecOutcome<H::Output>) + Send + Sync + 'static,
    ) {
        if let Err(err) = self.hooks.before_exec(&task) {
            self.shutdown_due_to_error(err);
        }

        let outcome = match self.hooks.exec(&task) {
            Ok(v) => ExecOutcome::Ok(v),
            Err(e) => ExecOutcome::Err(e),
        };

        if let Err(err) = self.hooks.after_exec(&task, &outcome) {
            self.shutdown_due_to_error(err);
        }

        {
            let mut guard = self.inner.lock().unwrap();
            guard.running_count = guard.running_count.saturating_sub(1);
        }

        let outcome = Arc::new(outcome);
        let task = Arc::new(task);

        let hooks_cb = Arc::clone(&self.hooks);
        let svc_cb = Arc::clone(self);
        let task_cb = Arc::clone(&task);
        let outcome_cb = Arc::clone(&outcome);
        let callback_job: Job = Box::new(move || {
            fn_callback(&task_cb, &outcome_cb);
            let hooks = Arc::clone(&hooks_cb);
            let svc = Arc::clone(&svc_cb);
            let task = Arc::clone(&task_cb);
            let outcome = Arc::clone(&outcome_cb);
            svc.event_pool.lock().unwrap().as_ref().expect("service not started").submit(Box::new(move || {
                if let Err(err) = hooks.after_callback(&task, &outcome) {
                    svc.shutdown_due_to_error(err);
                }
            }));
        });
        self.callback_pool.lock().unwrap().as_ref().expect("service not started").submit(callback_job);

        let hooks_ev = Arc::clone(&self.hooks);
        let svc_ev = Arc::clone(self);
        let sentback_job: Job = Box::new(move || {
            if let Err(err) = hooks_ev.after_sentback(&task, &outcome) {
                svc_ev.shutdown_due_to_error(err);
            }
        });
        self.event_pool.lock().unwrap().as_ref().expect("service not started").submit(sentback_job);
    }

    fn shutdown_due_to_error(self: &Arc<Self>, err: Box<dyn Error + Send + Sync>) {
        let mut first = self.first_error.lock().unwrap();
        if first.is_none() {
            log::error!("service hook failed, shutting down: {err}");
            *first = Some(err);
            drop(first);
            self.shutdown(false);
        }
    }

    /// Begin an orderly shutdown: stop accepting new tasks, drain every
    /// pool in exec -> callback -> event order, then mark the service dead.
    /// Idempotent; `wait` blocks the caller until the close thread finishes.
    pub fn shutdown(self: &Arc<Self>, wait: bool) {
        if self.closing.swap(1, AtomicOrdering::SeqCst) == 1 {
            if wait {
                self.wait_dead();
            }
            return;
        }

        self.inner.lock().unwrap().state = ServiceState::Closing;

        let svc = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            if let Some(mut p) = svc.exec_pool.lock().unwrap().take() {
                p.shutdown();
            }
            if let Some(mut p) = svc.callback_pool.lock().unwrap().take() {
                p.shutdown();
            }
            if let Some(mut p) = svc.event_pool.lock().unwrap().take() {
                p.shutdown();
            }
            svc.inner.lock().unwrap().state = ServiceState::Dead;
        });

        if wait {
            let _ = handle.join();
        } else {
            // Detach: the caller doesn't need to observe completion, but the
            // service is still driven to `Dead` in the background.
            std::mem::drop(handle);
        }
    }

    fn wait_dead(&self) {
        while self.inner.lock().unwrap().state != ServiceState::Dead {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ConfigValue;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Echo {
        calls: AtomicU64,
    }

    impl ServiceHooks for Echo {
        type Output = i64;
        fn exec(&self, task: &Task) -> Result<i64, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &task.config {
                ConfigValue::Int(i) => Ok(*i),
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn send_before_start_is_rejected() {
        let svc = ThreadService::new(Echo { calls: AtomicU64::new(0) }, 2);
        let err = svc.send(Task::new(0, ConfigValue::Int(1)), |_, _| {}, None);
        assert!(err.is_err());
    }

    #[test]
    fn runs_tasks_and_reports_via_callback() {
        let svc = ThreadService::new(Echo { calls: AtomicU64::new(0) }, 2);
        svc.start();

        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            svc.send(
                Task::new(i, ConfigValue::Int(i as i64)),
                move |_task, outcome| {
                    if let ExecOutcome::Ok(v) = outcome {
                        tx.send(*v).unwrap();
                    }
                },
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        }
        drop(tx);

        let mut got: Vec<i64> = rx.iter().take(5).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);

        svc.shutdown(true);
        assert_eq!(svc.state(), ServiceState::Dead);
    }

    #[test]
    fn rejects_new_work_once_closed() {
        let svc = ThreadService::new(Echo { calls: AtomicU64::new(0) }, 1);
        svc.start();
        svc.shutdown(true);
        let err = svc.send(Task::new(0, ConfigValue::Int(1)), |_, _| {}, None);
        assert!(err.is_err());
    }
}
