//! The scheduler's own thread: admits waiting tasks, polls running ones,
//! drains newly submitted trials, and reports status on every tick.
//!
//! The spec describes this as running in its own out-of-process scheduler
//! with a monitor thread re-raising errors in the parent; this crate runs it
//! on a dedicated thread within the same process instead (a deliberate
//! simplification recorded in the grounding ledger), but keeps the same
//! channel-based, non-blocking-producer contract so the HPO-callable adapter
//! in [`crate::callable`] doesn't need to know the difference.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use hpo_core::ConfigValue;
use log::{info, warn};

use crate::config_template;
use crate::error::SchedulerError;
use crate::k8s::{render_manifest, K8sJob};
use crate::local::LocalProcess;
use crate::task::{task_name, validate_k8s_name, RunningHandle, SchedulerTask, TaskStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// How long a k8s task that looks dead gets to reappear in `kubectl get pod`
/// before the scheduler gives up on it and harvests/fails it for real.
pub const K8S_DEAD_GRACE: Duration = Duration::from_secs(180);

/// The message a trial submitter sends to add work, or the sentinel that
/// asks the loop to wind down after its current tick.
pub enum SchedulerInput {
    NewTask(ConfigValue),
    Stop,
}

#[derive(Clone)]
pub struct TaskReportEntry {
    pub task_id: u64,
    pub hyper_parameter_info: ConfigValue,
    pub status: TaskStatus,
    pub result: Option<ConfigValue>,
    pub error: Option<String>,
}

/// One tick's status snapshot, published unconditionally every tick.
#[derive(Clone)]
pub struct SchedulerReport {
    pub entries: Vec<TaskReportEntry>,
}

impl SchedulerReport {
    pub fn counts(&self) -> (usize, usize, usize, usize, usize, usize) {
        let mut defined = 0;
        let mut waiting = 0;
        let mut running = 0;
        let mut finished = 0;
        let mut success = 0;
        let mut abnormal = 0;
        for e in &self.entries {
            match e.status {
                TaskStatus::Defined => defined += 1,
                TaskStatus::Waiting => waiting += 1,
                TaskStatus::Running => running += 1,
                TaskStatus::Finished => finished += 1,
                TaskStatus::Success => success += 1,
                TaskStatus::Abnormal => abnormal += 1,
            }
        }
        (defined, waiting, running, finished, success, abnormal)
    }
}

pub enum ExecutionMode {
    Local { interpreter: String, template_path: PathBuf, out_dir: PathBuf },
    K8s { template_path: PathBuf, out_dir: PathBuf },
}

pub struct SchedulerConfig {
    pub project: String,
    pub hpo_id: String,
    pub mode: ExecutionMode,
    pub max_running: usize,
    pub max_tasks: Option<usize>,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl SchedulerConfig {
    pub fn new(project: impl Into<String>, hpo_id: impl Into<String>, mode: ExecutionMode) -> Self {
        SchedulerConfig {
            project: project.into(),
            hpo_id: hpo_id.into(),
            mode,
            max_running: 4,
            max_tasks: None,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    task_list: Vec<SchedulerTask>,
    waiting_queue: VecDeque<usize>,
    next_task_id: u64,
    finish: bool,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Scheduler { cfg, task_list: Vec::new(), waiting_queue: VecDeque::new(), next_task_id: 0, finish: false }
    }

    fn running_count(&self) -> usize {
        self.task_list.iter().filter(|t| t.status == TaskStatus::Running).count()
    }

    fn define_task(&mut self, hyper_params: ConfigValue) -> Result<(), SchedulerError> {
        if let Some(max) = self.cfg.max_tasks {
            if self.task_list.len() >= max {
                return Err(SchedulerError::TaskLimitReached(max));
            }
        }
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let name = task_name(&self.cfg.project, &self.cfg.hpo_id, task_id);
        validate_k8s_name(&name)?;
        let artifact_dir = match &self.cfg.mode {
            ExecutionMode::Local { out_dir, .. } => out_dir.join(&name),
            ExecutionMode::K8s { out_dir, .. } => out_dir.join(&name),
        };
        std::fs::create_dir_all(&artifact_dir)?;
        let mut task = SchedulerTask::new(task_id, self.cfg.hpo_id.clone(), name, hyper_params, artifact_dir);
        task.status = TaskStatus::Waiting;
        self.task_list.push(task);
        self.waiting_queue.push_back(self.task_list.len() - 1);
        Ok(())
    }

    /// Step 1: admit the next waiting task if there's a free slot.
    fn admit(&mut self) -> Result<(), SchedulerError> {
        if self.running_count() >= self.cfg.max_running {
            return Ok(());
        }
        let Some(idx) = self.waiting_queue.pop_front() else { return Ok(()) };
        self.emit(idx)
    }

    fn emit(&mut self, idx: usize) -> Result<(), SchedulerError> {
        let task = &self.task_list[idx];
        let config_script = match &self.cfg.mode {
            ExecutionMode::Local { template_path, .. } | ExecutionMode::K8s { template_path, .. } => {
                let template = std::fs::read_to_string(template_path)?;
                config_template::materialize(&template, &task.hyper_parameter_info, &task.task_name)
            }
        };

        let handle = match &self.cfg.mode {
            ExecutionMode::Local { interpreter, .. } => {
                let config_path = task.artifact_dir.join("config.py");
                std::fs::write(&config_path, &config_script)?;
                let log_path = task.artifact_dir.join("stderr.log");
                let result_path = task.artifact_dir.join("result.json");
                let proc = LocalProcess::spawn(interpreter, &config_path, &log_path, &result_path)?;
                RunningHandle::Local(proc)
            }
            ExecutionMode::K8s { template_path, .. } => {
                let template = std::fs::read_to_string(template_path)?;
                let manifest = render_manifest(&template, &task.task_name, &config_script)?;
                let manifest_path = task.artifact_dir.join("job.yaml");
                std::fs::write(&manifest_path, &manifest)?;
                let result_path = task.artifact_dir.join("result.json");
                let mut job = K8sJob::new(task.task_name.clone(), manifest_path, result_path);
                job.submit()?;
                RunningHandle::K8s(job)
            }
        };
        self.task_list[idx].mark_running(handle);
        info!("emitted task {}", self.task_list[idx].task_name);
        Ok(())
    }

    /// Step 2: poll every running task for liveness/timeout and harvest
    /// completed ones.
    fn poll_running(&mut self) {
        let timeout = self.cfg.timeout;
        for task in self.task_list.iter_mut().filter(|t| t.status == TaskStatus::Running) {
            if let Some(limit) = timeout {
                if let Some(start) = task.start_time {
                    if start.elapsed() > limit {
                        warn!("task {} exceeded timeout, cancelling", task.task_name);
                        if let Some(RunningHandle::Local(p)) = &mut task.handle {
                            p.terminate();
                        }
                        if let Some(RunningHandle::K8s(j)) = &task.handle {
                            j.teardown();
                        }
                        task.mark_finished(Err(format!("task {} timed out", task.task_id)));
                        continue;
                    }
                }
            }

            let alive = match task.is_alive() {
                Ok(alive) => alive,
                Err(e) => {
                    task.mark_finished(Err(e.to_string()));
                    continue;
                }
            };
            if alive {
                task.first_dead_seen = None;
                continue;
            }

            // A pod can briefly drop out of `kubectl get pod` between polls
            // without the task actually having died; give it one grace
            // window to reappear before giving up. Local child processes
            // have no such flakiness (`try_wait` is authoritative), so they
            // skip straight to harvesting.
            if task.is_k8s() {
                match task.first_dead_seen {
                    None => {
                        task.first_dead_seen = Some(Instant::now());
                        continue;
                    }
                    Some(since) if since.elapsed() < K8S_DEAD_GRACE => continue,
                    Some(_) => {}
                }
            }

            let result = match &task.handle {
                Some(RunningHandle::Local(p)) => p.read_result(),
                Some(RunningHandle::K8s(j)) => j.harvest_result().ok().flatten(),
                None => None,
            };
            match result {
                Some(r) => task.mark_finished(Ok(r)),
                None => task.mark_finished(Err("no result artifact was produced".to_string())),
            }
        }
    }

    /// Step 3: drain the input channel non-blockingly.
    fn drain_input(&mut self, input: &Receiver<SchedulerInput>) {
        loop {
            match input.try_recv() {
                Ok(SchedulerInput::NewTask(params)) => {
                    if let Err(e) = self.define_task(params) {
                        warn!("could not define task: {e}");
                    }
                }
                Ok(SchedulerInput::Stop) => {
                    self.finish = true;
                }
                Err(_) => break,
            }
        }
    }

    /// Step 4: build this tick's report.
    fn report(&self) -> SchedulerReport {
        let entries = self
            .task_list
            .iter()
            .map(|t| TaskReportEntry {
                task_id: t.task_id,
                hyper_parameter_info: t.hyper_parameter_info.clone(),
                status: t.status,
                result: t.result.clone(),
                error: t.error.clone(),
            })
            .collect();
        SchedulerReport { entries }
    }

    /// Runs one full tick (admit, poll, drain, publish) and returns whether
    /// the loop should keep going.
    pub fn tick(
        &mut self,
        input: &Receiver<SchedulerInput>,
        output: &Sender<SchedulerReport>,
    ) -> Result<bool, SchedulerError> {
        self.admit()?;
        self.poll_running();
        self.drain_input(input);
        let _ = output.send(self.report());
        Ok(!self.finish || self.running_count() > 0)
    }

    /// Runs ticks on the current thread until a stop sentinel is drained and
    /// every in-flight task has finished.
    pub fn run_loop(
        mut self,
        input: Receiver<SchedulerInput>,
        output: Sender<SchedulerReport>,
    ) -> Result<(), SchedulerError> {
        loop {
            let keep_going = self.tick(&input, &output)?;
            if !keep_going {
                return Ok(());
            }
            std::thread::sleep(self.cfg.poll_interval);
        }
    }

    /// Spawns the scheduler loop on a dedicated thread, returning the input
    /// sender, output receiver, and a join handle a monitor thread can wait
    /// on to re-raise a scheduler-internal error.
    pub fn spawn(
        cfg: SchedulerConfig,
    ) -> (Sender<SchedulerInput>, Receiver<SchedulerReport>, JoinHandle<Result<(), SchedulerError>>) {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let scheduler = Scheduler::new(cfg);
        let handle = std::thread::spawn(move || scheduler.run_loop(input_rx, output_tx));
        (input_tx, output_rx, handle)
    }
}

/// Blocks on `output` until the scheduler reports no task still in flight,
/// or until `deadline` passes. Used by a caller that wants a synchronous
/// "drain everything" point rather than the asynchronous callable adapter.
pub fn wait_for_idle(
    output: &Receiver<SchedulerReport>,
    poll_interval: Duration,
    deadline: Option<Instant>,
) -> Result<SchedulerReport, SchedulerError> {
    loop {
        let recv = match deadline {
            Some(d) => output.recv_timeout(d.saturating_duration_since(Instant::now())),
            None => output.recv_timeout(poll_interval * 2),
        };
        match recv {
            Ok(report) => {
                let (defined, waiting, running, ..) = report.counts();
                if defined == 0 && waiting == 0 && running == 0 {
                    return Ok(report);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return Err(SchedulerError::SchedulerStopped);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return Err(SchedulerError::SchedulerStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_config(dir: &std::path::Path) -> SchedulerConfig {
        let template_path = dir.join("template.py");
        std::fs::write(&template_path, "if __name__ == \"__main__\":\n    pass\n").unwrap();
        let mut cfg = SchedulerConfig::new(
            "proj",
            "hpo-1",
            ExecutionMode::Local {
                interpreter: "true".to_string(),
                template_path,
                out_dir: dir.to_path_buf(),
            },
        );
        cfg.max_running = 2;
        cfg.poll_interval = Duration::from_millis(1);
        cfg
    }

    #[test]
    fn define_task_assigns_monotonic_ids_and_queues_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut sched = Scheduler::new(test_config(dir.path()));
        sched.define_task(ConfigValue::Map(BTreeMap::new())).unwrap();
        sched.define_task(ConfigValue::Map(BTreeMap::new())).unwrap();
        assert_eq!(sched.task_list[0].task_id, 0);
        assert_eq!(sched.task_list[1].task_id, 1);
        assert_eq!(sched.waiting_queue.len(), 2);
    }

    #[test]
    fn task_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.max_tasks = Some(1);
        let mut sched = Scheduler::new(cfg);
        sched.define_task(ConfigValue::Map(BTreeMap::new())).unwrap();
        let err = sched.define_task(ConfigValue::Map(BTreeMap::new())).unwrap_err();
        assert!(matches!(err, SchedulerError::TaskLimitReached(1)));
    }

    #[test]
    fn admit_respects_max_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.max_running = 1;
        let mut sched = Scheduler::new(cfg);
        for _ in 0..3 {
            sched.define_task(ConfigValue::Map(BTreeMap::new())).unwrap();
        }
        sched.admit().unwrap();
        assert_eq!(sched.running_count(), 1);
        sched.admit().unwrap();
        assert_eq!(sched.running_count(), 1, "second admit should be a no-op while the first is still running");
    }
}
