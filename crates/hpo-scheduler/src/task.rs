//! The per-trial bookkeeping object the scheduler drives through its state sets.

use std::path::PathBuf;
use std::time::Instant;

use hpo_core::ConfigValue;

use crate::error::SchedulerError;
use crate::k8s::K8sJob;
use crate::local::LocalProcess;

/// Where a task currently sits. The scheduler keeps these as disjoint sets
/// (`defined`, `waiting`, `running`, `finished`, and the `finished` split of
/// `success`/`abnormal`) rather than a single flat enum field on the task,
/// but the variant is still stored on the task itself so a caller inspecting
/// one in isolation doesn't need the owning sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Registered with the scheduler, not yet admitted to run.
    Defined,
    /// Admitted, queued behind the running-task limit.
    Waiting,
    /// A child process or pod has been started for this task.
    Running,
    /// The process/pod exited and was harvested; outcome pending a verdict.
    Finished,
    Success,
    Abnormal,
}

pub(crate) enum RunningHandle {
    Local(LocalProcess),
    K8s(K8sJob),
}

pub struct SchedulerTask {
    pub task_id: u64,
    pub hpo_id: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub hyper_parameter_info: ConfigValue,
    pub start_time: Option<Instant>,
    pub emit_time: Option<Instant>,
    pub artifact_dir: PathBuf,
    pub result: Option<ConfigValue>,
    pub error: Option<String>,
    pub(crate) handle: Option<RunningHandle>,
    /// When a k8s-mode liveness poll first observes the pod as gone, the
    /// time of that observation — giving it one grace window to reappear
    /// before the task is given up on. `None` while the task looks alive.
    pub(crate) first_dead_seen: Option<Instant>,
}

impl SchedulerTask {
    pub(crate) fn new(
        task_id: u64,
        hpo_id: String,
        task_name: String,
        hyper_parameter_info: ConfigValue,
        artifact_dir: PathBuf,
    ) -> Self {
        SchedulerTask {
            task_id,
            hpo_id,
            task_name,
            status: TaskStatus::Defined,
            hyper_parameter_info,
            start_time: None,
            emit_time: None,
            artifact_dir,
            result: None,
            error: None,
            handle: None,
            first_dead_seen: None,
        }
    }

    pub(crate) fn mark_running(&mut self, handle: RunningHandle) {
        self.status = TaskStatus::Running;
        self.start_time = Some(Instant::now());
        self.handle = Some(handle);
        self.first_dead_seen = None;
    }

    pub(crate) fn mark_finished(&mut self, result: Result<ConfigValue, String>) {
        self.status = match &result {
            Ok(_) => TaskStatus::Success,
            Err(_) => TaskStatus::Abnormal,
        };
        match result {
            Ok(v) => self.result = Some(v),
            Err(e) => self.error = Some(e),
        }
        self.emit_time = Some(Instant::now());
        self.handle = None;
        self.first_dead_seen = None;
    }

    pub fn is_alive(&mut self) -> Result<bool, SchedulerError> {
        match &mut self.handle {
            Some(RunningHandle::Local(p)) => Ok(p.is_alive()),
            Some(RunningHandle::K8s(j)) => j.is_alive(),
            None => Ok(false),
        }
    }

    /// Whether this task's handle is a k8s job, per the "second-chance"
    /// re-check that only applies to pod liveness, not local child processes.
    pub(crate) fn is_k8s(&self) -> bool {
        matches!(self.handle, Some(RunningHandle::K8s(_)))
    }
}

/// Composes a stable, human-debuggable identifier for a task: unique within
/// an HPO run and, when used as a Kubernetes object name, valid as one.
pub fn task_name(project: &str, hpo_id: &str, task_id: u64) -> String {
    format!("{project}-hpo-id-{hpo_id}-task-{task_id}")
}

/// Kubernetes object names are DNS-1123 labels: lowercase alphanumerics and
/// `-`, starting and ending alphanumeric, at most 63 characters.
pub fn validate_k8s_name(name: &str) -> Result<(), SchedulerError> {
    let bad = name.is_empty()
        || name.len() > 63
        || !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        || !name.chars().next().unwrap().is_ascii_alphanumeric()
        || !name.chars().last().unwrap().is_ascii_alphanumeric();
    if bad {
        Err(SchedulerError::InvalidTaskName(name.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_name_is_deterministic() {
        assert_eq!(task_name("resnet", "hpo-7", 3), "resnet-hpo-id-hpo-7-task-3");
    }

    #[test]
    fn k8s_name_rejects_uppercase_and_leading_hyphen() {
        assert!(validate_k8s_name("resnet-hpo-7-task-3").is_ok());
        assert!(validate_k8s_name("Resnet-hpo-7-task-3").is_err());
        assert!(validate_k8s_name("-leading-hyphen").is_err());
        assert!(validate_k8s_name(&"x".repeat(64)).is_err());
    }
}
