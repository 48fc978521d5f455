//! External-process trial execution: local child processes or Kubernetes
//! jobs, one per trial.
//!
//! - [`task`]: per-trial bookkeeping object and `task_name`/k8s-name rules
//! - [`config_template`]: splices a trial's hyper-parameters into a config script
//! - [`local`]: local-mode child process execution
//! - [`k8s`]: Kubernetes-mode manifest rendering and `kubectl` driving
//! - [`scheduler`]: the one-tick admit/poll/drain/publish loop
//! - [`callable`]: the HPO-callable adapter a search session can call like
//!   any in-process evaluation function

pub mod callable;
pub mod config_template;
pub mod error;
pub mod k8s;
pub mod local;
pub mod scheduler;
pub mod task;

pub use error::SchedulerError;
pub use scheduler::{ExecutionMode, Scheduler, SchedulerConfig, SchedulerInput, SchedulerReport};
pub use task::{SchedulerTask, TaskStatus};
