//! Local-mode trial execution: spawn one child process per trial, redirect
//! its output to a per-trial log file, and reap it on drop if it's still
//! alive by the time we give up on it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use hpo_core::ConfigValue;

use crate::error::SchedulerError;

pub const KILL_TIMEOUT: Duration = Duration::from_secs(3);
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One running (or just-exited) child process for a local-mode trial.
pub struct LocalProcess {
    child: Child,
    pub pid: u32,
    pub log_path: PathBuf,
    pub result_path: PathBuf,
}

impl LocalProcess {
    /// Spawns `interpreter config_path`, with stdout/stderr both redirected
    /// to `log_path` so a failed trial leaves a readable trail behind.
    pub fn spawn(
        interpreter: &str,
        config_path: &Path,
        log_path: &Path,
        result_path: &Path,
    ) -> Result<Self, SchedulerError> {
        let log_file = File::create(log_path)?;
        let stderr_file = log_file.try_clone()?;
        let child = Command::new(interpreter)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()?;
        let pid = child.id();
        Ok(LocalProcess { child, pid, log_path: log_path.to_path_buf(), result_path: result_path.to_path_buf() })
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Non-blocking liveness check plus a harvest if the process has exited:
    /// `Some(exit_status_success)` if it has, `None` if it's still running.
    pub fn poll_exit(&mut self) -> Result<Option<bool>, SchedulerError> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(status.success())),
            None => Ok(None),
        }
    }

    /// Reads this trial's declared result back off disk. A well-behaved
    /// config script writes its final metrics to `result_path` as JSON
    /// before exiting (standing in for `result.pkl`); a missing file just
    /// means the trial never got that far, which the caller folds into an
    /// abnormal verdict. A sibling `result.txt`, if present, is merged in
    /// per §6.
    pub fn read_result(&self) -> Option<ConfigValue> {
        let text = std::fs::read_to_string(&self.result_path).ok()?;
        let json: serde_json::Value = serde_json::from_str(&text).ok()?;
        let mut config = json_to_config(&json);
        merge_result_txt(&mut config, &self.result_txt_path());
        Some(config)
    }

    /// `result.txt` lives alongside `result_path` in the same trial
    /// artifact directory.
    fn result_txt_path(&self) -> PathBuf {
        self.result_path.with_file_name("result.txt")
    }

    pub fn terminate(&mut self) {
        let deadline = Instant::now() + KILL_TIMEOUT;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(KILL_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.terminate();
        }
    }
}

/// Folds an optional `result.txt` JSON blob into an already-harvested
/// result map, per §6: "optionally `./<exp_name>/result.txt` (a JSON blob
/// merged into the status payload)". A missing, unreadable, non-JSON, or
/// non-object `result.txt` is silently ignored since it's optional; shared
/// by both local- and k8s-mode harvesting.
pub(crate) fn merge_result_txt(result: &mut ConfigValue, txt_path: &Path) {
    let Ok(text) = std::fs::read_to_string(txt_path) else { return };
    let Ok(serde_json::Value::Object(extra)) = serde_json::from_str(&text) else { return };
    if let ConfigValue::Map(m) = result {
        for (k, v) in extra {
            m.insert(k, json_to_config(&v));
        }
    }
}

fn json_to_config(v: &serde_json::Value) -> ConfigValue {
    match v {
        serde_json::Value::Null => ConfigValue::Null,
        serde_json::Value::Bool(b) => ConfigValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ConfigValue::Int(i)
            } else {
                ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => ConfigValue::Str(s.clone()),
        serde_json::Value::Array(a) => ConfigValue::List(a.iter().map(json_to_config).collect()),
        serde_json::Value::Object(o) => {
            ConfigValue::Map(o.iter().map(|(k, v)| (k.clone(), json_to_config(v))).collect())
        }
    }
}
