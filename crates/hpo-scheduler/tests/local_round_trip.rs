//! Black-box coverage of a full local-mode trial round trip: submit a task,
//! let the scheduler thread spawn and reap a child process, and observe the
//! published report settle on a terminal status. Exercises only
//! `hpo_scheduler`'s public API.

use std::time::Duration;

use hpo_core::ConfigValue;
use hpo_scheduler::task::TaskStatus;
use hpo_scheduler::{ExecutionMode, Scheduler, SchedulerConfig, SchedulerInput};

fn wait_for_terminal_report(
    output: &crossbeam_channel::Receiver<hpo_scheduler::SchedulerReport>,
) -> hpo_scheduler::SchedulerReport {
    loop {
        let report = output.recv_timeout(Duration::from_secs(10)).expect("scheduler is still reporting");
        let (defined, waiting, running, ..) = report.counts();
        if defined == 0 && waiting == 0 && running == 0 {
            return report;
        }
    }
}

/// A plain shell script (not Python) that writes `result.json` as its very
/// first action. `materialize` splices the hyper-parameter assignments in
/// Python bracket-indexing syntax, but since this template has no
/// `if __name__ == "__main__":` guard they land appended after the script's
/// own body, so they're free to be nonsense as far as `sh` is concerned —
/// the result is already on disk by the time it gets there.
const SHELL_TEMPLATE: &str = "echo '{\"loss\": 0.5}' > result.json\n";

#[test]
fn a_submitted_task_runs_to_success_and_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("template.sh");
    std::fs::write(&template_path, SHELL_TEMPLATE).unwrap();

    let mut cfg = SchedulerConfig::new(
        "proj",
        "hpo-1",
        ExecutionMode::Local { interpreter: "sh".to_string(), template_path, out_dir: dir.path().to_path_buf() },
    );
    cfg.poll_interval = Duration::from_millis(20);
    let (input, output, handle) = Scheduler::spawn(cfg);

    input.send(SchedulerInput::NewTask(ConfigValue::Float(0.1))).unwrap();
    input.send(SchedulerInput::Stop).unwrap();

    let report = wait_for_terminal_report(&output);
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].status, TaskStatus::Success, "{:?}", report.entries[0].error);
    assert_eq!(
        report.entries[0].result.as_ref().and_then(ConfigValue::as_f64),
        None,
        "the harvested JSON is a map, not a bare number"
    );

    handle.join().unwrap().expect("scheduler loop exits cleanly once stopped and drained");
}

/// `result.txt` writes a JSON object alongside `result.json`; its keys
/// should land in the harvested result map (§6: "optionally `result.txt`
/// (a JSON blob merged into the status payload)").
const SHELL_TEMPLATE_WITH_RESULT_TXT: &str =
    "echo '{\"loss\": 0.5}' > result.json\necho '{\"status\": \"success\"}' > result.txt\n";

#[test]
fn a_sibling_result_txt_is_merged_into_the_harvested_result() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("template.sh");
    std::fs::write(&template_path, SHELL_TEMPLATE_WITH_RESULT_TXT).unwrap();

    let mut cfg = SchedulerConfig::new(
        "proj",
        "hpo-1",
        ExecutionMode::Local { interpreter: "sh".to_string(), template_path, out_dir: dir.path().to_path_buf() },
    );
    cfg.poll_interval = Duration::from_millis(20);
    let (input, output, handle) = Scheduler::spawn(cfg);

    input.send(SchedulerInput::NewTask(ConfigValue::Float(0.1))).unwrap();
    input.send(SchedulerInput::Stop).unwrap();

    let report = wait_for_terminal_report(&output);
    assert_eq!(report.entries[0].status, TaskStatus::Success, "{:?}", report.entries[0].error);
    let result = report.entries[0].result.as_ref().expect("a harvested result map");
    assert_eq!(result.get("loss").and_then(ConfigValue::as_f64), Some(0.5), "result.json's own keys survive");
    assert!(
        matches!(result.get("status"), Some(ConfigValue::Str(s)) if s == "success"),
        "result.txt's keys are merged in: {result:?}"
    );

    handle.join().unwrap().expect("scheduler loop exits cleanly once stopped and drained");
}

#[test]
fn a_task_that_never_writes_a_result_is_marked_abnormal() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("template.sh");
    std::fs::write(&template_path, "true\n").unwrap();

    let mut cfg = SchedulerConfig::new(
        "proj",
        "hpo-1",
        ExecutionMode::Local { interpreter: "sh".to_string(), template_path, out_dir: dir.path().to_path_buf() },
    );
    cfg.poll_interval = Duration::from_millis(20);
    let (input, output, handle) = Scheduler::spawn(cfg);

    input.send(SchedulerInput::NewTask(ConfigValue::Null)).unwrap();
    input.send(SchedulerInput::Stop).unwrap();

    let report = wait_for_terminal_report(&output);
    assert_eq!(report.entries[0].status, TaskStatus::Abnormal);
    assert!(report.entries[0].error.is_some());

    handle.join().unwrap().unwrap();
}

#[test]
fn the_task_limit_rejects_submissions_past_max_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let template_path = dir.path().join("template.sh");
    std::fs::write(&template_path, SHELL_TEMPLATE).unwrap();

    let mut cfg = SchedulerConfig::new(
        "proj",
        "hpo-1",
        ExecutionMode::Local { interpreter: "sh".to_string(), template_path, out_dir: dir.path().to_path_buf() },
    );
    cfg.max_tasks = Some(1);
    cfg.poll_interval = Duration::from_millis(20);
    let (input, output, handle) = Scheduler::spawn(cfg);

    input.send(SchedulerInput::NewTask(ConfigValue::Null)).unwrap();
    input.send(SchedulerInput::NewTask(ConfigValue::Null)).unwrap();
    input.send(SchedulerInput::Stop).unwrap();

    let report = wait_for_terminal_report(&output);
    assert_eq!(report.entries.len(), 1, "the second task should have been rejected rather than queued");

    handle.join().unwrap().unwrap();
}
