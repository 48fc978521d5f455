//! Adapts a running scheduler into a plain function an [`hpo_core::Algorithm`]
//! session can call like any other evaluation function: push hyper-parameters
//! in, block until that trial's verdict comes back out.

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use hpo_core::ConfigValue;
use rand::Rng;

use crate::error::SchedulerError;
use crate::scheduler::{SchedulerInput, SchedulerReport};
use crate::task::TaskStatus;

const TRIAL_TAG_KEY: &str = "_trial_tag";

fn tag_with_trial(hyper_params: ConfigValue, trial_id: u64, tag: &str) -> ConfigValue {
    let ConfigValue::Map(mut m) = hyper_params else {
        let mut m = BTreeMap::new();
        m.insert("value".to_string(), hyper_params);
        m.insert(TRIAL_TAG_KEY.to_string(), ConfigValue::Str(tag.to_string()));
        m.insert("trial_id".to_string(), ConfigValue::Int(trial_id as i64));
        return ConfigValue::Map(m);
    };
    m.insert(TRIAL_TAG_KEY.to_string(), ConfigValue::Str(tag.to_string()));
    m.insert("trial_id".to_string(), ConfigValue::Int(trial_id as i64));
    ConfigValue::Map(m)
}

fn tag_of(hyper_parameter_info: &ConfigValue) -> Option<&str> {
    match hyper_parameter_info.get(TRIAL_TAG_KEY) {
        Some(ConfigValue::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Builds the `callable(hyper_params, trial_id) -> user_return` adapter over
/// a scheduler's input/output channel pair.
pub fn callable(
    input: Sender<SchedulerInput>,
    output: Receiver<SchedulerReport>,
    poll_interval: Duration,
) -> impl Fn(ConfigValue, u64) -> Result<ConfigValue, SchedulerError> {
    move |hyper_params, trial_id| {
        let tag = format!("{trial_id}-{:x}", rand::rng().random::<u64>());
        let tagged = tag_with_trial(hyper_params, trial_id, &tag);
        input
            .send(SchedulerInput::NewTask(tagged))
            .map_err(|_| SchedulerError::SchedulerStopped)?;

        loop {
            match output.recv_timeout(poll_interval) {
                Ok(report) => {
                    let found = report.entries.iter().find(|e| tag_of(&e.hyper_parameter_info) == Some(tag.as_str()));
                    let Some(entry) = found else { continue };
                    match entry.status {
                        TaskStatus::Success => return Ok(entry.result.clone().unwrap_or(ConfigValue::Null)),
                        TaskStatus::Abnormal => {
                            return Err(SchedulerError::RemoteTrialFailure(
                                trial_id,
                                entry.error.clone().unwrap_or_else(|| "unknown failure".to_string()),
                            ))
                        }
                        _ => continue,
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(SchedulerError::SchedulerStopped),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagging_a_map_preserves_original_keys() {
        let mut m = BTreeMap::new();
        m.insert("lr".to_string(), ConfigValue::Float(0.1));
        let tagged = tag_with_trial(ConfigValue::Map(m), 7, "7-abc");
        assert_eq!(tagged.get("lr").and_then(ConfigValue::as_f64), Some(0.1));
        assert_eq!(tag_of(&tagged), Some("7-abc"));
    }

    #[test]
    fn tagging_a_non_map_wraps_it() {
        let tagged = tag_with_trial(ConfigValue::Float(0.5), 2, "2-xyz");
        assert_eq!(tagged.get("value").and_then(ConfigValue::as_f64), Some(0.5));
        assert_eq!(tag_of(&tagged), Some("2-xyz"));
    }
}
