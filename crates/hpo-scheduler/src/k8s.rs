//! Kubernetes-mode trial execution: render a multi-document manifest from a
//! template, `kubectl create` it, and poll pod phase through `kubectl get`.
//!
//! There is no Kubernetes client crate in the dependency stack (the teacher
//! never links one either), so this shells out to `kubectl` the same way the
//! teacher's tooling shells out to engine binaries: `Command::new` plus
//! `.status()`/`.output()`, never a library binding to the cluster API.

use std::path::{Path, PathBuf};
use std::process::Command;

use hpo_core::ConfigValue;
use serde_yaml::Value as Yaml;

use crate::error::SchedulerError;

/// A submitted (or about-to-be-submitted) Kubernetes job for one trial.
pub struct K8sJob {
    pub task_name: String,
    pub manifest_path: PathBuf,
    pub result_path: PathBuf,
    submitted: bool,
}

impl K8sJob {
    pub fn new(task_name: String, manifest_path: PathBuf, result_path: PathBuf) -> Self {
        K8sJob { task_name, manifest_path, result_path, submitted: false }
    }

    pub fn submit(&mut self) -> Result<(), SchedulerError> {
        run_kubectl(&["create", "-f", &self.manifest_path.to_string_lossy(), "--validate=false"])?;
        self.submitted = true;
        Ok(())
    }

    pub fn is_alive(&self) -> Result<bool, SchedulerError> {
        if !self.submitted {
            return Ok(false);
        }
        match self.phase()?.as_str() {
            "Succeeded" | "Failed" | "Unknown" => Ok(false),
            _ => Ok(true),
        }
    }

    /// DIJob workers run as a pod named `<task_name>-serial-0`.
    fn pod_name(&self) -> String {
        format!("{}-serial-0", self.task_name)
    }

    pub fn phase(&self) -> Result<String, SchedulerError> {
        let out = run_kubectl(&[
            "get",
            "pod",
            &self.pod_name(),
            "-o",
            "jsonpath={.status.phase}",
        ])?;
        Ok(out.trim().to_string())
    }

    /// `result.txt` lives alongside `result_path` in the same trial
    /// artifact directory.
    fn result_txt_path(&self) -> PathBuf {
        self.result_path.with_file_name("result.txt")
    }

    /// Copies the trial's declared result file out of the pod, if present.
    /// Checks the artifact's NFS-mirrored local path first; only reaches for
    /// `kubectl exec`/`kubectl cp` when no such mirror is visible. An
    /// optional sibling `result.txt` is copied and merged in the same way,
    /// per §6.
    pub fn harvest_result(&self) -> Result<Option<ConfigValue>, SchedulerError> {
        if let Ok(text) = std::fs::read_to_string(&self.result_path) {
            let json: serde_json::Value = serde_json::from_str(&text)?;
            let mut config = json_to_config(&json);
            crate::local::merge_result_txt(&mut config, &self.result_txt_path());
            return Ok(Some(config));
        }

        let pod = self.pod_name();
        let present = Command::new("kubectl")
            .args(["exec", &pod, "--", "test", "-f", "/workspace/result.json"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !present {
            return Ok(None);
        }
        let remote = format!("{pod}:/workspace/result.json");
        let status = Command::new("kubectl").args(["cp", &remote]).arg(&self.result_path).status();
        match status {
            Ok(s) if s.success() => {
                let text = std::fs::read_to_string(&self.result_path)?;
                let json: serde_json::Value = serde_json::from_str(&text)?;
                let mut config = json_to_config(&json);
                self.harvest_result_txt(&pod);
                crate::local::merge_result_txt(&mut config, &self.result_txt_path());
                Ok(Some(config))
            }
            _ => Ok(None),
        }
    }

    /// Best-effort `kubectl exec`/`kubectl cp` of the optional `result.txt`
    /// into the local mirror path so `merge_result_txt` can read it; a
    /// missing `result.txt` is normal and not an error.
    fn harvest_result_txt(&self, pod: &str) {
        let present = Command::new("kubectl")
            .args(["exec", pod, "--", "test", "-f", "/workspace/result.txt"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !present {
            return;
        }
        let remote = format!("{pod}:/workspace/result.txt");
        let _ = Command::new("kubectl").args(["cp", &remote]).arg(self.result_txt_path()).status();
    }

    pub fn teardown(&self) {
        if self.submitted {
            let _ = Command::new("kubectl").args(["delete", "-f"]).arg(&self.manifest_path).status();
        }
    }
}

impl Drop for K8sJob {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn run_kubectl(args: &[&str]) -> Result<String, SchedulerError> {
    let out = Command::new("kubectl").args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SchedulerError::KubectlMissing
        } else {
            SchedulerError::Io(e)
        }
    })?;
    if !out.status.success() {
        return Err(SchedulerError::KubectlFailed(
            "command",
            String::from_utf8_lossy(&out.stderr).to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// Patches every document in a multi-doc job template so its names are
/// unique to this trial and its config-map payload carries this trial's
/// materialized config script.
pub fn render_manifest(
    template_yaml: &str,
    task_name: &str,
    config_script: &str,
) -> Result<String, SchedulerError> {
    let mut docs: Vec<Yaml> = serde_yaml::Deserializer::from_str(template_yaml)
        .map(Yaml::deserialize)
        .collect::<Result<_, _>>()?;

    for doc in &mut docs {
        patch_names(doc, task_name);
        if is_kind(doc, "ConfigMap") {
            set_config_map_data(doc, config_script);
        }
    }

    let mut out = String::new();
    for doc in &docs {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

fn is_kind(doc: &Yaml, kind: &str) -> bool {
    doc.get("kind").and_then(Yaml::as_str) == Some(kind)
}

/// Rewrites `metadata.name` (and any `volumes[].configMap.name` reference
/// pointing at a `-config` suffixed sibling) to this trial's task name.
fn patch_names(doc: &mut Yaml, task_name: &str) {
    let is_config = is_kind(doc, "ConfigMap");
    let name = if is_config { format!("{task_name}-config") } else { task_name.to_string() };
    if let Yaml::Mapping(map) = doc {
        if let Some(Yaml::Mapping(meta_map)) = map.get_mut("metadata") {
            meta_map.insert(Yaml::String("name".to_string()), Yaml::String(name));
        }
        rewrite_config_map_refs(map, task_name);
    }
}

fn rewrite_config_map_refs(map: &mut serde_yaml::Mapping, task_name: &str) {
    for (_, v) in map.iter_mut() {
        match v {
            Yaml::Mapping(child) => {
                if child.contains_key("configMap") {
                    if let Some(Yaml::Mapping(cm)) = child.get_mut("configMap") {
                        cm.insert(
                            Yaml::String("name".to_string()),
                            Yaml::String(format!("{task_name}-config")),
                        );
                    }
                }
                rewrite_config_map_refs(child, task_name);
            }
            Yaml::Sequence(seq) => {
                for item in seq {
                    if let Yaml::Mapping(m) = item {
                        rewrite_config_map_refs(m, task_name);
                    }
                }
            }
            _ => {}
        }
    }
}

fn set_config_map_data(doc: &mut Yaml, config_script: &str) {
    if let Yaml::Mapping(map) = doc {
        let mut data = serde_yaml::Mapping::new();
        data.insert(Yaml::String("config.py".to_string()), Yaml::String(config_script.to_string()));
        map.insert(Yaml::String("data".to_string()), Yaml::Mapping(data));
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

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
apiVersion: v1\n\
kind: ConfigMap\n\
metadata:\n\
  name: placeholder-config\n\
data: {}\n\
---\n\
apiVersion: v1\n\
kind: Pod\n\
metadata:\n\
  name: placeholder\n\
spec:\n\
  containers: []\n\
  volumes:\n\
    - name: cfg\n\
      configMap:\n\
        name: placeholder-config\n\
";

    #[test]
    fn render_manifest_renames_every_document_and_injects_the_script() {
        let out = render_manifest(TEMPLATE, "hpo-task-3", "print('hi')").unwrap();
        assert!(out.contains("name: hpo-task-3-config"));
        assert!(out.contains("name: hpo-task-3\n"));
        assert!(out.contains("print('hi')"));
        assert_eq!(out.matches("hpo-task-3-config").count(), 2);
    }
}
