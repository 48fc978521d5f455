//! Materializes a trial's hyper-parameters into a runnable config script.
//!
//! A local- or k8s-mode trial runs a user-provided config file as-is, except
//! that the sampled hyper-parameters for this particular trial are spliced in
//! as a block of `main_config["key"]["nested_key"] = <literal>` assignments
//! inserted just above the file's `if __name__ == "__main__":` guard, so they
//! execute after the file's own defaults and before the file does any work
//! with them.

use hpo_core::ConfigValue;

const MAIN_GUARD: &str = "if __name__ == \"__main__\":";

/// Flattens a nested `Map`-shaped `ConfigValue` into `(bracket-path, value)`
/// pairs rooted at `prefix` (already rendered as `main_config["a"]["b"]`-style
/// dotted-dict indexing). Non-map values terminate the path.
fn flatten_dotted(prefix: &str, value: &ConfigValue, out: &mut Vec<(String, ConfigValue)>) {
    match value {
        ConfigValue::Map(m) => {
            for (k, v) in m {
                flatten_dotted(&format!("{prefix}[{k:?}]"), v, out);
            }
        }
        other => out.push((prefix.to_string(), other.clone())),
    }
}

/// Renders a `ConfigValue` the way Python would spell the equivalent literal.
fn render_py_literal(v: &ConfigValue) -> String {
    match v {
        ConfigValue::Null => "None".to_string(),
        ConfigValue::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        ConfigValue::Int(i) => i.to_string(),
        ConfigValue::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() {
                format!("{f:.1}")
            } else {
                format!("{f}")
            }
        }
        ConfigValue::Str(s) => format!("{:?}", s),
        ConfigValue::List(l) => {
            format!("[{}]", l.iter().map(render_py_literal).collect::<Vec<_>>().join(", "))
        }
        ConfigValue::Map(_) => unreachable!("flatten_dotted splits maps before rendering"),
    }
}

/// Splices this trial's hyper-parameters into `template`, tagging the result
/// with `exp_name` (unless the hyper-parameters already set one) so artifacts
/// from different trials don't collide on disk.
pub fn materialize(template: &str, hyper_params: &ConfigValue, exp_name: &str) -> String {
    let mut assignments = Vec::new();
    flatten_dotted("main_config", hyper_params, &mut assignments);

    let has_exp_name = assignments.iter().any(|(k, _)| k == "main_config[\"exp_name\"]");
    let mut lines: Vec<String> = assignments
        .iter()
        .map(|(k, v)| format!("{k} = {}", render_py_literal(v)))
        .collect();
    if !has_exp_name {
        lines.push(format!("main_config[\"exp_name\"] = {:?}", exp_name));
    }
    let block = lines.join("\n");

    match template.find(MAIN_GUARD) {
        Some(pos) => {
            let (head, tail) = template.split_at(pos);
            format!("{head}{block}\n\n{tail}")
        }
        None => format!("{template}\n\n{block}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn map(pairs: Vec<(&str, ConfigValue)>) -> ConfigValue {
        ConfigValue::Map(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<BTreeMap<_, _>>())
    }

    #[test]
    fn nested_paths_flatten_with_dots_and_insert_before_the_main_guard() {
        let params = map(vec![
            ("lr", ConfigValue::Float(0.01)),
            ("model", map(vec![("depth", ConfigValue::Int(4))])),
        ]);
        let template = "import stuff\n\nif __name__ == \"__main__\":\n    run()\n";
        let out = materialize(template, &params, "trial-1");
        assert!(out.contains("main_config[\"lr\"] = 0.01"));
        assert!(out.contains("main_config[\"model\"][\"depth\"] = 4"));
        assert!(out.contains("main_config[\"exp_name\"] = \"trial-1\""));
        assert!(out.find("main_config[\"lr\"]").unwrap() < out.find(MAIN_GUARD).unwrap());
    }

    #[test]
    fn explicit_exp_name_is_not_overridden() {
        let params = map(vec![("exp_name", ConfigValue::Str("custom".to_string()))]);
        let out = materialize("if __name__ == \"__main__\":\n    run()\n", &params, "trial-1");
        assert!(out.contains("main_config[\"exp_name\"] = \"custom\""));
        assert_eq!(out.matches("exp_name").count(), 1);
    }

    #[test]
    fn missing_guard_appends_at_end_of_file() {
        let params = map(vec![("lr", ConfigValue::Float(0.5))]);
        let out = materialize("print('hi')\n", &params, "trial-1");
        assert!(out.trim_end().ends_with("main_config[\"exp_name\"] = \"trial-1\""));
    }
}
