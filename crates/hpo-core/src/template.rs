//! Structural composition of [`HyperValue`]s into a nested configuration tree.
//!
//! Mirrors `lighttuner.hpo.space.struct_values`: a user describes a search
//! space as an arbitrarily nested tree of dicts/lists/leaves, and this module
//! flattens it into an ordered vector of `HyperValue`s (what the algorithms
//! actually iterate over) plus a reconstruction function that rebuilds the
//! original tree shape from a vector of sampled scalars.

use crate::value::HyperValue;
use serde_json::Number;
use std::collections::BTreeMap;

/// A loosely-typed value living in a trial's `config` or `metrics` tree,
/// standing in for "whatever JSON-ish value the user's evaluation function
/// reads or returns".
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Int(i) => Some(*i as f64),
            ConfigValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn index(&self, i: usize) -> Option<&ConfigValue> {
        match self {
            ConfigValue::List(v) => v.get(i),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
            ConfigValue::Int(i) => serde_json::Value::Number((*i).into()),
            ConfigValue::Float(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ConfigValue::Str(s) => serde_json::Value::String(s.clone()),
            ConfigValue::List(v) => serde_json::Value::Array(v.iter().map(|x| x.to_json()).collect()),
            ConfigValue::Map(m) => {
                serde_json::Value::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

/// A tree of [`HyperValue`]s (leaves), constants, lists, and maps describing
/// an entire trial's configuration shape.
#[derive(Clone)]
pub enum SpaceTemplate {
    Leaf(HyperValue),
    /// `choice(seq)`: a `Fixed` hyper-value drawing a raw index, paired with
    /// the `seq` of arbitrary (non-numeric) options it indexes into.
    Choice(HyperValue, Vec<ConfigValue>),
    Const(ConfigValue),
    Seq(Vec<SpaceTemplate>),
    Map(Vec<(String, SpaceTemplate)>),
}

impl SpaceTemplate {
    pub fn leaf(hv: HyperValue) -> Self {
        SpaceTemplate::Leaf(hv)
    }

    pub fn choice(hv: HyperValue, options: Vec<ConfigValue>) -> Self {
        SpaceTemplate::Choice(hv, options)
    }

    /// Flatten into the ordered list of `HyperValue` leaves the algorithms
    /// iterate over, in depth-first, left-to-right order.
    pub fn leaves(&self) -> Vec<HyperValue> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<HyperValue>) {
        match self {
            SpaceTemplate::Leaf(hv) => out.push(hv.clone()),
            SpaceTemplate::Choice(hv, _) => out.push(hv.clone()),
            SpaceTemplate::Const(_) => {}
            SpaceTemplate::Seq(items) => items.iter().for_each(|t| t.collect_leaves(out)),
            SpaceTemplate::Map(entries) => entries.iter().for_each(|(_, t)| t.collect_leaves(out)),
        }
    }

    /// Rebuild a `ConfigValue` tree from one already-`trans`-applied scalar
    /// per leaf, consumed in the same depth-first order `leaves()` produced.
    pub fn reconstruct(&self, values: &[f64]) -> ConfigValue {
        let mut cursor = 0usize;
        let result = self.reconstruct_from(values, &mut cursor);
        debug_assert_eq!(cursor, values.len(), "reconstruct must consume every sampled value");
        result
    }

    fn reconstruct_from(&self, values: &[f64], cursor: &mut usize) -> ConfigValue {
        match self {
            SpaceTemplate::Leaf(_) => {
                let x = values[*cursor];
                *cursor += 1;
                if x.fract() == 0.0 && x.is_finite() {
                    ConfigValue::Int(x as i64)
                } else {
                    ConfigValue::Float(x)
                }
            }
            SpaceTemplate::Choice(_, options) => {
                let x = values[*cursor];
                *cursor += 1;
                let last = options.len().saturating_sub(1) as f64;
                let idx = x.round().clamp(0.0, last.max(0.0)) as usize;
                options[idx].clone()
            }
            SpaceTemplate::Const(v) => v.clone(),
            SpaceTemplate::Seq(items) => {
                ConfigValue::List(items.iter().map(|t| t.reconstruct_from(values, cursor)).collect())
            }
            SpaceTemplate::Map(entries) => ConfigValue::Map(
                entries
                    .iter()
                    .map(|(k, t)| (k.clone(), t.reconstruct_from(values, cursor)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::uniform;

    #[test]
    fn flatten_then_reconstruct_round_trips_shape() {
        let tpl = SpaceTemplate::Map(vec![
            ("lr".to_string(), SpaceTemplate::Leaf(uniform(0.0, 1.0).unwrap())),
            (
                "nested".to_string(),
                SpaceTemplate::Seq(vec![
                    SpaceTemplate::Leaf(uniform(0.0, 1.0).unwrap()),
                    SpaceTemplate::Const(ConfigValue::Str("fixed".to_string())),
                ]),
            ),
        ]);
        assert_eq!(tpl.leaves().len(), 2);
        let rebuilt = tpl.reconstruct(&[0.5, 0.25]);
        let ConfigValue::Map(m) = rebuilt else { panic!("expected map") };
        assert_eq!(m.get("lr").unwrap().as_f64(), Some(0.5));
        let ConfigValue::List(l) = m.get("nested").unwrap() else { panic!("expected list") };
        assert_eq!(l[0].as_f64(), Some(0.25));
        assert_eq!(l[1], ConfigValue::Str("fixed".to_string()));
    }

    #[test]
    fn choice_resolves_to_the_seq_element_at_the_drawn_index() {
        use crate::value::choice;
        let options = vec![
            ConfigValue::Str("a".to_string()),
            ConfigValue::Str("b".to_string()),
            ConfigValue::Str("c".to_string()),
        ];
        let tpl = SpaceTemplate::choice(choice(3).unwrap(), options);
        assert_eq!(tpl.reconstruct(&[0.0]), ConfigValue::Str("a".to_string()));
        assert_eq!(tpl.reconstruct(&[2.0]), ConfigValue::Str("c".to_string()));
    }
}
