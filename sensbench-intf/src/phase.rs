// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const TAG_EXPERIMENT_ID: &str = "experiment_id";
pub const TAG_PHASE_NAME: &str = "phase_name";
pub const TAG_REPETITION: &str = "repetition";
pub const TAG_LOAD_POINT_QPS: &str = "load_point_qps";
pub const TAG_AGGRESSOR_NAME: &str = "aggressor_name";

pub const BASELINE_NAME: &str = "None";

/// Tag values are emitted as comma separated lists downstream.
pub fn sanitize_tag_value(input: &str) -> String {
    input.replace(',', ";")
}

/// One leaf of a parameter sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDescriptor {
    pub experiment_id: String,
    /// `None` for the baseline phase without an aggressor.
    pub aggressor: Option<String>,
    pub repetition: u32,
    pub load_point: u32,
    pub qps: u64,
    /// Sweep parameters in the order they appear in the phase name.
    pub params: Vec<(String, String)>,
    pub extra_tags: BTreeMap<String, String>,
}

impl PhaseDescriptor {
    pub fn new(experiment_id: &str, aggressor: Option<&str>, load_point: u32, qps: u64) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            aggressor: aggressor.map(|v| v.to_string()),
            repetition: 0,
            load_point,
            qps,
            params: vec![],
            extra_tags: Default::default(),
        }
    }

    pub fn repetition(mut self, rep: u32) -> Self {
        self.repetition = rep;
        self
    }

    pub fn param<V: ToString>(mut self, key: &str, val: V) -> Self {
        self.params.push((key.into(), val.to_string()));
        self
    }

    pub fn tag<V: ToString>(mut self, key: &str, val: V) -> Self {
        self.extra_tags.insert(key.into(), val.to_string());
        self
    }

    pub fn aggressor_name(&self) -> &str {
        self.aggressor.as_deref().unwrap_or(BASELINE_NAME)
    }

    /// `"Aggressor NAME - k=v; k=v"`
    pub fn name(&self) -> String {
        let mut params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        params.push(format!("load_point={}", self.load_point));
        params.push(format!("qps={}", self.qps));
        params.push(format!("repetition={}", self.repetition));
        format!("Aggressor {} - {}", self.aggressor_name(), params.join("; "))
    }

    /// Filesystem friendly rendition of `name()`.
    pub fn dir_name(&self) -> String {
        let mut buf = String::new();
        let mut last_sep = true;
        for ch in self.name().chars() {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '=' {
                buf.push(ch);
                last_sep = false;
            } else if !last_sep {
                buf.push('_');
                last_sep = true;
            }
        }
        buf.trim_end_matches('_').to_string()
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        for (k, v) in self.params.iter().map(|(k, v)| (k, v)).chain(self.extra_tags.iter()) {
            tags.insert(k.clone(), sanitize_tag_value(v));
        }
        tags.insert(TAG_EXPERIMENT_ID.into(), sanitize_tag_value(&self.experiment_id));
        tags.insert(TAG_PHASE_NAME.into(), sanitize_tag_value(&self.name()));
        tags.insert(TAG_REPETITION.into(), self.repetition.to_string());
        tags.insert(TAG_LOAD_POINT_QPS.into(), self.qps.to_string());
        tags.insert(
            TAG_AGGRESSOR_NAME.into(),
            sanitize_tag_value(self.aggressor_name()),
        );
        tags
    }
}

impl fmt::Display for PhaseDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_name() {
        let phase = PhaseDescriptor::new("exp", None, 1, 2000);
        assert_eq!(
            phase.name(),
            "Aggressor None - load_point=1; qps=2000; repetition=0"
        );
        assert_eq!(phase.dir_name(), "Aggressor_None_-_load_point=1_qps=2000_repetition=0");

        let phase = PhaseDescriptor::new("exp", Some("l1d"), 0, 1000)
            .repetition(2)
            .param("be_cpus", "0-3,5")
            .param("be_ways", 2);
        assert_eq!(
            phase.name(),
            "Aggressor l1d - be_cpus=0-3,5; be_ways=2; load_point=0; qps=1000; repetition=2"
        );
    }

    #[test]
    fn test_phase_tags() {
        let phase = PhaseDescriptor::new("e1", Some("stress-ng-stream"), 3, 4000)
            .param("hp_cpus", "0,1")
            .tag("number_of_cores", 2);
        let tags = phase.tags();

        for pair in &[
            (TAG_EXPERIMENT_ID, "e1"),
            (TAG_REPETITION, "0"),
            (TAG_LOAD_POINT_QPS, "4000"),
            (TAG_AGGRESSOR_NAME, "stress-ng-stream"),
            ("hp_cpus", "0;1"),
            ("number_of_cores", "2"),
        ] {
            assert_eq!(tags[pair.0], pair.1);
        }
        for val in tags.values() {
            assert!(!val.contains(','));
        }
    }
}
