// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    Experiment,
    Flags,
    Environ,
    Platform,
    Phase,
}

/// One append-only entry of the experiment metadata log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub experiment_id: String,
    pub kind: MetadataKind,
    pub time: u64,
    pub data: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn new(experiment_id: &str, kind: MetadataKind, data: BTreeMap<String, String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            kind,
            time: sb_util::unix_now(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json() {
        let mut data = BTreeMap::new();
        data.insert("load_points".to_string(), "10".to_string());
        let rec = MetadataRecord::new("id0", MetadataKind::Experiment, data);
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains("\"kind\":\"experiment\""));
        assert_eq!(serde_json::from_str::<MetadataRecord>(&line).unwrap(), rec);
    }
}
