// Copyright (c) Facebook, Inc. and its affiliates.
//! Append-only experiment metadata. Records are kept one JSON object per
//! line so that concurrent experiments can share a file.
use anyhow::{Context, Result};
use log::debug;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sb_util::*;
use sensbench_intf::{Args, MetadataKind, MetadataRecord, ENV_PREFIX, FULL_VERSION};

pub trait MetadataStore: Send + Sync {
    fn record(&self, rec: &MetadataRecord) -> Result<()>;
}

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {:?}", parent))?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records of `experiment_id` in the order they were written.
    pub fn load(&self, experiment_id: &str) -> Result<Vec<MetadataRecord>> {
        let f = match fs::File::open(&self.path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut recs = vec![];
        for line in BufReader::new(f).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let rec: MetadataRecord = serde_json::from_str(&line)
                .with_context(|| format!("parsing {:?}", &self.path))?;
            if rec.experiment_id == experiment_id {
                recs.push(rec);
            }
        }
        Ok(recs)
    }
}

impl MetadataStore for FileStore {
    fn record(&self, rec: &MetadataRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut line = serde_json::to_string(rec)?;
        line.push('\n');
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {:?}", &self.path))?;
        f.write_all(line.as_bytes())?;
        debug!("metadata: {:?} record for {}", rec.kind, &rec.experiment_id);
        Ok(())
    }
}

/// Every resolved flag as the JSON value it serializes to.
pub fn flags_data(args: &Args) -> Result<BTreeMap<String, String>> {
    let val = serde_json::to_value(args)?;
    let mut data = BTreeMap::new();
    if let Some(map) = val.as_object() {
        for (k, v) in map.iter() {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            data.insert(k.clone(), v);
        }
    }
    Ok(data)
}

/// The environment variables which may have configured this run, minus
/// credentials.
pub fn environ_data() -> BTreeMap<String, String> {
    env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX) && !Args::is_secret_env(k))
        .collect()
}

pub fn platform_data() -> BTreeMap<String, String> {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu();
    sys.refresh_memory();

    let mut data = BTreeMap::new();
    data.insert("hostname".into(), HOSTNAME.clone());
    data.insert("version".into(), FULL_VERSION.clone());
    data.insert(
        "kernel".into(),
        sysinfo::System::kernel_version().unwrap_or_default(),
    );
    data.insert(
        "os".into(),
        sysinfo::System::long_os_version().unwrap_or_default(),
    );
    if let Some(cpu) = sys.cpus().first() {
        data.insert("cpu_model".into(), cpu.brand().trim().to_string());
    }
    data.insert("nr_cpus".into(), NR_SYSTEM_CPUS.to_string());
    data.insert("memory".into(), sys.total_memory().to_string());
    data.insert("time".into(), format_unix_time(unix_now()));
    data
}

/// Records the experiment header: flags, environment and platform.
pub fn record_experiment(
    store: &dyn MetadataStore,
    experiment_id: &str,
    args: &Args,
) -> Result<()> {
    let mut exp = BTreeMap::new();
    exp.insert("sweep".to_string(), args.sweep.to_string());
    exp.insert("dir".to_string(), args.dir.clone());
    exp.insert("hostname".to_string(), HOSTNAME.clone());
    for (kind, data) in vec![
        (MetadataKind::Experiment, exp),
        (MetadataKind::Flags, flags_data(args)?),
        (MetadataKind::Environ, environ_data()),
        (MetadataKind::Platform, platform_data()),
    ]
    .into_iter()
    {
        store.record(&MetadataRecord::new(experiment_id, kind, data))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("sub/metadata.jsonl")).unwrap();
        assert!(store.load("a").unwrap().is_empty());

        let mut args = Args::default();
        args.load_points = 3;
        record_experiment(&store, "a", &args).unwrap();
        store
            .record(&MetadataRecord::new("b", MetadataKind::Phase, BTreeMap::new()))
            .unwrap();

        let recs = store.load("a").unwrap();
        let kinds: Vec<MetadataKind> = recs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MetadataKind::Experiment,
                MetadataKind::Flags,
                MetadataKind::Environ,
                MetadataKind::Platform
            ]
        );
        assert_eq!(recs[1].data["load_points"], "3");
        assert_eq!(recs[1].data["dir"], "sensbench-out");
        assert_eq!(recs[3].data["hostname"], *HOSTNAME);
        assert_eq!(store.load("b").unwrap().len(), 1);
    }

    #[test]
    fn test_credentials_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("metadata.jsonl")).unwrap();

        let mut args = Args::default();
        args.kube_username = Some("admin".into());
        args.kube_password = Some("hunter2".into());
        env::set_var("SENSBENCH_KUBE_PASSWORD", "hunter2");
        let res = record_experiment(&store, "c", &args);
        env::remove_var("SENSBENCH_KUBE_PASSWORD");
        res.unwrap();

        let recs = store.load("c").unwrap();
        assert_eq!(recs[1].kind, MetadataKind::Flags);
        assert_eq!(recs[1].data["kube_username"], "admin");
        assert!(!recs[1].data.contains_key("kube_password"));
        assert!(!fs::read_to_string(store.path()).unwrap().contains("hunter2"));
    }
}
