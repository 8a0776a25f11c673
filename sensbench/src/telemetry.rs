// Copyright (c) Facebook, Inc. and its affiliates.
//! Telemetry sessions attached to running tasks. With a collector endpoint
//! configured, sessions are tasks scheduled on the collector's REST API.
//! Without one, the load generator's output is parsed locally into a series
//! record once the run completes.
use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sensbench_intf::{MetadataKind, MetadataRecord, TAG_EXPERIMENT_ID};

use crate::errors::Error;
use crate::executor::{poll_until, TaskHandle};
use crate::metadata::MetadataStore;

const API_TIMEOUT_SECS: u64 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub type Tags = BTreeMap<String, String>;

pub trait SessionHandle: Send + Sync {
    fn name(&self) -> &str;
    fn is_running(&self) -> bool;
    fn stop(&self) -> Result<()>;
    /// Zero waits forever. Returns whether the session ended.
    fn wait(&self, timeout: Duration) -> Result<bool>;
}

pub trait SessionLauncher: Send + Sync {
    fn name(&self) -> &str;
    fn launch_session(&self, task: &dyn TaskHandle, tags: &Tags) -> Result<Box<dyn SessionHandle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Running,
    Stopped,
    Failed,
}

impl CollectorState {
    fn parse(state: &str) -> Self {
        match state {
            "Spinning" | "Firing" | "Stopping" => Self::Running,
            "Disabled" => Self::Failed,
            _ => Self::Stopped,
        }
    }
}

/// Client for the collector's v1 task API.
#[derive(Debug, Clone)]
pub struct CollectorApi {
    base: String,
}

impl CollectorApi {
    pub fn new(endpoint: &str) -> Self {
        let base = if endpoint.contains("://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn send(&self, req: minreq::Request) -> Result<Value> {
        let resp = req
            .with_timeout(API_TIMEOUT_SECS)
            .send()
            .map_err(|e| Error::ClusterApi(format!("{} ({})", &self.base, &e)))?;
        let body: Value = match resp.as_str() {
            Ok(s) if !s.trim().is_empty() => serde_json::from_str(s).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if resp.status_code < 200 || resp.status_code >= 300 {
            return Err(Error::ClusterApi(format!(
                "{} returned {} ({})",
                &self.base, resp.status_code, body["body"]["message"]
            ))
            .into());
        }
        Ok(body)
    }

    pub fn create_task(&self, task: &Value) -> Result<String> {
        let req = minreq::post(format!("{}/v1/tasks", &self.base))
            .with_json(task)
            .map_err(|e| Error::ClusterApi(format!("encoding task ({})", &e)))?;
        let body = self.send(req)?;
        match body["body"]["id"].as_str() {
            Some(id) => Ok(id.to_string()),
            None => Err(Error::ClusterApi(format!("no task id in {}", &body)).into()),
        }
    }

    /// The task's state and last failure message.
    pub fn task_state(&self, id: &str) -> Result<(CollectorState, String)> {
        let body = self.send(minreq::get(format!("{}/v1/tasks/{}", &self.base, id)))?;
        let state = body["body"]["task_state"].as_str().unwrap_or("Stopped");
        let failure = body["body"]["last_failure_message"]
            .as_str()
            .unwrap_or("")
            .to_string();
        Ok((CollectorState::parse(state), failure))
    }

    pub fn stop_task(&self, id: &str) -> Result<()> {
        self.send(minreq::put(format!("{}/v1/tasks/{}/stop", &self.base, id)))?;
        Ok(())
    }

    pub fn remove_task(&self, id: &str) -> Result<()> {
        self.send(minreq::delete(format!("{}/v1/tasks/{}", &self.base, id)))?;
        Ok(())
    }
}

/// A collection task definition. `config` items are passed to the collector
/// plugin, e.g. which file to read.
#[derive(Debug, Clone)]
pub struct CollectorSession {
    api: CollectorApi,
    pub task_name: String,
    pub metrics: Vec<String>,
    pub interval: Duration,
    pub publisher: Value,
}

impl CollectorSession {
    pub fn new(api: CollectorApi, task_name: &str, metrics: &[&str]) -> Self {
        Self {
            api,
            task_name: task_name.into(),
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
            interval: Duration::from_secs(1),
            publisher: json!({ "plugin_name": "file", "config": { "file": "/tmp/sensbench-metrics" } }),
        }
    }

    pub fn task_body(&self, tags: &Tags, config: &[(&str, &str, String)]) -> Value {
        let metrics: serde_json::Map<String, Value> =
            self.metrics.iter().map(|m| (m.clone(), json!({}))).collect();
        let mut cfg = serde_json::Map::new();
        for (ns, key, val) in config.iter() {
            let ent = cfg.entry(ns.to_string()).or_insert_with(|| json!({}));
            ent[*key] = json!(val);
        }
        json!({
            "version": 1,
            "name": &self.task_name,
            "schedule": { "type": "simple", "interval": format!("{}s", self.interval.as_secs()) },
            "start": true,
            "max-failures": 10,
            "workflow": {
                "collect": {
                    "metrics": metrics,
                    "config": cfg,
                    "tags": { "": tags },
                    "publish": [self.publisher.clone()],
                },
            },
        })
    }

    pub fn start(&self, tags: &Tags, config: &[(&str, &str, String)]) -> Result<CollectorHandle> {
        let id = self.api.create_task(&self.task_body(tags, config))?;
        info!(
            "telemetry: Started {} as {} on {}",
            &self.task_name,
            &id,
            self.api.base()
        );
        Ok(CollectorHandle {
            api: self.api.clone(),
            name: self.task_name.clone(),
            id,
        })
    }
}

pub struct CollectorHandle {
    api: CollectorApi,
    name: String,
    id: String,
}

impl CollectorHandle {
    fn state(&self) -> Result<CollectorState> {
        let (state, failure) = self.api.task_state(&self.id)?;
        if state == CollectorState::Failed {
            bail!(
                "collector task {:?} was disabled after errors: {:?}",
                &self.name,
                failure
            );
        }
        Ok(state)
    }
}

impl SessionHandle for CollectorHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        matches!(self.api.task_state(&self.id), Ok((CollectorState::Running, _)))
    }

    /// Stops and removes the task. A task the collector disabled is an error.
    fn stop(&self) -> Result<()> {
        if self.state()? == CollectorState::Running {
            self.api.stop_task(&self.id)?;
            let api = &self.api;
            let id = &self.id;
            if !poll_until(STOP_TIMEOUT, POLL_INTERVAL, || {
                !matches!(api.task_state(id), Ok((CollectorState::Running, _)))
            }) {
                return Err(Error::WaitTimeout {
                    what: format!("stopping collector task {}", &self.id),
                    timeout: STOP_TIMEOUT.as_secs_f64(),
                }
                .into());
            }
        }
        if let Err(e) = self.api.remove_task(&self.id) {
            warn!("telemetry: Failed to remove {} ({:#})", &self.id, &e);
        }
        debug!("telemetry: Stopped {}", &self.name);
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<bool> {
        let timeout = if timeout == Duration::from_secs(0) {
            Duration::from_secs(u64::MAX / 2)
        } else {
            timeout
        };
        let mut res = Ok(());
        let done = poll_until(timeout, POLL_INTERVAL, || match self.state() {
            Ok(CollectorState::Running) => false,
            Ok(_) => true,
            Err(e) => {
                res = Err(e);
                true
            }
        });
        res.map(|_| done)
    }
}

/// Collects the load generator's output file through the collector.
pub struct MutilateCollector {
    session: CollectorSession,
}

impl MutilateCollector {
    pub const METRICS: &'static [&'static str] = &[
        "/intel/swan/mutilate/*/avg",
        "/intel/swan/mutilate/*/std",
        "/intel/swan/mutilate/*/min",
        "/intel/swan/mutilate/*/percentile/5th",
        "/intel/swan/mutilate/*/percentile/10th",
        "/intel/swan/mutilate/*/percentile/90th",
        "/intel/swan/mutilate/*/percentile/95th",
        "/intel/swan/mutilate/*/percentile/99th",
        "/intel/swan/mutilate/*/qps",
    ];

    pub fn new(api: CollectorApi) -> Self {
        Self {
            session: CollectorSession::new(api, "sensbench-mutilate-session", Self::METRICS),
        }
    }
}

impl SessionLauncher for MutilateCollector {
    fn name(&self) -> &str {
        "mutilate collector"
    }

    fn launch_session(&self, task: &dyn TaskHandle, tags: &Tags) -> Result<Box<dyn SessionHandle>> {
        let stdout = task.stdout_path().to_string_lossy().to_string();
        let config = [("/intel/swan/mutilate", "stdout_file", stdout)];
        Ok(Box::new(self.session.start(tags, &config)?))
    }
}

/// Platform counters collected for as long as the aggressor runs.
pub struct AggressorCollector {
    session: CollectorSession,
}

impl AggressorCollector {
    pub const METRICS: &'static [&'static str] = &[
        "/intel/procfs/cpu/*/utilization_percentage",
        "/intel/linux/rdt/*/llc_occupancy",
        "/intel/linux/rdt/*/memory_bandwidth/*",
    ];

    pub fn new(api: CollectorApi) -> Self {
        Self {
            session: CollectorSession::new(api, "sensbench-aggressor-session", Self::METRICS),
        }
    }
}

impl SessionLauncher for AggressorCollector {
    fn name(&self) -> &str {
        "aggressor collector"
    }

    fn launch_session(&self, task: &dyn TaskHandle, tags: &Tags) -> Result<Box<dyn SessionHandle>> {
        let config = [("/intel/procfs", "task", task.name().to_string())];
        Ok(Box::new(self.session.start(tags, &config)?))
    }
}

/// One row of the mutilate latency table plus the run totals.
pub fn parse_mutilate_series(output: &str) -> Result<BTreeMap<String, f64>> {
    const COLS: &[&str] = &[
        "avg",
        "std",
        "min",
        "percentile/5th",
        "percentile/10th",
        "percentile/90th",
        "percentile/95th",
        "percentile/99th",
    ];
    let mut series = BTreeMap::new();
    for line in output.lines() {
        let mut toks = line.split_whitespace();
        match toks.next() {
            Some("read") => {
                for (col, tok) in COLS.iter().zip(toks) {
                    let val: f64 = tok
                        .parse()
                        .map_err(|_| anyhow!("invalid {} {:?} in {:?}", col, tok, line))?;
                    series.insert(col.to_string(), val);
                }
            }
            _ => {}
        }
    }
    let (qps, lat) = crate::workload::mutilate::parse_output(output)?;
    series.insert("qps".into(), qps as f64);
    series.insert("latency".into(), lat as f64);
    Ok(series)
}

/// Session which completes immediately after recording the series.
pub struct RecordedSession {
    name: String,
}

impl SessionHandle for RecordedSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        false
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn wait(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }
}

/// Parses the finished load run's output and appends it with the phase
/// tags to the metadata store. Each phase yields exactly one series.
pub struct LocalMutilateSeries {
    store: Arc<dyn MetadataStore>,
    nr_recorded: Mutex<u64>,
}

impl LocalMutilateSeries {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            nr_recorded: Mutex::new(0),
        }
    }

    pub fn nr_recorded(&self) -> u64 {
        *self.nr_recorded.lock().unwrap()
    }
}

impl SessionLauncher for LocalMutilateSeries {
    fn name(&self) -> &str {
        "local mutilate series"
    }

    fn launch_session(&self, task: &dyn TaskHandle, tags: &Tags) -> Result<Box<dyn SessionHandle>> {
        let output = fs::read_to_string(task.stdout_path())?;
        let series = parse_mutilate_series(&output)?;

        let mut data = tags.clone();
        for (k, v) in series.iter() {
            data.insert(format!("mutilate/{}", k), format!("{}", v));
        }
        let id = tags.get(TAG_EXPERIMENT_ID).cloned().unwrap_or_default();
        self.store
            .record(&MetadataRecord::new(&id, MetadataKind::Phase, data))?;
        *self.nr_recorded.lock().unwrap() += 1;

        Ok(Box::new(RecordedSession {
            name: "local mutilate series".into(),
        }))
    }
}
