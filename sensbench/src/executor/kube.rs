// Copyright (c) Facebook, Inc. and its affiliates.
//! Pods created through the cluster REST API. A watcher thread per pod polls
//! its phase, copies the logs into the stdout file once the pod finishes and
//! completes the handle when the pod is gone or done.
use anyhow::Result;
use base64::Engine;
use crossbeam::channel::{self, RecvTimeoutError};
use log::{debug, info, trace, warn};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sb_util::*;
use sensbench_intf::Args;

use super::{
    exit_code_of, Completion, Executor, OutputFiles, TaskExit, TaskHandle, TaskState,
    DFL_STOP_GRACE,
};
use crate::errors::Error;
use crate::isolation::resource::Attachment;
use crate::isolation::{decorate, Decorators, IsolationRegistry, IsolationResource, ResourceId};

const API_TIMEOUT_SECS: u64 = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLL_ERRORS: u32 = 20;

pub const HP_POD_PREFIX: &str = "sensbench-hp";
pub const BE_POD_PREFIX: &str = "sensbench-be";

/// Thin client for the pod endpoints of the core v1 API.
#[derive(Debug, Clone)]
pub struct KubeApi {
    base: String,
    namespace: String,
    auth: Option<String>,
}

impl KubeApi {
    pub fn new(
        address: &str,
        namespace: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let base = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let auth = username.map(|user| {
            let cred = format!("{}:{}", user, password.unwrap_or(""));
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(cred.as_bytes())
            )
        });
        Self {
            base,
            namespace: namespace.into(),
            auth,
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods{}",
            &self.base, &self.namespace, suffix
        )
    }

    fn send(&self, req: minreq::Request) -> Result<minreq::Response> {
        let req = match self.auth.as_ref() {
            Some(auth) => req.with_header("Authorization", auth.as_str()),
            None => req,
        };
        req.with_timeout(API_TIMEOUT_SECS)
            .send()
            .map_err(|e| Error::ClusterApi(format!("{} ({})", &self.base, &e)).into())
    }

    fn check(resp: &minreq::Response, what: &str) -> Result<()> {
        if resp.status_code >= 200 && resp.status_code < 300 {
            return Ok(());
        }
        Err(Error::ClusterApi(format!(
            "{} failed with {} {}: {}",
            what,
            resp.status_code,
            &resp.reason_phrase,
            resp.as_str().unwrap_or("").trim()
        ))
        .into())
    }

    pub fn create_pod(&self, spec: &Value) -> Result<()> {
        let req = minreq::post(self.url(""))
            .with_header("Content-Type", "application/json")
            .with_json(spec)
            .map_err(|e| Error::ClusterApi(format!("encoding pod spec ({})", &e)))?;
        let resp = self.send(req)?;
        Self::check(&resp, "creating pod")
    }

    /// `None` if the pod doesn't exist.
    pub fn pod(&self, name: &str) -> Result<Option<Value>> {
        let resp = self.send(minreq::get(self.url(&format!("/{}", name))))?;
        if resp.status_code == 404 {
            return Ok(None);
        }
        Self::check(&resp, &format!("getting pod {}", name))?;
        let pod: Value = resp
            .json()
            .map_err(|e| Error::ClusterApi(format!("parsing pod {} ({})", name, &e)))?;
        Ok(Some(pod))
    }

    /// Deletes immediately. A missing pod is not an error.
    pub fn delete_pod(&self, name: &str) -> Result<()> {
        let resp = self.send(minreq::delete(
            self.url(&format!("/{}?gracePeriodSeconds=0", name)),
        ))?;
        if resp.status_code == 404 {
            return Ok(());
        }
        Self::check(&resp, &format!("deleting pod {}", name))?;
        debug!("kube: Deleted pod {}", name);
        Ok(())
    }

    pub fn logs(&self, name: &str) -> Result<String> {
        let resp = self.send(minreq::get(self.url(&format!("/{}/log", name))))?;
        Self::check(&resp, &format!("fetching logs of {}", name))?;
        Ok(resp
            .as_str()
            .map_err(|e| Error::ClusterApi(format!("logs of {} ({})", name, &e)))?
            .to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn of(pod: &Value) -> Self {
        match pod["status"]["phase"].as_str() {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    fn is_finished(&self) -> bool {
        *self == Self::Succeeded || *self == Self::Failed
    }
}

/// Exit code of the first container's terminated state, falling back to the
/// last terminated state.
pub fn pod_exit_code(pod: &Value) -> Option<i32> {
    let cs = &pod["status"]["containerStatuses"][0];
    for state in &["state", "lastState"] {
        if let Some(code) = cs[*state]["terminated"]["exitCode"].as_i64() {
            return Some(code as i32);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct KubeConfig {
    pub address: String,
    pub namespace: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub image: String,
    pub name_prefix: String,
    pub node: Option<String>,
    /// Millicores, 0 means unset.
    pub cpu_request: u64,
    pub cpu_limit: u64,
    /// Bytes, 0 means unset.
    pub memory_request: u64,
    pub memory_limit: u64,
    pub privileged: bool,
    pub host_network: bool,
    pub launch_timeout: Duration,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".into(),
            namespace: "default".into(),
            username: None,
            password: None,
            image: "sensbench-workloads:latest".into(),
            name_prefix: "sensbench".into(),
            node: None,
            cpu_request: 0,
            cpu_limit: 0,
            memory_request: 0,
            memory_limit: 0,
            privileged: false,
            host_network: false,
            launch_timeout: Duration::from_secs(0),
        }
    }
}

impl KubeConfig {
    fn from_args_common(args: &Args, prefix: &str) -> Self {
        Self {
            address: args.kube_address.clone(),
            namespace: args.kube_namespace.clone(),
            username: args.kube_username.clone(),
            password: args.kube_password.clone(),
            image: args.kube_image.clone(),
            name_prefix: prefix.into(),
            node: Some(args.kube_node.clone().unwrap_or_else(|| HOSTNAME.clone())),
            privileged: true,
            host_network: true,
            launch_timeout: Duration::from_secs_f64(args.kube_launch_timeout),
            ..Default::default()
        }
    }

    /// HP pods request the configured cpu and memory. Limits are set equal
    /// to the requests for the guaranteed class, burstable otherwise.
    pub fn hp(args: &Args) -> Self {
        let mut cfg = Self::from_args_common(args, HP_POD_PREFIX);
        cfg.cpu_request = args.kube_hp_cpu;
        cfg.memory_request = args.kube_hp_memory;
        if args.kube_hp_guaranteed {
            cfg.cpu_limit = args.kube_hp_cpu;
            cfg.memory_limit = args.kube_hp_memory;
        }
        cfg
    }

    /// BE pods carry no resources and thus run in the best-effort class.
    pub fn be(args: &Args) -> Self {
        Self::from_args_common(args, BE_POD_PREFIX)
    }

    pub fn api(&self) -> KubeApi {
        KubeApi::new(
            &self.address,
            &self.namespace,
            self.username.as_deref(),
            self.password.as_deref(),
        )
    }

    fn resources(&self) -> Value {
        let list = |cpu: u64, mem: u64| {
            let mut map = serde_json::Map::new();
            if cpu > 0 {
                map.insert("cpu".into(), json!(format!("{}m", cpu)));
            }
            if mem > 0 {
                map.insert("memory".into(), json!(mem.to_string()));
            }
            Value::Object(map)
        };
        json!({
            "requests": list(self.cpu_request, self.memory_request),
            "limits": list(self.cpu_limit, self.memory_limit),
        })
    }

    pub fn pod_spec(&self, name: &str, command: &str) -> Value {
        let mut spec = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "labels": { "app": "sensbench", "sensbench-role": &self.name_prefix },
            },
            "spec": {
                "restartPolicy": "Never",
                "terminationGracePeriodSeconds": 0,
                "hostNetwork": self.host_network,
                "containers": [{
                    "name": "sensbench",
                    "image": &self.image,
                    "command": ["sh", "-c", command],
                    "resources": self.resources(),
                    "securityContext": { "privileged": self.privileged },
                }],
            },
        });
        if let Some(node) = self.node.as_ref() {
            spec["spec"]["nodeSelector"] = json!({ "kubernetes.io/hostname": node });
        }
        spec
    }
}

pub struct KubeExecutor {
    cfg: KubeConfig,
    api: KubeApi,
    decorators: Decorators,
    output_root: PathBuf,
    registry: Arc<IsolationRegistry>,
    resources: Vec<ResourceId>,
    stop_grace: Duration,
}

impl KubeExecutor {
    pub fn new<P: AsRef<Path>>(
        cfg: KubeConfig,
        output_root: P,
        registry: Arc<IsolationRegistry>,
    ) -> Self {
        Self {
            api: cfg.api(),
            cfg,
            decorators: vec![],
            output_root: output_root.as_ref().to_path_buf(),
            registry,
            resources: vec![],
            stop_grace: DFL_STOP_GRACE,
        }
    }

    pub fn decorators(mut self, decorators: Decorators) -> Self {
        self.decorators = decorators;
        self
    }

    pub fn resources(mut self, ids: &[ResourceId]) -> Self {
        self.resources = ids.to_vec();
        self
    }

    fn pod_name(&self) -> String {
        format!("{}-{:08x}", &self.cfg.name_prefix, rand::random::<u32>())
    }

    /// Creates the pod and waits for it to run. Returns the completion the
    /// watcher fills in and the pod address.
    fn start(
        &self,
        name: &str,
        decorated: &str,
        files: &OutputFiles,
        attachment: &mut Attachment,
    ) -> Result<(Arc<Completion>, String)> {
        self.api.create_pod(&self.cfg.pod_spec(name, decorated))?;
        info!("kube: Created pod {} running {:?}", name, decorated);

        let id = self.registry.register(IsolationResource::Pod {
            api: self.api.clone(),
            name: name.to_string(),
        });
        attachment.push_owned(id)?;

        let completion = Arc::new(Completion::new());
        let quit = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::bounded::<Launched>(1);
        let watcher = Watcher {
            api: self.api.clone(),
            name: name.to_string(),
            stdout: files.stdout.clone(),
            completion: completion.clone(),
            quit: quit.clone(),
            launched: tx,
        };
        thread::Builder::new()
            .name(format!("kube-{}", name))
            .spawn(move || watcher.run())?;

        let launched = if self.cfg.launch_timeout.as_secs_f64() > 0.0 {
            rx.recv_timeout(self.cfg.launch_timeout)
        } else {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };
        match launched {
            Ok(addr) => Ok((completion, addr.unwrap_or_default())),
            Err(e) => {
                quit.store(true, Ordering::Relaxed);
                Err(Error::launch(
                    decorated,
                    format!(
                        "pod {} didn't start in {} ({:?})",
                        name,
                        format_duration(self.cfg.launch_timeout.as_secs_f64()),
                        &e
                    ),
                )
                .into())
            }
        }
    }
}

/// Sent once by the watcher: the pod's address when it started running or
/// `None` if it finished or vanished before.
type Launched = Option<String>;

struct Watcher {
    api: KubeApi,
    name: String,
    stdout: PathBuf,
    completion: Arc<Completion>,
    quit: Arc<AtomicBool>,
    launched: channel::Sender<Launched>,
}

impl Watcher {
    fn copy_logs(&self) {
        match self.api.logs(&self.name) {
            Ok(logs) => {
                if let Err(e) = fs::write(&self.stdout, logs.as_bytes()) {
                    warn!("kube: Failed to write logs of {} ({})", &self.name, &e);
                }
            }
            Err(e) => warn!("kube: {:#}", &e),
        }
    }

    fn run(self) {
        let mut nr_errors = 0;
        let mut running = false;
        let exit = loop {
            if self.quit.load(Ordering::Relaxed) {
                break TaskExit::Unknown;
            }
            let pod = match self.api.pod(&self.name) {
                Ok(Some(v)) => v,
                Ok(None) => {
                    debug!("kube: Pod {} is gone", &self.name);
                    break TaskExit::Unknown;
                }
                Err(e) => {
                    nr_errors += 1;
                    warn!("kube: Polling {} failed ({:#})", &self.name, &e);
                    if nr_errors >= MAX_POLL_ERRORS {
                        break TaskExit::Unknown;
                    }
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            nr_errors = 0;

            let phase = PodPhase::of(&pod);
            trace!("kube: {} is {:?}", &self.name, phase);
            if phase == PodPhase::Running && !running {
                running = true;
                let addr = pod["status"]["podIP"]
                    .as_str()
                    .or(pod["status"]["hostIP"].as_str())
                    .unwrap_or("")
                    .to_string();
                let _ = self.launched.send(Some(addr));
            }
            if phase.is_finished() {
                self.copy_logs();
                break match pod_exit_code(&pod) {
                    Some(code) => TaskExit::Code(code),
                    None => TaskExit::Unknown,
                };
            }
            thread::sleep(POLL_INTERVAL);
        };

        if !running {
            let _ = self.launched.send(None);
        }
        debug!("kube: {} finished {:?}", &self.name, exit);
        self.completion.complete(exit);
    }
}

impl Executor for KubeExecutor {
    fn name(&self) -> &str {
        "kubernetes"
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        let decorated = decorate(&self.decorators, command);
        let name = self.pod_name();
        let files = OutputFiles::create(&self.output_root, "kube", command)?;
        let mut attachment = match Attachment::acquire(&self.registry, &self.resources) {
            Ok(v) => v,
            Err(e) => {
                let _ = files.erase();
                return Err(e);
            }
        };

        let (completion, address) = match self.start(&name, &decorated, &files, &mut attachment) {
            Ok(v) => v,
            Err(e) => {
                let _ = attachment.release();
                let _ = files.erase();
                return Err(e);
            }
        };

        Ok(Box::new(KubeTaskHandle {
            command: decorated,
            pod: name,
            api: self.api.clone(),
            address,
            completion,
            files,
            attachment,
            stopped: AtomicBool::new(false),
            stop_grace: self.stop_grace,
        }))
    }
}


pub struct KubeTaskHandle {
    command: String,
    pod: String,
    api: KubeApi,
    address: String,
    completion: Arc<Completion>,
    files: OutputFiles,
    attachment: Attachment,
    stopped: AtomicBool,
    stop_grace: Duration,
}

impl TaskHandle for KubeTaskHandle {
    fn name(&self) -> &str {
        &self.command
    }

    fn status(&self) -> TaskState {
        if self.completion.is_done() {
            TaskState::Terminated
        } else {
            TaskState::Running
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.completion.wait(timeout)
    }

    fn stop(&self) -> Result<()> {
        if self.completion.is_done() {
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        match self.api.logs(&self.pod) {
            Ok(logs) => fs::write(&self.files.stdout, logs.as_bytes())?,
            Err(e) => warn!("kube: {:#}", &e),
        }
        self.api.delete_pod(&self.pod)?;
        if !self.completion.wait(self.stop_grace + POLL_INTERVAL * 2) {
            return Err(Error::ClusterApi(format!("pod {} still exists after delete", &self.pod)).into());
        }
        Ok(())
    }

    fn exit_code(&self) -> Result<i32> {
        exit_code_of(
            &self.command,
            self.completion.exit(),
            self.stopped.load(Ordering::SeqCst),
        )
    }

    fn clean(&self) -> Result<()> {
        self.attachment.release()
    }

    fn erase_output(&self) -> Result<()> {
        self.files.erase()
    }

    fn stdout_path(&self) -> &Path {
        &self.files.stdout
    }

    fn stderr_path(&self) -> &Path {
        &self.files.stderr
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_urls() {
        for pair in &[
            ("127.0.0.1:8080", "http://127.0.0.1:8080/api/v1/namespaces/ns/pods/p"),
            ("https://kube:6443/", "https://kube:6443/api/v1/namespaces/ns/pods/p"),
        ] {
            let api = KubeApi::new(pair.0, "ns", None, None);
            assert_eq!(api.url("/p"), pair.1);
        }
        let api = KubeApi::new("k", "default", Some("admin"), Some("secret"));
        assert_eq!(api.auth.as_deref(), Some("Basic YWRtaW46c2VjcmV0"));
    }

    #[test]
    fn test_pod_spec() {
        let mut args = Args::default();
        args.kube_node = Some("node-1".into());
        args.kube_hp_cpu = 4000;
        args.kube_hp_memory = 1 << 30;

        let hp = KubeConfig::hp(&args);
        let spec = hp.pod_spec("sensbench-hp-0000abcd", "memcached -p 11211");
        assert_eq!(spec["metadata"]["name"], "sensbench-hp-0000abcd");
        assert_eq!(spec["spec"]["restartPolicy"], "Never");
        assert_eq!(spec["spec"]["terminationGracePeriodSeconds"], 0);
        assert_eq!(spec["spec"]["hostNetwork"], true);
        assert_eq!(spec["spec"]["nodeSelector"]["kubernetes.io/hostname"], "node-1");
        let ctr = &spec["spec"]["containers"][0];
        assert_eq!(ctr["command"], json!(["sh", "-c", "memcached -p 11211"]));
        assert_eq!(ctr["securityContext"]["privileged"], true);
        assert_eq!(ctr["resources"]["requests"]["cpu"], "4000m");
        assert_eq!(ctr["resources"]["requests"]["memory"], "1073741824");
        assert_eq!(ctr["resources"]["limits"], json!({}));

        args.kube_hp_guaranteed = true;
        let spec = KubeConfig::hp(&args).pod_spec("x", "y");
        let res = &spec["spec"]["containers"][0]["resources"];
        assert_eq!(res["limits"], res["requests"]);

        let be = KubeConfig::be(&args);
        assert_eq!(be.name_prefix, BE_POD_PREFIX);
        let spec = be.pod_spec("x", "y");
        assert_eq!(spec["spec"]["containers"][0]["resources"]["requests"], json!({}));
    }

    #[test]
    fn test_pod_status() {
        let pod = json!({
            "status": {
                "phase": "Failed",
                "containerStatuses": [{ "state": { "terminated": { "exitCode": 3 } } }],
            }
        });
        assert_eq!(PodPhase::of(&pod), PodPhase::Failed);
        assert_eq!(pod_exit_code(&pod), Some(3));

        let pod = json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "state": { "running": {} },
                    "lastState": { "terminated": { "exitCode": 137 } },
                }],
            }
        });
        assert_eq!(PodPhase::of(&pod), PodPhase::Running);
        assert_eq!(pod_exit_code(&pod), Some(137));
        assert_eq!(pod_exit_code(&json!({})), None);
        assert_eq!(PodPhase::of(&json!({})), PodPhase::Unknown);
    }

    #[test]
    fn test_api_unreachable() {
        let api = KubeApi::new("127.0.0.1:1", "default", None, None);
        match api.pod("p").unwrap_err().downcast_ref::<Error>() {
            Some(Error::ClusterApi(_)) => {}
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn test_launch_failure_leaves_no_output() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let reg = IsolationRegistry::new();
        let cfg = KubeConfig {
            address: "127.0.0.1:1".into(),
            ..Default::default()
        };
        let exec = KubeExecutor::new(cfg, dir.path(), reg.clone());

        match exec.execute("echo output").err().unwrap().downcast_ref::<Error>() {
            Some(Error::ClusterApi(_)) => {}
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(reg.is_empty());
    }

    /// Needs a cluster API server on the default address.
    #[test]
    #[ignore]
    fn test_pod_lifecycle() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let reg = IsolationRegistry::new();
        let cfg = KubeConfig {
            image: "busybox".into(),
            launch_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let exec = KubeExecutor::new(cfg, dir.path(), reg.clone());

        let handle = exec.execute("echo output; exit 3").unwrap();
        assert!(handle.wait(Duration::from_secs(0)));
        assert_eq!(handle.exit_code().unwrap(), 3);
        assert!(fs::read_to_string(handle.stdout_path())
            .unwrap()
            .contains("output"));
        handle.clean().unwrap();
        assert!(reg.is_empty());

        let handle = exec.execute("sleep 600").unwrap();
        handle.stop().unwrap();
        assert_eq!(handle.exit_code().unwrap(), -1);
        handle.clean().unwrap();
    }
}
