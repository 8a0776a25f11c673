// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::fs;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{
    exit_code_of, log_output, Completion, Executor, OutputFiles, TaskExit, TaskHandle, TaskState,
    DFL_STOP_GRACE,
};
use crate::errors::Error;
use crate::isolation::resource::Attachment;
use crate::isolation::{decorate, Decorators, IsolationRegistry, ResourceId};

const LAUNCH_CHECK_DELAY: Duration = Duration::from_millis(100);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Live members of process group `pgid`. Zombies are left out, they only
/// wait for whoever inherited them to reap them.
fn group_members(pgid: i32) -> Vec<i32> {
    let procs = match procfs::process::all_processes() {
        Ok(v) => v,
        Err(e) => {
            warn!("local: Failed to list processes ({})", &e);
            return vec![];
        }
    };
    procs
        .filter_map(|p| p.ok())
        .filter_map(|p| p.stat().ok())
        .filter(|stat| stat.pgrp == pgid && stat.state != 'Z')
        .map(|stat| stat.pid)
        .collect()
}

/// Runs commands through `sh -c` in their own process group.
pub struct LocalExecutor {
    decorators: Decorators,
    output_root: PathBuf,
    registry: Arc<IsolationRegistry>,
    resources: Vec<ResourceId>,
    stop_grace: Duration,
    output_lines: usize,
}

impl LocalExecutor {
    pub fn new<P: AsRef<Path>>(output_root: P, registry: Arc<IsolationRegistry>) -> Self {
        Self {
            decorators: vec![],
            output_root: output_root.as_ref().to_path_buf(),
            registry,
            resources: vec![],
            stop_grace: DFL_STOP_GRACE,
            output_lines: 5,
        }
    }

    pub fn decorators(mut self, decorators: Decorators) -> Self {
        self.decorators = decorators;
        self
    }

    /// Isolation resources every launched task holds a reference to.
    pub fn resources(mut self, ids: &[ResourceId]) -> Self {
        self.resources = ids.to_vec();
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn output_lines(mut self, nr: usize) -> Self {
        self.output_lines = nr;
        self
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        let decorated = decorate(&self.decorators, command);
        let files = OutputFiles::create(&self.output_root, "local", command)?;
        let attachment = match Attachment::acquire(&self.registry, &self.resources) {
            Ok(v) => v,
            Err(e) => {
                let _ = files.erase();
                return Err(e);
            }
        };

        let spawn = || -> Result<std::process::Child> {
            Ok(Command::new("sh")
                .arg("-c")
                .arg(&decorated)
                .stdin(Stdio::null())
                .stdout(fs::File::create(&files.stdout)?)
                .stderr(fs::File::create(&files.stderr)?)
                .process_group(0)
                .spawn()?)
        };
        let mut child = match spawn() {
            Ok(v) => v,
            Err(e) => {
                let _ = attachment.release();
                let _ = files.erase();
                return Err(Error::launch(&decorated, format!("{:#}", &e)).into());
            }
        };

        let pid = child.id();
        info!("local: Started [{}] {:?}", pid, &decorated);
        debug!("local: output in {:?}", &files.dir);

        let completion = Arc::new(Completion::new());
        let comp = completion.clone();
        let waiter_cmd = decorated.clone();
        let reaper = thread::Builder::new()
            .name(format!("local-{}", pid))
            .spawn(move || {
                let exit = match child.wait() {
                    Ok(status) => match status.code() {
                        Some(code) => TaskExit::Code(code),
                        None => TaskExit::Code(128 + status.signal().unwrap_or(0)),
                    },
                    Err(e) => {
                        warn!("local: Failed to wait for {:?} ({})", &waiter_cmd, &e);
                        TaskExit::Unknown
                    }
                };
                debug!("local: [{}] exited {:?}", pid, exit);
                comp.complete(exit);
            });
        if let Err(e) = reaper {
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
            let _ = attachment.release();
            let _ = files.erase();
            return Err(Error::launch(&decorated, format!("no reaper thread ({})", &e)).into());
        }

        let handle = LocalTaskHandle {
            command: decorated,
            pid,
            completion,
            files,
            attachment,
            stopped: AtomicBool::new(false),
            stop_grace: self.stop_grace,
        };

        // Commands which fail right away are most often misconfigured, make
        // it visible early. The handle is still handed back.
        if handle.wait(LAUNCH_CHECK_DELAY) {
            if let Ok(code) = handle.exit_code() {
                if code != 0 {
                    warn!("local: {:?} failed right after launch", &handle.command);
                    log_output(&handle, self.output_lines);
                }
            }
        }

        Ok(Box::new(handle))
    }
}

pub struct LocalTaskHandle {
    command: String,
    pid: u32,
    completion: Arc<Completion>,
    files: OutputFiles,
    attachment: Attachment,
    stopped: AtomicBool,
    stop_grace: Duration,
}

impl LocalTaskHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn signal_group(&self, sig: libc::c_int) {
        if unsafe { libc::killpg(self.pid as libc::pid_t, sig) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                debug!("local: killpg({}, {}) failed ({})", self.pid, sig, &err);
            }
        }
    }

    fn group_gone(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if group_members(self.pid as i32).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(GROUP_POLL_INTERVAL);
        }
    }
}

impl TaskHandle for LocalTaskHandle {
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

    /// Background children can outlive `sh`, so the whole group is taken
    /// down even when the leader already exited.
    fn stop(&self) -> Result<()> {
        let running = self
            .completion
            .if_running(|| self.stopped.store(true, Ordering::SeqCst));

        if !group_members(self.pid as i32).is_empty() {
            debug!("local: Sending SIGTERM to group [{}]", self.pid);
            self.signal_group(libc::SIGTERM);
            if !self.group_gone(self.stop_grace) {
                warn!(
                    "local: Group [{}] didn't exit in {:?} after SIGTERM, sending SIGKILL",
                    self.pid, self.stop_grace
                );
                self.signal_group(libc::SIGKILL);
                if !self.group_gone(KILL_REAP_TIMEOUT) {
                    bail!("failed to kill group [{}] {:?}", self.pid, &self.command);
                }
            }
        }

        if running && !self.completion.wait(KILL_REAP_TIMEOUT) {
            bail!("[{}] {:?} was not reaped", self.pid, &self.command);
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
        "127.0.0.1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{Cgroup, CgroupKind, IsolationResource, Taskset};
    use std::time::Instant;

    fn executor(dir: &Path) -> LocalExecutor {
        LocalExecutor::new(dir, IsolationRegistry::new()).stop_grace(Duration::from_secs(1))
    }

    #[test]
    fn test_wait_unbounded() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let handle = executor(dir.path()).execute("sleep 1").unwrap();
        assert!(handle.wait(Duration::from_secs(0)));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(handle.status(), TaskState::Terminated);
        assert_eq!(handle.exit_code().unwrap(), 0);
        handle.stop().unwrap();
        assert_eq!(handle.exit_code().unwrap(), 0);
        handle.clean().unwrap();
        handle.erase_output().unwrap();
    }

    #[test]
    fn test_wait_timeout_and_stop() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let handle = executor(dir.path()).execute("sleep 1").unwrap();
        assert!(!handle.wait(Duration::from_millis(500)));
        assert_eq!(handle.status(), TaskState::Running);
        assert!(handle.exit_code().is_err());

        handle.stop().unwrap();
        assert_eq!(handle.status(), TaskState::Terminated);
        assert_eq!(handle.exit_code().unwrap(), -1);
        handle.stop().unwrap();
        handle.clean().unwrap();
        handle.clean().unwrap();
    }

    #[test]
    fn test_launch_failure_leaves_no_output() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let reg = IsolationRegistry::new();
        let held = reg.register(IsolationResource::Cgroup(Cgroup::with_root(
            "sb-test",
            CgroupKind::CpuShares(2),
            "/nonexistent",
        )));

        // One never registered id and one which was never created.
        for ids in &[vec![held + 1], vec![held]] {
            let exec = LocalExecutor::new(dir.path(), reg.clone()).resources(ids);
            assert!(exec.execute("echo output").is_err());
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        }
        assert_eq!(reg.users(held), Some(0));
    }

    #[test]
    fn test_stdout_capture() {
        let dir = tempfile::tempdir().unwrap();
        let handle = executor(dir.path()).execute("echo output").unwrap();
        assert!(handle.wait(Duration::from_secs(0)));
        assert_eq!(fs::read_to_string(handle.stdout_path()).unwrap(), "output\n");
        assert!(handle.stdout_path().starts_with(dir.path()));

        handle.clean().unwrap();
        handle.erase_output().unwrap();
        assert!(!handle.stdout_path().exists());
    }

    #[test]
    fn test_command_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let handle = executor(dir.path())
            .execute("sensbench-no-such-command")
            .unwrap();
        assert!(handle.wait(Duration::from_secs(0)));
        assert_eq!(handle.exit_code().unwrap(), 127);
        let stderr = fs::read_to_string(handle.stderr_path()).unwrap();
        assert!(stderr.contains("not found"), "{:?}", stderr);
    }

    #[test]
    fn test_stop_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let handle = executor(dir.path())
            .execute("trap '' TERM; sleep 30 & sleep 30; wait")
            .unwrap();
        assert!(!handle.wait(Duration::from_millis(200)));
        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(handle.exit_code().unwrap(), -1);
    }

    #[test]
    fn test_stop_after_leader_exit() {
        let _ = ::env_logger::try_init();
        let alive = |pid: i32| {
            procfs::process::Process::new(pid)
                .and_then(|p| p.stat())
                .map(|stat| stat.state != 'Z')
                .unwrap_or(false)
        };
        let dir = tempfile::tempdir().unwrap();
        let handle = executor(dir.path())
            .execute("sleep 30 & echo $!; exit 0")
            .unwrap();
        assert!(handle.wait(Duration::from_secs(0)));
        let bg: i32 = fs::read_to_string(handle.stdout_path())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(alive(bg));

        handle.stop().unwrap();
        assert!(!alive(bg));
        assert_eq!(handle.exit_code().unwrap(), 0);
        handle.stop().unwrap();
    }

    #[test]
    fn test_decorated() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path())
            .decorators(vec![Arc::new(Taskset::new("0".parse().unwrap()))]);
        let handle = exec.execute("echo hi").unwrap();
        assert_eq!(handle.name(), "taskset --cpu-list=0 -- echo hi");
        handle.wait(Duration::from_secs(0));
    }
}
