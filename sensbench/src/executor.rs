// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{error, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use sb_util::*;

pub mod cluster;
pub mod kube;
pub mod local;
#[cfg(test)]
pub mod mock;
pub mod remote;

pub use cluster::ClusterTaskHandle;
pub use kube::{KubeConfig, KubeExecutor};
pub use local::LocalExecutor;
pub use remote::{RemoteExecutor, SshConfig};

use crate::errors::Error;

/// Grace period between SIGTERM and SIGKILL, also how long a stop waits for
/// remote ends to close.
pub const DFL_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Terminated,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    Code(i32),
    Unknown,
}

/// One-shot completion shared between a task's watcher and its handle. The
/// first recorded exit wins and every waiter sees the same one.
#[derive(Debug, Default)]
pub struct Completion {
    exit: Mutex<Option<TaskExit>>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn complete(&self, exit: TaskExit) -> bool {
        let mut cur = self.exit.lock().unwrap();
        if cur.is_some() {
            return false;
        }
        *cur = Some(exit);
        self.cv.notify_all();
        true
    }

    pub fn exit(&self) -> Option<TaskExit> {
        *self.exit.lock().unwrap()
    }

    pub fn is_done(&self) -> bool {
        self.exit().is_some()
    }

    /// Runs `f` under the completion lock unless the task already finished.
    /// Returns whether `f` ran.
    pub fn if_running<F: FnOnce()>(&self, f: F) -> bool {
        let cur = self.exit.lock().unwrap();
        if cur.is_none() {
            f();
            true
        } else {
            false
        }
    }

    /// Zero `timeout` waits forever. Returns whether the task completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let cur = self.exit.lock().unwrap();
        if timeout == Duration::from_secs(0) {
            let cur = self.cv.wait_while(cur, |exit| exit.is_none()).unwrap();
            cur.is_some()
        } else {
            let (cur, _) = self
                .cv
                .wait_timeout_while(cur, timeout, |exit| exit.is_none())
                .unwrap();
            cur.is_some()
        }
    }
}

/// Lifecycle of a launched task, identical across backends.
///
/// `status` is monotonic. `wait` with a zero timeout waits forever and
/// returns whether the task terminated. `stop` is a no-op on a terminated
/// task and makes `exit_code` report -1 otherwise. `clean` releases the
/// isolation resources held by the task and `erase_output` removes the
/// output files afterwards.
pub trait TaskHandle: Send + Sync {
    fn name(&self) -> &str;
    fn status(&self) -> TaskState;
    fn wait(&self, timeout: Duration) -> bool;
    fn stop(&self) -> Result<()>;
    fn exit_code(&self) -> Result<i32>;
    fn clean(&self) -> Result<()>;
    fn erase_output(&self) -> Result<()>;
    fn stdout_path(&self) -> &Path;
    fn stderr_path(&self) -> &Path;
    fn address(&self) -> &str;
}

pub trait Executor: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>>;
}

/// Maps a recorded exit to the value `exit_code` reports.
pub fn exit_code_of(name: &str, exit: Option<TaskExit>, stopped: bool) -> Result<i32> {
    match exit {
        None => bail!("{:?} is still running", name),
        Some(_) if stopped => Ok(-1),
        Some(TaskExit::Code(code)) => Ok(code),
        Some(TaskExit::Unknown) => Err(Error::ExitCodeUnknown(name.to_string()).into()),
    }
}

/// Per-task output directory `<root>/<backend>_<bin>_XXXXXX` with `stdout`
/// and `stderr` files in it.
#[derive(Debug, Clone)]
pub struct OutputFiles {
    pub dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl OutputFiles {
    pub fn create<P: AsRef<Path>>(root: P, backend: &str, command: &str) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        let bin = command
            .split_whitespace()
            .next()
            .and_then(|first| Path::new(first).file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "task".into());
        let bin: String = bin
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_{}_", backend, bin))
            .tempdir_in(root)?
            .into_path();
        let files = Self {
            stdout: dir.join("stdout"),
            stderr: dir.join("stderr"),
            dir,
        };
        fs::File::create(&files.stdout)?;
        fs::File::create(&files.stderr)?;
        Ok(files)
    }

    pub fn erase(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Logs the tail of a failed task's output.
pub fn log_output(handle: &dyn TaskHandle, nr_lines: usize) {
    let code = match handle.exit_code() {
        Ok(v) => format!("{}", v),
        Err(e) => format!("unknown ({:#})", &e),
    };
    error!("task: {:?} exited with {}", handle.name(), code);
    for (what, path) in &[("stdout", handle.stdout_path()), ("stderr", handle.stderr_path())] {
        match tail_lines(path, nr_lines) {
            Ok(lines) if lines.len() > 0 => {
                error!("task: last {} {} lines ({:?})", lines.len(), what, path);
                for line in lines.iter() {
                    error!("task:   {}", line);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("task: Failed to read {} {:?} ({:#})", what, path, &e),
        }
    }
}

/// Polls `cond` every `interval` until it's true or `timeout` expires.
pub fn poll_until<F>(timeout: Duration, interval: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(interval);
    }
}

/// Waits for `handle` and stops it on timeout.
pub fn wait_or_stop(handle: &dyn TaskHandle, timeout: Duration) -> Result<()> {
    if handle.wait(timeout) {
        return Ok(());
    }
    info!(
        "task: {:?} did not finish in {}, stopping",
        handle.name(),
        format_duration(timeout.as_secs_f64())
    );
    if let Err(e) = handle.stop() {
        warn!("task: Failed to stop {:?} ({:#})", handle.name(), &e);
    }
    Err(Error::WaitTimeout {
        what: handle.name().to_string(),
        timeout: timeout.as_secs_f64(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_completion() {
        let comp = Arc::new(Completion::new());
        assert!(!comp.wait(Duration::from_millis(50)));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let comp = comp.clone();
                thread::spawn(move || (comp.wait(Duration::from_secs(0)), comp.exit()))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        assert!(comp.complete(TaskExit::Code(3)));
        assert!(!comp.complete(TaskExit::Code(0)));

        for w in waiters {
            assert_eq!(w.join().unwrap(), (true, Some(TaskExit::Code(3))));
        }
    }

    #[test]
    fn test_exit_code_of() {
        assert!(exit_code_of("t", None, false).is_err());
        assert_eq!(exit_code_of("t", Some(TaskExit::Code(2)), false).unwrap(), 2);
        assert_eq!(exit_code_of("t", Some(TaskExit::Code(0)), true).unwrap(), -1);
        assert_eq!(exit_code_of("t", Some(TaskExit::Unknown), true).unwrap(), -1);
        match exit_code_of("t", Some(TaskExit::Unknown), false)
            .unwrap_err()
            .downcast_ref::<Error>()
        {
            Some(Error::ExitCodeUnknown(_)) => {}
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn test_output_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = OutputFiles::create(dir.path(), "local", "/usr/bin/mutilate -A").unwrap();
        assert!(files.stdout.exists() && files.stderr.exists());
        let name = files.dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("local_mutilate_"), "{}", name);
        assert!(files.dir.starts_with(dir.path()));

        files.erase().unwrap();
        assert!(!files.dir.exists());
        files.erase().unwrap();
    }
}
