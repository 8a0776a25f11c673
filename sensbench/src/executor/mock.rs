// Copyright (c) Facebook, Inc. and its affiliates.
//! Scripted executor recording every lifecycle call into a shared log.
use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{exit_code_of, Completion, Executor, TaskExit, TaskHandle, TaskState};

pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Default, Clone)]
pub struct Script {
    /// Commands containing the key exit right away with the code.
    pub exits: Vec<(String, i32)>,
    /// Commands containing the key get the stdout.
    pub stdouts: Vec<(String, String)>,
    pub fail_launch: Vec<String>,
    pub fail_stop: Vec<String>,
}

fn lookup<'a, T>(table: &'a [(String, T)], cmd: &str) -> Option<&'a T> {
    table.iter().find(|(k, _)| cmd.contains(k.as_str())).map(|(_, v)| v)
}

pub struct MockExecutor {
    name: String,
    dir: PathBuf,
    log: EventLog,
    script: Script,
}

impl MockExecutor {
    pub fn new(name: &str, dir: &Path, log: &EventLog, script: Script) -> Self {
        Self {
            name: name.into(),
            dir: dir.to_path_buf(),
            log: log.clone(),
            script,
        }
    }
}

impl Executor for MockExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        if self.script.fail_launch.iter().any(|k| command.contains(k.as_str())) {
            self.log.lock().unwrap().push(format!("fail {}", command));
            bail!("scripted launch failure of {:?}", command);
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("exec {}: {}", &self.name, command));

        let stdout = tempfile::Builder::new()
            .prefix("mock_")
            .tempfile_in(&self.dir)?
            .into_temp_path()
            .keep()?;
        if let Some(out) = lookup(&self.script.stdouts, command) {
            fs::write(&stdout, out.as_bytes())?;
        }
        let completion = Completion::new();
        if let Some(code) = lookup(&self.script.exits, command) {
            completion.complete(TaskExit::Code(*code));
        }
        Ok(Box::new(MockHandle {
            command: command.into(),
            log: self.log.clone(),
            completion,
            stopped: AtomicBool::new(false),
            fail_stop: self.script.fail_stop.iter().any(|k| command.contains(k.as_str())),
            stdout,
        }))
    }
}

pub struct MockHandle {
    command: String,
    log: EventLog,
    completion: Completion,
    stopped: AtomicBool,
    fail_stop: bool,
    stdout: PathBuf,
}

impl TaskHandle for MockHandle {
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
        // Nothing would ever complete an unbounded wait on a running mock.
        if timeout == Duration::from_secs(0) && !self.completion.is_done() {
            return false;
        }
        self.completion.wait(timeout)
    }

    fn stop(&self) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("stop {}", &self.command));
        if self.fail_stop {
            bail!("scripted stop failure of {:?}", &self.command);
        }
        if !self.completion.is_done() {
            self.stopped.store(true, Ordering::SeqCst);
            self.completion.complete(TaskExit::Code(143));
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
        self.log
            .lock()
            .unwrap()
            .push(format!("clean {}", &self.command));
        Ok(())
    }

    fn erase_output(&self) -> Result<()> {
        let _ = fs::remove_file(&self.stdout);
        Ok(())
    }

    fn stdout_path(&self) -> &Path {
        &self.stdout
    }

    fn stderr_path(&self) -> &Path {
        &self.stdout
    }

    fn address(&self) -> &str {
        "127.0.0.1"
    }
}
