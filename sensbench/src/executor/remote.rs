// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, info, warn};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{
    exit_code_of, Completion, Executor, OutputFiles, TaskExit, TaskHandle, TaskState,
    DFL_STOP_GRACE,
};
use crate::errors::Error;
use crate::isolation::resource::Attachment;
use crate::isolation::{
    decorate, shell_quote, Decorators, IsolationRegistry, IsolationResource, ResourceId,
};

const READ_TIMEOUT_MSECS: u32 = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: PathBuf,
}

impl SshConfig {
    pub fn new(user: &str, host: &str, port: u16, key_path: &str) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            key_path: PathBuf::from(key_path),
        }
    }

    fn connect(&self) -> Result<ssh2::Session> {
        let remote_err = |what: &str, e: &dyn std::fmt::Display| {
            Error::remote(
                format!("{}@{}:{}", &self.user, &self.host, self.port),
                format!("{} ({})", what, e),
            )
        };

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| remote_err("connect", &e))?;
        let mut sess = ssh2::Session::new().map_err(|e| remote_err("session", &e))?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| remote_err("handshake", &e))?;
        sess.userauth_pubkey_file(&self.user, None, &self.key_path, None)
            .map_err(|e| remote_err(&format!("auth with {:?}", &self.key_path), &e))?;
        if !sess.authenticated() {
            return Err(remote_err("auth", &"rejected").into());
        }
        Ok(sess)
    }
}

/// Runs each command in its own ssh session on a pty. Output is merged and
/// streamed into the local stdout file.
pub struct RemoteExecutor {
    cfg: SshConfig,
    decorators: Decorators,
    output_root: PathBuf,
    registry: Arc<IsolationRegistry>,
    resources: Vec<ResourceId>,
    stop_grace: Duration,
}

impl RemoteExecutor {
    pub fn new<P: AsRef<Path>>(
        cfg: SshConfig,
        output_root: P,
        registry: Arc<IsolationRegistry>,
    ) -> Self {
        Self {
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

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn config(&self) -> &SshConfig {
        &self.cfg
    }

    fn start(
        &self,
        decorated: &str,
        files: &OutputFiles,
        attachment: &mut Attachment,
    ) -> Result<(Arc<Completion>, Arc<AtomicBool>)> {
        let sess = self.cfg.connect()?;
        let mut channel = sess
            .channel_session()
            .map_err(|e| Error::remote(&self.cfg.host, format!("channel ({})", &e)))?;
        channel
            .request_pty("xterm", None, None)
            .map_err(|e| Error::remote(&self.cfg.host, format!("pty ({})", &e)))?;
        channel
            .exec(&format!("sh -l -c {}", shell_quote(decorated)))
            .map_err(|e| Error::remote(&self.cfg.host, format!("exec ({})", &e)))?;

        let id = self.registry.register(IsolationResource::RemoteSession {
            host: self.cfg.host.clone(),
            session: sess.clone(),
        });
        attachment.push_owned(id)?;

        sess.set_timeout(READ_TIMEOUT_MSECS);

        let completion = Arc::new(Completion::new());
        let hangup = Arc::new(AtomicBool::new(false));
        let (comp, hup) = (completion.clone(), hangup.clone());
        let stdout = files.stdout.clone();
        let host = self.cfg.host.clone();
        thread::Builder::new()
            .name(format!("ssh-{}", &host))
            .spawn(move || {
                let exit = match stream_channel(&mut channel, &stdout, &hup) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("remote: Streaming output from {} failed ({:#})", &host, &e);
                        TaskExit::Unknown
                    }
                };
                debug!("remote: {} session ended {:?}", &host, exit);
                comp.complete(exit);
            })?;

        Ok((completion, hangup))
    }
}

fn stream_channel(
    channel: &mut ssh2::Channel,
    stdout: &Path,
    hangup: &AtomicBool,
) -> Result<TaskExit> {
    let mut out = fs::OpenOptions::new().append(true).open(stdout)?;
    let mut buf = [0u8; 8192];
    let mut closing = false;

    loop {
        if !closing && hangup.load(Ordering::Relaxed) {
            let _ = channel.close();
            closing = true;
        }
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(len) => out.write_all(&buf[..len])?,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue
            }
            Err(e) => {
                if closing {
                    break;
                }
                return Err(e.into());
            }
        }
    }
    out.flush()?;

    let _ = channel.wait_close();
    Ok(match channel.exit_status() {
        Ok(code) if !closing => TaskExit::Code(code),
        Ok(_) | Err(_) => TaskExit::Unknown,
    })
}

impl Executor for RemoteExecutor {
    fn name(&self) -> &str {
        "remote"
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        let decorated = decorate(&self.decorators, command);
        let files = OutputFiles::create(&self.output_root, "remote", command)?;
        let mut attachment = match Attachment::acquire(&self.registry, &self.resources) {
            Ok(v) => v,
            Err(e) => {
                let _ = files.erase();
                return Err(e);
            }
        };

        let (completion, hangup) = match self.start(&decorated, &files, &mut attachment) {
            Ok(v) => v,
            Err(e) => {
                let _ = attachment.release();
                let _ = files.erase();
                return Err(e);
            }
        };
        info!("remote: Started {:?} on {}", &decorated, &self.cfg.host);

        Ok(Box::new(RemoteTaskHandle {
            command: decorated,
            host: self.cfg.host.clone(),
            completion,
            hangup,
            files,
            attachment,
            stopped: AtomicBool::new(false),
            stop_grace: self.stop_grace,
        }))
    }
}

pub struct RemoteTaskHandle {
    command: String,
    host: String,
    completion: Arc<Completion>,
    hangup: Arc<AtomicBool>,
    files: OutputFiles,
    attachment: Attachment,
    stopped: AtomicBool,
    stop_grace: Duration,
}

impl TaskHandle for RemoteTaskHandle {
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

    /// There's no way to signal the remote process group. Hanging up the
    /// channel lets sshd deliver SIGHUP, a process which ignores it keeps
    /// running.
    fn stop(&self) -> Result<()> {
        if self.completion.is_done() {
            return Ok(());
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.hangup.store(true, Ordering::SeqCst);
        if self.completion.wait(self.stop_grace) {
            return Ok(());
        }
        Err(Error::StopUnsupported(format!("{:?} on {}", &self.command, &self.host)).into())
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
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let reg = IsolationRegistry::new();
        let exec = RemoteExecutor::new(
            SshConfig::new("root", "127.0.0.1", 1, "/nonexistent/id_rsa"),
            dir.path(),
            reg.clone(),
        );
        let err = exec.execute("true").err().unwrap();
        match err.downcast_ref::<Error>() {
            Some(Error::RemoteTransport { host, .. }) => assert_eq!(host, "root@127.0.0.1:1"),
            v => panic!("unexpected {:?}", v),
        }
        assert!(reg.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Needs sshd on localhost accepting the current user's default key.
    #[test]
    #[ignore]
    fn test_remote_echo() {
        let _ = ::env_logger::try_init();
        let user = std::env::var("USER").unwrap_or("root".into());
        let key = format!("{}/.ssh/id_rsa", std::env::var("HOME").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let reg = IsolationRegistry::new();
        let exec = RemoteExecutor::new(
            SshConfig::new(&user, "127.0.0.1", 22, &key),
            dir.path(),
            reg.clone(),
        );

        let handle = exec.execute("echo output").unwrap();
        assert!(handle.wait(Duration::from_secs(0)));
        assert_eq!(handle.exit_code().unwrap(), 0);
        let out = fs::read_to_string(handle.stdout_path()).unwrap();
        assert!(out.contains("output"), "{:?}", out);
        assert_eq!(reg.len(), 1);
        handle.clean().unwrap();
        assert!(reg.is_empty());

        let handle = exec.execute("sleep 60").unwrap();
        assert!(!handle.wait(Duration::from_millis(500)));
        let _ = handle.stop();
        assert!(handle.wait(Duration::from_secs(10)));
        assert_eq!(handle.exit_code().unwrap(), -1);
        handle.clean().unwrap();
    }
}
