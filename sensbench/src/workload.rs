// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use log::{debug, error, warn};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub mod aggressor;
pub mod memcached;
pub mod mutilate;

pub use aggressor::{Aggressor, AggressorSpec, BeIsolation};
pub use memcached::{Memcached, MemcachedConfig};
pub use mutilate::{Mutilate, MutilateConfig};

use crate::executor::{log_output, poll_until, TaskHandle, TaskState};

pub const DFL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Anything which can be started as a task, HP services and aggressors.
pub trait Launcher: Send + Sync {
    fn name(&self) -> &str;
    fn launch(&self) -> Result<Box<dyn TaskHandle>>;
}

pub trait LoadGenerator: Send + Sync {
    /// Fills the service with its data set and waits for completion.
    fn populate(&self) -> Result<()>;
    /// Searches for the highest QPS meeting `slo`. Returns the QPS and the
    /// latency achieved at it.
    fn tune(&self, slo: u64) -> Result<(u64, u64)>;
    /// Starts a load run. The handle terminates when the run completes.
    fn load(&self, qps: u64, duration: Duration) -> Result<Box<dyn TaskHandle>>;
}

/// Whether `addr` accepts TCP connections within `timeout`.
pub fn probe_tcp(addr: &str, timeout: Duration) -> bool {
    let addrs: Vec<_> = match addr.to_socket_addrs() {
        Ok(v) => v.collect(),
        Err(e) => {
            warn!("probe: Failed to resolve {:?} ({})", addr, &e);
            return false;
        }
    };
    poll_until(timeout, PROBE_INTERVAL, || {
        addrs
            .iter()
            .any(|sa| TcpStream::connect_timeout(sa, PROBE_INTERVAL).is_ok())
    })
}

#[derive(Debug, Clone, PartialEq)]
enum ServiceState {
    Armed,
    Released,
    Failed(String),
}

/// A task which must keep running until the harness stops or waits for it.
/// If it's found terminated on the first `stop` or `wait`, its output tail is
/// logged and that and every later `stop` fails.
pub struct ServiceHandle {
    inner: Box<dyn TaskHandle>,
    state: Mutex<ServiceState>,
    output_lines: usize,
}

impl ServiceHandle {
    pub fn new(inner: Box<dyn TaskHandle>, output_lines: usize) -> Self {
        Self {
            inner,
            state: Mutex::new(ServiceState::Armed),
            output_lines,
        }
    }

    fn check(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state == ServiceState::Armed {
            *state = if self.inner.status() == TaskState::Terminated {
                error!("service: {:?} terminated prematurely", self.inner.name());
                log_output(self.inner.as_ref(), self.output_lines);
                ServiceState::Failed(format!("{:?} terminated prematurely", self.inner.name()))
            } else {
                ServiceState::Released
            };
        }
        match &*state {
            ServiceState::Failed(msg) => Err(anyhow!("{}", msg)),
            _ => Ok(()),
        }
    }
}

impl TaskHandle for ServiceHandle {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn status(&self) -> TaskState {
        self.inner.status()
    }

    fn wait(&self, timeout: Duration) -> bool {
        if let Err(e) = self.check() {
            debug!("service: {:#}", &e);
        }
        self.inner.wait(timeout)
    }

    fn stop(&self) -> Result<()> {
        self.check()?;
        self.inner.stop()
    }

    fn exit_code(&self) -> Result<i32> {
        self.inner.exit_code()
    }

    fn clean(&self) -> Result<()> {
        self.inner.clean()
    }

    fn erase_output(&self) -> Result<()> {
        self.inner.erase_output()
    }

    fn stdout_path(&self) -> &Path {
        self.inner.stdout_path()
    }

    fn stderr_path(&self) -> &Path {
        self.inner.stderr_path()
    }

    fn address(&self) -> &str {
        self.inner.address()
    }
}

/// Wraps every launched task into a `ServiceHandle`.
pub struct ServiceLauncher {
    inner: Box<dyn Launcher>,
    output_lines: usize,
}

impl ServiceLauncher {
    pub fn new(inner: Box<dyn Launcher>, output_lines: usize) -> Self {
        Self {
            inner,
            output_lines,
        }
    }
}

impl Launcher for ServiceLauncher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        Ok(Box::new(ServiceHandle::new(
            self.inner.launch()?,
            self.output_lines,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, LocalExecutor};
    use crate::isolation::IsolationRegistry;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_wait_for_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(probe_tcp(&addr, Duration::from_secs(1)));
        drop(listener);

        let started = Instant::now();
        assert!(!probe_tcp(&addr, Duration::from_millis(300)));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!probe_tcp("no-such-host.invalid:1", Duration::from_millis(100)));
    }

    #[test]
    fn test_service_premature_exit() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path(), IsolationRegistry::new());

        let svc = ServiceHandle::new(exec.execute("echo bye").unwrap(), 5);
        svc.inner.wait(Duration::from_secs(0));
        let err = svc.stop().unwrap_err();
        assert!(format!("{:#}", &err).contains("terminated prematurely"));
        assert!(svc.stop().is_err());
        assert!(svc.wait(Duration::from_secs(0)));
        assert_eq!(svc.exit_code().unwrap(), 0);
        svc.clean().unwrap();
    }

    #[test]
    fn test_service_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path(), IsolationRegistry::new());

        let svc = ServiceHandle::new(exec.execute("sleep 30").unwrap(), 5);
        svc.stop().unwrap();
        assert_eq!(svc.exit_code().unwrap(), -1);
        svc.stop().unwrap();
        svc.clean().unwrap();
    }
}
