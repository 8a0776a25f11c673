// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use sensbench_intf::Args;

use super::{probe_tcp, Launcher, DFL_PROBE_TIMEOUT};
use crate::errors::Error;
use crate::executor::{Executor, TaskHandle};

#[derive(Debug, Clone, PartialEq)]
pub struct MemcachedConfig {
    pub path: String,
    pub ip: String,
    pub port: u16,
    pub user: String,
    pub threads: u32,
    pub threads_affinity: bool,
    pub connections: u32,
    pub max_memory_mb: u64,
}

impl MemcachedConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let cfg = Self {
            path: args.memcached_path.clone(),
            ip: args.memcached_ip.clone(),
            port: args.memcached_port,
            user: args.memcached_user.clone(),
            threads: args.memcached_threads,
            threads_affinity: args.memcached_threads_affinity,
            connections: args.memcached_connections,
            max_memory_mb: args.memcached_max_memory,
        };
        cfg.verify()?;
        Ok(cfg)
    }

    /// The address is probed and handed to the load generator, a wildcard
    /// doesn't work for either.
    pub fn verify(&self) -> Result<()> {
        if self.ip == "0.0.0.0" {
            return Err(Error::Precondition(
                "memcached must listen on an actual device address, not 0.0.0.0".into(),
            )
            .into());
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", &self.ip, self.port)
    }

    pub fn command(&self) -> String {
        let mut cmd = format!(
            "{} -p {} -u {} -t {} -m {} -c {}",
            &self.path, self.port, &self.user, self.threads, self.max_memory_mb, self.connections
        );
        if self.threads_affinity {
            cmd += " -T";
        }
        cmd
    }
}

/// Health-gated memcached launcher. The task is stopped if the port doesn't
/// come up in time.
pub struct Memcached {
    exec: Arc<dyn Executor>,
    cfg: MemcachedConfig,
    probe_timeout: Duration,
}

impl Memcached {
    pub fn new(exec: Arc<dyn Executor>, cfg: MemcachedConfig) -> Self {
        Self {
            exec,
            cfg,
            probe_timeout: DFL_PROBE_TIMEOUT,
        }
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn config(&self) -> &MemcachedConfig {
        &self.cfg
    }
}

impl Launcher for Memcached {
    fn name(&self) -> &str {
        "memcached"
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        self.cfg.verify()?;
        let handle = self.exec.execute(&self.cfg.command())?;

        let addr = self.cfg.address();
        if !probe_tcp(&addr, self.probe_timeout) {
            if let Err(e) = handle.stop() {
                warn!("memcached: Failed to stop {:?} ({:#})", handle.name(), &e);
            }
            if let Err(e) = handle.clean() {
                warn!("memcached: Failed to clean {:?} ({:#})", handle.name(), &e);
            }
            return Err(Error::Probe {
                addr,
                timeout: self.probe_timeout.as_secs_f64(),
            }
            .into());
        }
        info!("memcached: Listening on {}", &addr);
        Ok(handle)
    }
}
