// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use sensbench_intf::Args;

use super::{LoadGenerator, ServiceHandle};
use crate::errors::{Error, ErrorCollection};
use crate::executor::{ClusterTaskHandle, Executor, TaskHandle};

lazy_static! {
    static ref QPS_RE: Regex = Regex::new(r"Total QPS =\s(\d+)").unwrap();
    static ref LATENCY_RE: Regex =
        Regex::new(r"Swan latency for percentile \d+.\d+:\s(\d+)").unwrap();
}

fn parse_first(re: &Regex, output: &str, what: &str) -> Result<u64> {
    let m = re
        .captures(output)
        .and_then(|caps| caps.get(1))
        .with_context(|| format!("no {} in mutilate output", what))?;
    m.as_str()
        .parse::<u64>()
        .with_context(|| format!("parsing {} {:?}", what, m.as_str()))
}

pub fn parse_qps(output: &str) -> Result<u64> {
    parse_first(&QPS_RE, output, "QPS")
}

pub fn parse_latency(output: &str) -> Result<u64> {
    parse_first(&LATENCY_RE, output, "latency")
}

/// QPS and latency of a tune or load run. Both must be present.
pub fn parse_output(output: &str) -> Result<(u64, u64)> {
    let mut errs = ErrorCollection::new();
    let qps = parse_qps(output);
    let lat = parse_latency(output);
    match (qps, lat) {
        (Ok(qps), Ok(lat)) => Ok((qps, lat)),
        (qps, lat) => {
            errs.add(qps);
            errs.add(lat);
            errs.into_result().map(|_| (0, 0))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutilateConfig {
    pub path: String,
    pub server: String,
    pub percentile: String,
    pub warmup: Duration,
    pub tuning_time: Duration,
    pub records: u64,
    pub agent_threads: u32,
    pub agent_port: u16,
    pub agent_connections: u32,
    pub agent_connections_depth: u32,
    pub master_threads: u32,
    pub master_connections: u32,
    pub master_connections_depth: u32,
    pub master_qps: u64,
    pub key_size: u32,
    pub value_size: u32,
}

impl MutilateConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            path: args.mutilate_path.clone(),
            server: format!("{}:{}", &args.memcached_ip, args.memcached_port),
            percentile: args.mutilate_percentile.clone(),
            warmup: Duration::from_secs_f64(args.mutilate_warmup),
            tuning_time: Duration::from_secs_f64(args.mutilate_tuning_time),
            records: args.mutilate_records,
            agent_threads: args.mutilate_agent_threads,
            agent_port: args.mutilate_agent_port,
            agent_connections: args.mutilate_agent_connections,
            agent_connections_depth: args.mutilate_agent_connections_depth,
            master_threads: args.mutilate_master_threads,
            master_connections: args.mutilate_master_connections,
            master_connections_depth: args.mutilate_master_connections_depth,
            master_qps: args.mutilate_master_qps,
            key_size: args.mutilate_key_size,
            value_size: args.mutilate_value_size,
        }
    }

    pub fn agent_command(&self) -> String {
        format!("{} -A -T {} -p {}", &self.path, self.agent_threads, self.agent_port)
    }

    pub fn populate_command(&self) -> String {
        format!(
            "{} -s {} -r {} -K {} -V {} --loadonly",
            &self.path, &self.server, self.records, self.key_size, self.value_size
        )
    }

    fn master_command(&self, agents: &[&str]) -> String {
        let mut cmd = format!(
            "{} -s {} -r {} --warmup {} --noload -K {} -V {} -T {} -B -d {} -c {}",
            &self.path,
            &self.server,
            self.records,
            self.warmup.as_secs(),
            self.key_size,
            self.value_size,
            self.master_threads,
            self.agent_connections_depth,
            self.agent_connections,
        );
        if !agents.is_empty() {
            cmd += &format!(
                " -D {} -C {} -p {}",
                self.master_connections_depth, self.master_connections, self.agent_port
            );
            if self.master_qps > 0 {
                cmd += &format!(" -Q {}", self.master_qps);
            }
            for agent in agents {
                cmd += &format!(" -a {}", agent);
            }
        }
        cmd
    }

    pub fn load_command(&self, qps: u64, duration: Duration, agents: &[&str]) -> String {
        format!(
            "{} -q {} -t {} --swanpercentile {}",
            self.master_command(agents),
            qps,
            duration.as_secs(),
            &self.percentile
        )
    }

    pub fn tune_command(&self, slo: u64, agents: &[&str]) -> String {
        format!(
            "{} --search {}:{} -t {} --swanpercentile {}",
            self.master_command(agents),
            &self.percentile,
            slo,
            self.tuning_time.as_secs(),
            &self.percentile
        )
    }
}

/// Mutilate master plus optional agents on their own executors.
pub struct Mutilate {
    master: Arc<dyn Executor>,
    agents: Vec<Arc<dyn Executor>>,
    cfg: MutilateConfig,
    output_lines: usize,
}

impl Mutilate {
    pub fn new(master: Arc<dyn Executor>, cfg: MutilateConfig) -> Self {
        Self {
            master,
            agents: vec![],
            cfg,
            output_lines: 5,
        }
    }

    pub fn agents(mut self, agents: Vec<Arc<dyn Executor>>) -> Self {
        self.agents = agents;
        self
    }

    pub fn output_lines(mut self, nr: usize) -> Self {
        self.output_lines = nr;
        self
    }

    pub fn config(&self) -> &MutilateConfig {
        &self.cfg
    }

    fn stop_all(handles: &[Box<dyn TaskHandle>]) {
        for handle in handles.iter().rev() {
            if let Err(e) = handle.stop() {
                warn!("mutilate: Failed to stop agent {:?} ({:#})", handle.name(), &e);
            }
            if let Err(e) = handle.clean() {
                warn!("mutilate: Failed to clean agent {:?} ({:#})", handle.name(), &e);
            }
        }
    }

    fn start_agents(&self) -> Result<Vec<Box<dyn TaskHandle>>> {
        let cmd = self.cfg.agent_command();
        let mut handles: Vec<Box<dyn TaskHandle>> = vec![];
        for exec in self.agents.iter() {
            match exec.execute(&cmd) {
                Ok(h) => handles.push(Box::new(ServiceHandle::new(h, self.output_lines))),
                Err(e) => {
                    error!(
                        "mutilate: Agent {:?} failed on {}, stopping {} started agents",
                        &cmd,
                        exec.name(),
                        handles.len()
                    );
                    Self::stop_all(&handles);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    fn run_master(&self, cmd: &str, agents: Vec<Box<dyn TaskHandle>>) -> Result<Box<dyn TaskHandle>> {
        match self.master.execute(cmd) {
            Ok(master) => Ok(Box::new(ClusterTaskHandle::new(master, agents))),
            Err(e) => {
                Self::stop_all(&agents);
                Err(e).with_context(|| format!("launching mutilate master {:?}", cmd))
            }
        }
    }

    fn agent_addrs(agents: &[Box<dyn TaskHandle>]) -> Vec<String> {
        agents.iter().map(|a| a.address().to_string()).collect()
    }
}

fn check_exit(handle: &dyn TaskHandle) -> Result<()> {
    let code = handle.exit_code()?;
    if code != 0 {
        return Err(Error::ExitNonZero {
            what: handle.name().to_string(),
            code,
        }
        .into());
    }
    Ok(())
}

impl LoadGenerator for Mutilate {
    fn populate(&self) -> Result<()> {
        let handle = self.master.execute(&self.cfg.populate_command())?;
        handle.wait(Duration::from_secs(0));
        let res = check_exit(handle.as_ref());
        if let Err(e) = handle.clean() {
            warn!("mutilate: Failed to clean populate ({:#})", &e);
        }
        res.context("populating memcached")
    }

    fn tune(&self, slo: u64) -> Result<(u64, u64)> {
        let agents = self.start_agents().context("starting mutilate agents")?;
        let addrs = Self::agent_addrs(&agents);
        let addrs: Vec<&str> = addrs.iter().map(|s| s.as_str()).collect();
        let cmd = self.cfg.tune_command(slo, &addrs);
        let handle = self.run_master(&cmd, agents)?;

        handle.wait(Duration::from_secs(0));
        let res = check_exit(handle.as_ref()).and_then(|_| {
            let output = fs::read_to_string(handle.stdout_path())?;
            parse_output(&output)
        });
        if let Err(e) = handle.clean() {
            warn!("mutilate: Failed to clean tuning run ({:#})", &e);
        }
        let (qps, lat) = res.context("tuning mutilate")?;
        info!(
            "mutilate: Peak load meeting {}us at p{} is {} QPS ({}us)",
            slo, &self.cfg.percentile, qps, lat
        );
        Ok((qps, lat))
    }

    fn load(&self, qps: u64, duration: Duration) -> Result<Box<dyn TaskHandle>> {
        let agents = self.start_agents().context("starting mutilate agents")?;
        let addrs = Self::agent_addrs(&agents);
        let addrs: Vec<&str> = addrs.iter().map(|s| s.as_str()).collect();
        let cmd = self.cfg.load_command(qps, duration, &addrs);
        self.run_master(&cmd, agents)
    }
}
