// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, warn};
use std::path::Path;
use std::time::Duration;

use super::{TaskHandle, TaskState};
use crate::errors::ErrorCollection;

/// A master task driving a set of agents, e.g. a distributed load generator.
/// Status, exit code and output are the master's. The agents only live as
/// long as the master does.
pub struct ClusterTaskHandle {
    master: Box<dyn TaskHandle>,
    agents: Vec<Box<dyn TaskHandle>>,
}

impl ClusterTaskHandle {
    pub fn new(master: Box<dyn TaskHandle>, agents: Vec<Box<dyn TaskHandle>>) -> Self {
        Self { master, agents }
    }

    pub fn agents(&self) -> &[Box<dyn TaskHandle>] {
        &self.agents
    }

    fn stop_agents(&self) -> Result<()> {
        let mut errs = ErrorCollection::new();
        for agent in self.agents.iter().rev() {
            debug!("cluster: Stopping agent {:?}", agent.name());
            errs.add(agent.stop());
        }
        errs.into_result()
    }
}

impl TaskHandle for ClusterTaskHandle {
    fn name(&self) -> &str {
        self.master.name()
    }

    fn status(&self) -> TaskState {
        self.master.status()
    }

    fn wait(&self, timeout: Duration) -> bool {
        if !self.master.wait(timeout) {
            return false;
        }
        if let Err(e) = self.stop_agents() {
            warn!("cluster: Failed to stop agents ({:#})", &e);
        }
        true
    }

    fn stop(&self) -> Result<()> {
        let mut errs = ErrorCollection::new();
        errs.add(self.master.stop());
        errs.add(self.stop_agents());
        errs.into_result()
    }

    fn exit_code(&self) -> Result<i32> {
        self.master.exit_code()
    }

    fn clean(&self) -> Result<()> {
        let mut errs = ErrorCollection::new();
        errs.add(self.master.clean());
        for agent in self.agents.iter() {
            errs.add(agent.clean());
        }
        errs.into_result()
    }

    fn erase_output(&self) -> Result<()> {
        let mut errs = ErrorCollection::new();
        errs.add(self.master.erase_output());
        for agent in self.agents.iter() {
            errs.add(agent.erase_output());
        }
        errs.into_result()
    }

    fn stdout_path(&self) -> &Path {
        self.master.stdout_path()
    }

    fn stderr_path(&self) -> &Path {
        self.master.stderr_path()
    }

    fn address(&self) -> &str {
        self.master.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, LocalExecutor};
    use crate::isolation::IsolationRegistry;

    #[test]
    fn test_master_ends_cluster() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path(), IsolationRegistry::new())
            .stop_grace(Duration::from_secs(1));

        let agents = vec![
            exec.execute("sleep 30").unwrap(),
            exec.execute("sleep 30").unwrap(),
        ];
        let cluster = ClusterTaskHandle::new(exec.execute("echo master").unwrap(), agents);
        assert!(cluster.wait(Duration::from_secs(0)));
        assert_eq!(cluster.status(), TaskState::Terminated);
        assert_eq!(cluster.exit_code().unwrap(), 0);
        for agent in cluster.agents() {
            assert_eq!(agent.status(), TaskState::Terminated);
            assert_eq!(agent.exit_code().unwrap(), -1);
        }
        assert_eq!(
            std::fs::read_to_string(cluster.stdout_path()).unwrap(),
            "master\n"
        );
        cluster.clean().unwrap();
        cluster.erase_output().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stop_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalExecutor::new(dir.path(), IsolationRegistry::new());
        let cluster = ClusterTaskHandle::new(
            exec.execute("sleep 30").unwrap(),
            vec![exec.execute("sleep 30").unwrap()],
        );
        assert!(!cluster.wait(Duration::from_millis(100)));
        cluster.stop().unwrap();
        assert_eq!(cluster.exit_code().unwrap(), -1);
        assert_eq!(cluster.agents()[0].status(), TaskState::Terminated);
        cluster.stop().unwrap();
    }
}
