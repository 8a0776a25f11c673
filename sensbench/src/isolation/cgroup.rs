// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use sb_util::*;

use super::Decorator;
use crate::errors::Error;
use crate::topo::IntSet;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, PartialEq)]
pub enum CgroupKind {
    CpuShares(u64),
    CpuSet { cpus: IntSet, mems: IntSet },
    MemoryLimit(u64),
}

impl CgroupKind {
    pub fn controller(&self) -> &'static str {
        match self {
            Self::CpuShares(_) => "cpu",
            Self::CpuSet { .. } => "cpuset",
            Self::MemoryLimit(_) => "memory",
        }
    }

    fn settings(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::CpuShares(shares) => vec![("cpu.shares", shares.to_string())],
            Self::CpuSet { cpus, mems } => vec![
                ("cpuset.cpus", cpus.as_list_string()),
                ("cpuset.mems", mems.as_list_string()),
            ],
            Self::MemoryLimit(bytes) => vec![("memory.limit_in_bytes", bytes.to_string())],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupState {
    Absent,
    Created,
    Populated,
    Destroyed,
}

/// A named scope in one cgroup v1 controller, manipulated through the
/// libcgroup tools and the `tasks` file.
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    kind: CgroupKind,
    root: PathBuf,
    state: CgroupState,
}

fn cgtool(args: &[&str], scope: &str) -> Result<()> {
    let bin = args[0];
    if find_bin(bin).is_none() {
        return Err(Error::cgroup(scope, format!("{} not found in PATH", bin)).into());
    }
    debug!("cgroup: {}", args.join(" "));
    let out = Command::new(bin)
        .args(&args[1..])
        .output()
        .map_err(|e| Error::cgroup(scope, format!("failed to run {} ({})", bin, &e)))?;
    if !out.status.success() {
        return Err(Error::cgroup(
            scope,
            format!(
                "{} failed ({}): {}",
                args.join(" "),
                &out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        )
        .into());
    }
    Ok(())
}

impl Cgroup {
    pub fn new(name: &str, kind: CgroupKind) -> Self {
        Self::with_root(name, kind, CGROUP_ROOT)
    }

    pub fn with_root<P: AsRef<Path>>(name: &str, kind: CgroupKind, root: P) -> Self {
        Self {
            name: name.trim_matches('/').to_string(),
            kind,
            root: root.as_ref().to_path_buf(),
            state: CgroupState::Absent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &CgroupKind {
        &self.kind
    }

    pub fn state(&self) -> CgroupState {
        self.state
    }

    /// `controller:name` as taken by the libcgroup tools.
    pub fn spec(&self) -> String {
        format!("{}:{}", self.kind.controller(), &self.name)
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(self.kind.controller()).join(&self.name)
    }

    pub fn decorator(&self) -> Cgexec {
        Cgexec::new(&[self.kind.controller()], &self.name)
    }

    pub fn create(&mut self) -> Result<()> {
        match self.state {
            CgroupState::Created | CgroupState::Populated => return Ok(()),
            _ => {}
        }
        let spec = self.spec();
        cgtool(&["cgcreate", "-g", &spec], &spec)?;
        for (knob, val) in self.kind.settings().iter() {
            cgtool(&["cgset", "-r", &format!("{}={}", knob, val), &self.name], &spec)?;
        }
        info!("cgroup: Created {}", &spec);
        self.state = CgroupState::Created;
        Ok(())
    }

    pub fn isolate(&mut self, pid: u32) -> Result<()> {
        match self.state {
            CgroupState::Created | CgroupState::Populated => {}
            state => {
                return Err(Error::cgroup(
                    self.spec(),
                    format!("can't attach pid {} in state {:?}", pid, state),
                )
                .into())
            }
        }
        let tasks = self.path().join("tasks");
        fs::write(&tasks, pid.to_string().as_bytes()).map_err(|e| {
            Error::cgroup(self.spec(), format!("writing {} to {:?} ({})", pid, &tasks, &e))
        })?;
        self.state = CgroupState::Populated;
        Ok(())
    }

    /// Pids currently attached, empty if the scope doesn't exist.
    pub fn tasks(&self) -> Vec<u32> {
        match fs::read_to_string(self.path().join("tasks")) {
            Ok(buf) => buf
                .lines()
                .filter_map(|l| l.trim().parse::<u32>().ok())
                .collect(),
            Err(_) => vec![],
        }
    }

    /// Marks a scope whose tasks all exited as no longer populated.
    pub fn refresh(&mut self) {
        if self.state == CgroupState::Populated && self.tasks().is_empty() {
            self.state = CgroupState::Created;
        }
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.refresh();
        match self.state {
            CgroupState::Absent | CgroupState::Destroyed => return Ok(()),
            CgroupState::Populated => {
                return Err(Error::cgroup(
                    self.spec(),
                    format!("still populated by {:?}", self.tasks()),
                )
                .into())
            }
            CgroupState::Created => {}
        }
        let spec = self.spec();
        cgtool(&["cgdelete", "-g", &spec], &spec)?;
        info!("cgroup: Destroyed {}", &spec);
        self.state = CgroupState::Destroyed;
        Ok(())
    }
}

/// `cgexec -g CTRLS:PATH <cmd>`
#[derive(Debug, Clone)]
pub struct Cgexec {
    pub controllers: Vec<String>,
    pub path: String,
}

impl Cgexec {
    pub fn new(controllers: &[&str], path: &str) -> Self {
        Self {
            controllers: controllers.iter().map(|c| c.to_string()).collect(),
            path: path.into(),
        }
    }
}

impl Decorator for Cgexec {
    fn decorate(&self, command: &str) -> String {
        format!(
            "cgexec -g {}:{} {}",
            self.controllers.join(","),
            &self.path,
            command
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_layout() {
        let cg = Cgroup::with_root(
            "/sensbench/hp/",
            CgroupKind::CpuSet {
                cpus: "0-1".parse().unwrap(),
                mems: "0".parse().unwrap(),
            },
            "/tmp/cg",
        );
        assert_eq!(cg.spec(), "cpuset:sensbench/hp");
        assert_eq!(cg.path(), PathBuf::from("/tmp/cg/cpuset/sensbench/hp"));
        assert_eq!(cg.decorator().decorate("x"), "cgexec -g cpuset:sensbench/hp x");
        assert_eq!(
            cg.kind().settings(),
            vec![
                ("cpuset.cpus", "0,1".to_string()),
                ("cpuset.mems", "0".to_string())
            ]
        );
        assert_eq!(
            Cgexec::new(&["cpu", "memory"], "a").decorate("y"),
            "cgexec -g cpu,memory:a y"
        );
    }

    #[test]
    fn test_populate_requires_create() {
        let dir = tempfile::tempdir().unwrap();
        let mut cg = Cgroup::with_root("be", CgroupKind::CpuShares(2), dir.path());
        match cg.isolate(1).unwrap_err().downcast_ref::<Error>() {
            Some(Error::Cgroup { scope, .. }) => assert_eq!(scope, "cpu:be"),
            v => panic!("unexpected {:?}", v),
        }
        assert!(cg.tasks().is_empty());
        // Never created, nothing to destroy.
        cg.destroy().unwrap();
    }

    #[test]
    #[ignore]
    fn test_cpuset_scope() {
        let _ = ::env_logger::try_init();
        let mut cg = Cgroup::new(
            "sensbench-test",
            CgroupKind::CpuSet {
                cpus: "0,1".parse().unwrap(),
                mems: "0".parse().unwrap(),
            },
        );
        cg.create().unwrap();
        let mut child = Command::new("sleep").arg("10").spawn().unwrap();
        cg.isolate(child.id()).unwrap();

        let cpus: IntSet = fs::read_to_string(cg.path().join("cpuset.cpus"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(cpus.as_range_string(), "0-1");
        assert!(cg.tasks().contains(&child.id()));
        assert!(cg.destroy().is_err());

        child.kill().unwrap();
        child.wait().unwrap();
        cg.destroy().unwrap();
        assert!(!cg.path().exists());
    }
}
