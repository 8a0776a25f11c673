// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sb_util::*;
use sensbench_intf::{Args, Sweep};

use crate::errors::Error;
use crate::executor::{wait_or_stop, Executor};

const SYNCOOKIES: &str = "net.ipv4.tcp_syncookies";
const GOVERNOR_GLOB: &str = "devices/system/cpu/cpu*/cpufreq/scaling_governor";
const MIN_NOFILE: u64 = 10240;
const ULIMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Check {
    SynCookies,
    Governor,
    NoFile,
    Root,
}

/// Host configuration checks. Everything except missing root privileges
/// only warns.
pub struct Precheck {
    proc_sys: PathBuf,
    sysfs: PathBuf,
    pub failed: BTreeSet<Check>,
}

impl Precheck {
    pub fn new() -> Self {
        Self::with_roots(SYSCTL_ROOT, "/sys")
    }

    pub fn with_roots<P: AsRef<Path>, Q: AsRef<Path>>(proc_sys: P, sysfs: Q) -> Self {
        Self {
            proc_sys: proc_sys.as_ref().to_path_buf(),
            sysfs: sysfs.as_ref().to_path_buf(),
            failed: BTreeSet::new(),
        }
    }

    pub fn check_syncookies(&mut self) {
        let path = sysctl_path(&self.proc_sys, SYNCOOKIES);
        match fs::read_to_string(&path) {
            Ok(v) if v.trim() == "1" => {
                warn!(
                    "cfg: tcp_syncookies is enabled, the load generator may be throttled under \
                     SYN floods, consider `sysctl net.ipv4.tcp_syncookies=0`"
                );
                self.failed.insert(Check::SynCookies);
            }
            Ok(_) => {}
            Err(e) => warn!("cfg: Failed to read {:?} ({})", &path, &e),
        }
    }

    /// Every cpu with frequency scaling should use the performance governor.
    pub fn check_governors(&mut self) {
        let pattern = self.sysfs.join(GOVERNOR_GLOB);
        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(v) => v,
            Err(e) => {
                warn!("cfg: Invalid governor pattern {:?} ({})", &pattern, &e);
                return;
            }
        };
        let mut others = BTreeSet::new();
        for path in paths.filter_map(|p| p.ok()) {
            match fs::read_to_string(&path) {
                Ok(gov) if gov.trim() != "performance" => {
                    others.insert(gov.trim().to_string());
                }
                Ok(_) => {}
                Err(e) => warn!("cfg: Failed to read {:?} ({})", &path, &e),
            }
        }
        if !others.is_empty() {
            warn!(
                "cfg: cpufreq governors {:?} in use, results are more stable with \"performance\"",
                &others
            );
            self.failed.insert(Check::Governor);
        }
    }

    /// Runs `ulimit -n` through `exec`.
    pub fn check_nofile(&mut self, exec: &dyn Executor) {
        match nofile_limit(exec) {
            Ok(Some(nr)) if nr <= MIN_NOFILE => {
                warn!(
                    "cfg: Open file limit on {} is {}, memcached and mutilate need more than {}",
                    exec.name(),
                    nr,
                    MIN_NOFILE
                );
                self.failed.insert(Check::NoFile);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("cfg: Failed to check open file limit on {} ({:#})", exec.name(), &e);
                self.failed.insert(Check::NoFile);
            }
        }
    }

    /// cpuset placement and cache allocation need root.
    pub fn check_root(&mut self, args: &Args, root: bool) -> Result<()> {
        let mut needs = vec![];
        if args.cpuset {
            needs.push("cpuset placement");
        }
        if args.sweep == Sweep::Cat {
            needs.push("cache allocation");
        }
        if !needs.is_empty() && !root {
            self.failed.insert(Check::Root);
            return Err(Error::Precondition(format!("{} requires root", needs.join(" and "))).into());
        }
        Ok(())
    }

    /// Runs every check. Only the root check can fail.
    pub fn run(&mut self, args: &Args, execs: &[Arc<dyn Executor>]) -> Result<()> {
        self.check_root(args, is_root())?;
        self.check_syncookies();
        self.check_governors();
        for exec in execs.iter() {
            self.check_nofile(exec.as_ref());
        }
        if self.failed.is_empty() {
            info!("cfg: All prechecks passed");
        }
        Ok(())
    }
}

/// `None` for "unlimited".
fn nofile_limit(exec: &dyn Executor) -> Result<Option<u64>> {
    let handle = exec.execute("ulimit -n")?;
    let res = wait_or_stop(handle.as_ref(), ULIMIT_TIMEOUT)
        .and_then(|_| Ok(fs::read_to_string(handle.stdout_path())?));
    let _ = handle.clean();
    let _ = handle.erase_output();

    let out = res?;
    let out = out.trim();
    if out == "unlimited" {
        return Ok(None);
    }
    out.lines()
        .last()
        .and_then(|l| l.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| anyhow!("unexpected ulimit output {:?}", out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{EventLog, MockExecutor, Script};

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_sysfs_checks() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let proc_sys = dir.path().join("proc");
        let sysfs = dir.path().join("sys");

        for pair in &[
            ("0", "performance", "performance", vec![]),
            ("1", "performance", "performance", vec![Check::SynCookies]),
            ("0", "performance", "powersave", vec![Check::Governor]),
            ("1", "ondemand", "powersave", vec![Check::SynCookies, Check::Governor]),
        ] {
            write(&proc_sys, "net/ipv4/tcp_syncookies", pair.0);
            write(&sysfs, "devices/system/cpu/cpu0/cpufreq/scaling_governor", pair.1);
            write(&sysfs, "devices/system/cpu/cpu1/cpufreq/scaling_governor", pair.2);

            let mut pc = Precheck::with_roots(&proc_sys, &sysfs);
            pc.check_syncookies();
            pc.check_governors();
            let failed: Vec<Check> = pc.failed.iter().cloned().collect();
            assert_eq!(failed, pair.3);
        }
    }

    #[test]
    fn test_nofile() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::default();
        for pair in &[
            ("1024\n", true),
            ("10240\n", true),
            ("65536\n", false),
            ("unlimited\n", false),
            ("garbage\n", true),
        ] {
            let script = Script {
                exits: vec![("ulimit".into(), 0)],
                stdouts: vec![("ulimit".into(), pair.0.into())],
                ..Default::default()
            };
            let exec = MockExecutor::new("hp", dir.path(), &log, script);
            let mut pc = Precheck::with_roots(dir.path(), dir.path());
            pc.check_nofile(&exec);
            assert_eq!(pc.failed.contains(&Check::NoFile), pair.1, "{:?}", pair.0);
        }
    }

    #[test]
    fn test_root() {
        let mut args = Args::default();
        let mut pc = Precheck::with_roots("/nonexistent", "/nonexistent");
        assert!(pc.check_root(&args, false).is_ok());

        args.cpuset = true;
        assert!(pc.check_root(&args, true).is_ok());
        match pc.check_root(&args, false).unwrap_err().downcast_ref::<Error>() {
            Some(Error::Precondition(msg)) => assert_eq!(msg, "cpuset placement requires root"),
            v => panic!("unexpected {:?}", v),
        }

        args.cpuset = false;
        args.sweep = Sweep::Cat;
        assert!(pc.check_root(&args, false).is_err());
        assert!(pc.failed.contains(&Check::Root));
    }
}
