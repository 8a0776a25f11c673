// Copyright (c) Facebook, Inc. and its affiliates.
//! Command decorators. A decorator only rewrites the command string, any
//! kernel state it depends on (cgroups, cache allocations) is set up through
//! the resources in `resource`.
use anyhow::{bail, Result};
use log::{debug, info};
use std::fmt;
use std::process::Command;
use std::sync::Arc;

use sb_util::*;

use crate::topo::IntSet;

pub mod cgroup;
pub mod resource;

pub use cgroup::{Cgexec, Cgroup, CgroupKind};
pub use resource::{IsolationRegistry, IsolationResource, ResourceId};

pub trait Decorator: fmt::Debug + Send + Sync {
    fn decorate(&self, command: &str) -> String;
}

pub type Decorators = Vec<Arc<dyn Decorator>>;

/// `[d1, d2, ..., dn]` yields `d1(d2(...dn(command)))`.
pub fn decorate(decorators: &[Arc<dyn Decorator>], command: &str) -> String {
    decorators
        .iter()
        .rev()
        .fold(command.to_string(), |cmd, dec| dec.decorate(&cmd))
}

/// Single quotes `input` for `sh`.
pub fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct Taskset {
    pub cpus: IntSet,
}

impl Taskset {
    pub fn new(cpus: IntSet) -> Self {
        Self { cpus }
    }
}

impl Decorator for Taskset {
    fn decorate(&self, command: &str) -> String {
        format!("taskset --cpu-list={} -- {}", self.cpus, command)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumaPolicy {
    All,
    Interleave(IntSet),
    Membind(IntSet),
    CpuNodeBind(IntSet),
    PhysCpuBind(IntSet),
    LocalAlloc,
}

#[derive(Debug, Clone)]
pub struct Numactl {
    pub policy: NumaPolicy,
    pub preferred: Option<u32>,
}

impl Numactl {
    pub fn new(policy: NumaPolicy) -> Self {
        Self {
            policy,
            preferred: None,
        }
    }

    pub fn preferred(mut self, node: u32) -> Self {
        self.preferred = Some(node);
        self
    }
}

impl Decorator for Numactl {
    fn decorate(&self, command: &str) -> String {
        let mut opts = vec![match &self.policy {
            NumaPolicy::All => "-a".to_string(),
            NumaPolicy::Interleave(nodes) => format!("-i {}", nodes),
            NumaPolicy::Membind(nodes) => format!("-m {}", nodes),
            NumaPolicy::CpuNodeBind(nodes) => format!("-N {}", nodes),
            NumaPolicy::PhysCpuBind(cpus) => format!("-C {}", cpus),
            NumaPolicy::LocalAlloc => "-l".to_string(),
        }];
        if let Some(node) = self.preferred {
            opts.push(format!("--preferred={}", node));
        }
        format!("numactl {} -- {}", opts.join(" "), command)
    }
}

#[derive(Debug, Clone)]
pub struct Nice {
    pub adjustment: i32,
}

impl Nice {
    pub fn new(adjustment: i32) -> Self {
        Self { adjustment }
    }
}

impl Decorator for Nice {
    fn decorate(&self, command: &str) -> String {
        if self.adjustment == 0 {
            command.to_string()
        } else {
            format!("nice --adjustment {} {}", self.adjustment, command)
        }
    }
}

/// Joint last level cache way-mask and affinity.
#[derive(Debug, Clone)]
pub struct Rdtset {
    pub mask: u64,
    pub cpu_range: String,
}

impl Rdtset {
    pub fn new(mask: u64, cpus: &IntSet) -> Self {
        Self {
            mask,
            cpu_range: cpus.as_range_string(),
        }
    }
}

impl Decorator for Rdtset {
    fn decorate(&self, command: &str) -> String {
        let decorated = format!(
            "rdtset -v -c {} -t 'l3={:#x};cpu={}' {}",
            &self.cpu_range, self.mask, &self.cpu_range, command
        );
        debug!("rdtset: {:?}", &decorated);
        decorated
    }
}

pub const NS_PID: u32 = 1 << 0;
pub const NS_IPC: u32 = 1 << 1;
pub const NS_MOUNT: u32 = 1 << 2;
pub const NS_UTS: u32 = 1 << 3;
pub const NS_NET: u32 = 1 << 4;
pub const NS_USER: u32 = 1 << 5;

const NS_FLAGS: &[(u32, &str)] = &[
    (NS_PID, "--fork --pid --mount-proc"),
    (NS_IPC, "--ipc"),
    (NS_MOUNT, "--mount"),
    (NS_UTS, "--uts"),
    (NS_NET, "--net"),
    (NS_USER, "--user"),
];

#[derive(Debug, Clone)]
pub struct Unshare {
    mask: u32,
}

impl Unshare {
    pub fn new(mask: u32) -> Result<Self> {
        let all = NS_FLAGS.iter().fold(0, |acc, (flag, _)| acc | flag);
        if mask & all == 0 {
            bail!("invalid namespace mask {:#x}", mask);
        }
        Ok(Self { mask: mask & all })
    }
}

impl Decorator for Unshare {
    fn decorate(&self, command: &str) -> String {
        let opts: Vec<&str> = NS_FLAGS
            .iter()
            .filter(|(flag, _)| self.mask & flag != 0)
            .map(|(_, opt)| *opt)
            .collect();
        format!("unshare {} {}", opts.join(" "), command)
    }
}

/// Runs `nr` copies of the command. The copies share a pid namespace so
/// that stopping the task takes all of them down.
#[derive(Debug, Clone)]
pub struct Parallel {
    pub nr: u32,
}

impl Parallel {
    pub fn new(nr: u32) -> Self {
        Self { nr }
    }
}

impl Decorator for Parallel {
    fn decorate(&self, command: &str) -> String {
        let fanout = format!(
            "seq {nr} | xargs -P {nr} -I{{}} sh -c {cmd}",
            nr = self.nr,
            cmd = shell_quote(command)
        );
        let pidns = Unshare { mask: NS_PID };
        pidns.decorate(&format!("sh -c {}", shell_quote(&fanout)))
    }
}

/// Machine wide cache allocation reset.
pub trait CacheReset: Send + Sync {
    fn reset(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct Pqos;

impl CacheReset for Pqos {
    fn reset(&self) -> Result<()> {
        let out = clean_rdt_assignments()?;
        debug!("pqos: {}", out.trim());
        Ok(())
    }
}

/// Clears all cache way assignments, returning the tool output.
pub fn clean_rdt_assignments() -> Result<String> {
    if find_bin("pqos").is_none() {
        bail!("pqos not found in PATH");
    }
    run_command_output(Command::new("pqos").arg("-R"), "failed to reset cache allocation")
}

/// The last level cache allocation as an explicit resource. Phases which set
/// way-masks acquire it, which clears whatever the previous phase assigned.
pub struct CacheAllocation {
    backend: Box<dyn CacheReset>,
    dirty: bool,
}

impl CacheAllocation {
    pub fn new(backend: Box<dyn CacheReset>) -> Self {
        Self {
            backend,
            dirty: false,
        }
    }

    pub fn acquire(&mut self) -> Result<()> {
        self.backend.reset()?;
        self.dirty = true;
        Ok(())
    }

    pub fn release(&mut self) -> Result<()> {
        if self.dirty {
            info!("rdt: Clearing cache allocations");
            self.backend.reset()?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Splits `ways` cache ways between HP and BE, BE getting the low
/// `be_ways`. Returns `(hp_mask, be_mask)`.
pub fn split_cache_ways(hp_ways: u32, be_ways: u32) -> Result<(u64, u64)> {
    let total = hp_ways + be_ways;
    if be_ways == 0 || hp_ways == 0 || total > 63 {
        bail!("invalid cache way split {}/{}", hp_ways, be_ways);
    }
    let whole = (1u64 << total) - 1;
    let be = (1u64 << be_ways) - 1;
    Ok((whole & !be, be))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn set(input: &str) -> IntSet {
        input.parse().unwrap()
    }

    #[test]
    fn test_identity() {
        assert_eq!(decorate(&[], "ls -l"), "ls -l");
        assert_eq!(Nice::new(0).decorate("ls -l"), "ls -l");
        assert_eq!(Nice::new(-3).decorate("ls"), "nice --adjustment -3 ls");
    }

    #[test]
    fn test_composition() {
        let decs: Decorators = vec![
            Arc::new(Nice::new(5)),
            Arc::new(Taskset::new(set("1,3"))),
        ];
        assert_eq!(
            decorate(&decs, "run"),
            "nice --adjustment 5 taskset --cpu-list=1,3 -- run"
        );

        let decs: Decorators = vec![
            Arc::new(Cgexec::new(&["cpuset"], "sensbench/hp")),
            Arc::new(Taskset::new(set("0-3"))),
        ];
        assert_eq!(
            decorate(&decs, "run"),
            "cgexec -g cpuset:sensbench/hp taskset --cpu-list=0-3 -- run"
        );
    }

    #[test]
    fn test_rdtset() {
        let rdt = Rdtset {
            mask: 2047,
            cpu_range: "0-3".into(),
        };
        assert_eq!(
            rdt.decorate("ls -l"),
            "rdtset -v -c 0-3 -t 'l3=0x7ff;cpu=0-3' ls -l"
        );
        assert_eq!(
            Rdtset::new(0x3, &set("4,5")).decorate("a"),
            "rdtset -v -c 4-5 -t 'l3=0x3;cpu=4-5' a"
        );
    }

    #[test]
    fn test_numactl() {
        for pair in &[
            (Numactl::new(NumaPolicy::All), "numactl -a -- cmd"),
            (Numactl::new(NumaPolicy::LocalAlloc), "numactl -l -- cmd"),
            (
                Numactl::new(NumaPolicy::Interleave(set("0-1"))).preferred(1),
                "numactl -i 0-1 --preferred=1 -- cmd",
            ),
            (Numactl::new(NumaPolicy::Membind(set("0"))), "numactl -m 0 -- cmd"),
            (Numactl::new(NumaPolicy::CpuNodeBind(set("1"))), "numactl -N 1 -- cmd"),
            (Numactl::new(NumaPolicy::PhysCpuBind(set("2,4"))), "numactl -C 2,4 -- cmd"),
        ] {
            assert_eq!(pair.0.decorate("cmd"), pair.1);
        }
    }

    #[test]
    fn test_unshare() {
        assert!(Unshare::new(0).is_err());
        assert!(Unshare::new(1 << 20).is_err());

        let out = Unshare::new(NS_PID | NS_NET).unwrap().decorate("cmd");
        assert!(out.starts_with("unshare "));
        for tok in &["--fork", "--pid", "--mount-proc", "--net"] {
            assert!(out.contains(tok), "{:?} lacks {}", &out, tok);
        }
        assert!(!out.contains("--uts"));
        assert!(out.ends_with(" cmd"));
    }

    #[test]
    fn test_parallel() {
        assert_eq!(
            Parallel::new(3).decorate("stress-ng --cache=1"),
            "unshare --fork --pid --mount-proc sh -c \
             'seq 3 | xargs -P 3 -I{} sh -c '\\''stress-ng --cache=1'\\'''"
        );
    }

    #[test]
    fn test_cache_ways() {
        let (hp, be) = split_cache_ways(9, 2).unwrap();
        assert_eq!(be, 0x3);
        assert_eq!(hp, 0x7fc);
        assert_eq!(hp & be, 0);
        assert_eq!(hp | be, 2047);
        assert!(split_cache_ways(0, 3).is_err());
    }

    struct CountingReset(Arc<AtomicU32>);

    impl CacheReset for CountingReset {
        fn reset(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_cache_allocation() {
        let count = Arc::new(AtomicU32::new(0));
        let mut alloc = CacheAllocation::new(Box::new(CountingReset(count.clone())));
        alloc.release().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        alloc.acquire().unwrap();
        alloc.acquire().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        alloc.release().unwrap();
        alloc.release().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
