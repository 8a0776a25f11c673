// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::debug;
use std::collections::BTreeMap;
use std::process::Command;

use sb_util::*;

pub mod intset;

pub use intset::IntSet;

use crate::errors::Error;

/// A logical cpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thread {
    pub id: u32,
    pub core: u32,
    pub socket: u32,
}

impl Thread {
    pub fn new(id: u32, core: u32, socket: u32) -> Self {
        Self { id, core, socket }
    }
}

/// Ordered sequence of threads. All derivations return new sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadSet {
    threads: Vec<Thread>,
}

impl ThreadSet {
    pub fn new(threads: Vec<Thread>) -> Self {
        Self { threads }
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter()
    }

    pub fn as_slice(&self) -> &[Thread] {
        &self.threads
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.threads.contains(thread)
    }

    pub fn filter<F>(&self, pred: F) -> ThreadSet
    where
        F: Fn(&Thread) -> bool,
    {
        Self::new(self.threads.iter().filter(|t| pred(t)).cloned().collect())
    }

    pub fn partition<F>(&self, pred: F) -> (ThreadSet, ThreadSet)
    where
        F: Fn(&Thread) -> bool,
    {
        let (a, b): (Vec<Thread>, Vec<Thread>) = self.threads.iter().partition(|t| pred(t));
        (Self::new(a), Self::new(b))
    }

    fn project<F: Fn(&Thread) -> u32>(&self, field: F) -> IntSet {
        self.threads.iter().map(|t| field(t)).collect()
    }

    pub fn available_threads(&self) -> IntSet {
        self.project(|t| t.id)
    }

    pub fn available_cores(&self) -> IntSet {
        self.project(|t| t.core)
    }

    pub fn available_sockets(&self) -> IntSet {
        self.project(|t| t.socket)
    }

    fn from_ids<F>(&self, ids: &IntSet, what: &str, field: F) -> Result<ThreadSet>
    where
        F: Fn(&Thread) -> u32,
    {
        let missing = ids.difference(&self.project(&field));
        if !missing.is_empty() {
            return Err(Error::SetArithmetic(format!(
                "{} {} not present in {}",
                what,
                missing,
                self.to_cpu_set_notation()
            ))
            .into());
        }
        Ok(self.filter(|t| ids.contains(field(t))))
    }

    pub fn from_threads(&self, ids: &IntSet) -> Result<ThreadSet> {
        self.from_ids(ids, "threads", |t| t.id)
    }

    pub fn from_cores(&self, ids: &IntSet) -> Result<ThreadSet> {
        self.from_ids(ids, "cores", |t| t.core)
    }

    pub fn from_sockets(&self, ids: &IntSet) -> Result<ThreadSet> {
        self.from_ids(ids, "sockets", |t| t.socket)
    }

    /// The first `nr` threads by id.
    pub fn threads(&self, nr: usize) -> Result<ThreadSet> {
        self.from_threads(&self.available_threads().take(nr)?)
    }

    /// All threads of the first `nr` cores.
    pub fn cores(&self, nr: usize) -> Result<ThreadSet> {
        self.from_cores(&self.available_cores().take(nr)?)
    }

    /// All threads of the first `nr` sockets.
    pub fn sockets(&self, nr: usize) -> Result<ThreadSet> {
        self.from_sockets(&self.available_sockets().take(nr)?)
    }

    pub fn difference(&self, other: &ThreadSet) -> ThreadSet {
        self.filter(|t| !other.contains(t))
    }

    pub fn remove(&self, thread: &Thread) -> ThreadSet {
        self.filter(|t| t != thread)
    }

    pub fn remove_thread_set(&self, other: &ThreadSet) -> ThreadSet {
        self.difference(other)
    }

    pub fn union(&self, other: &ThreadSet) -> ThreadSet {
        let mut threads = self.threads.clone();
        threads.extend(other.iter().filter(|t| !self.contains(t)));
        Self::new(threads)
    }

    pub fn to_cpu_set_notation(&self) -> String {
        self.available_threads().as_range_string()
    }

    /// One thread per core on the first socket, the lowest id of each core.
    pub fn shared_cache_threads(&self) -> Result<ThreadSet> {
        let socket = self.sockets(1)?;
        let mut per_core: BTreeMap<u32, Thread> = BTreeMap::new();
        for t in socket.iter() {
            per_core
                .entry(t.core)
                .and_modify(|cur| {
                    if t.id < cur.id {
                        *cur = *t
                    }
                })
                .or_insert(*t);
        }
        let mut threads: Vec<Thread> = per_core.into_iter().map(|(_, t)| t).collect();
        threads.sort_by_key(|t| t.id);
        Ok(Self::new(threads))
    }

    /// Hyperthread siblings of `of` which aren't in `of`, ordered by core
    /// and then id.
    pub fn sibling_threads(&self, of: &ThreadSet) -> ThreadSet {
        let mut threads: Vec<Thread> = self
            .threads
            .iter()
            .filter(|t| !of.contains(t))
            .filter(|t| of.iter().any(|o| o.core == t.core && o.socket == t.socket))
            .cloned()
            .collect();
        threads.sort_by_key(|t| (t.core, t.id));
        threads.dedup();
        Self::new(threads)
    }
}

/// Parses `lscpu -p` style output: `cpu,core,socket[,node,...]` per row with
/// `#` comment lines. Row order is preserved.
pub fn parse_lscpu(input: &str) -> Result<ThreadSet> {
    let mut threads = vec![];
    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.len() == 0 || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 3 {
            return Err(Error::Topology(format!(
                "line {}: expected at least 3 fields in {:?}",
                lineno + 1,
                line
            ))
            .into());
        }
        let mut ids = [0u32; 3];
        for (i, name) in ["cpu", "core", "socket"].iter().enumerate() {
            ids[i] = fields[i].trim().parse::<u32>().map_err(|_| {
                Error::Topology(format!(
                    "line {}: invalid {} {:?}",
                    lineno + 1,
                    name,
                    fields[i]
                ))
            })?;
        }
        threads.push(Thread::new(ids[0], ids[1], ids[2]));
    }
    Ok(ThreadSet::new(threads))
}

pub fn discover() -> Result<ThreadSet> {
    let bin = find_bin("lscpu").ok_or_else(|| Error::Topology("lscpu not found".into()))?;
    let out = run_command_output(Command::new(&bin).arg("-p"), "failed to run lscpu")?;
    let set = parse_lscpu(&out).context("parsing lscpu output")?;
    debug!(
        "topo: {} threads, cores {}, sockets {}",
        set.len(),
        set.available_cores(),
        set.available_sockets()
    );
    Ok(set)
}
