// Copyright (c) Facebook, Inc. and its affiliates.
//! The experiment loop. Each phase launches the HP service, populates it,
//! starts the aggressor and drives the load, then tears everything down in
//! reverse launch order before the next phase starts.
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sb_util::*;
use sensbench_intf::{Args, MetadataKind, MetadataRecord};

pub mod placement;
pub mod sweep;

pub use placement::Placement;
pub use sweep::{Knobs, PhaseSpec};

use crate::errors::{Error, ErrorCollection};
use crate::executor::{
    wait_or_stop, Executor, KubeConfig, KubeExecutor, LocalExecutor, RemoteExecutor, SshConfig,
    TaskHandle,
};
use crate::isolation::{
    CacheAllocation, Cgroup, CgroupKind, Decorators, IsolationRegistry, IsolationResource, Nice,
    Pqos, Rdtset, ResourceId, Taskset,
};
use crate::metadata::MetadataStore;
use crate::telemetry::{
    AggressorCollector, CollectorApi, LocalMutilateSeries, MutilateCollector, SessionHandle,
    SessionLauncher, Tags,
};
use crate::topo::{IntSet, ThreadSet};
use crate::workload::{
    Aggressor, BeIsolation, Launcher, LoadGenerator, Memcached, MemcachedConfig, Mutilate,
    MutilateConfig,
};

/// Creates the executors of a phase.
pub trait ExecutorFactory: Send + Sync {
    fn hp(&self, decorators: Decorators, resources: &[ResourceId], dir: &Path)
        -> Result<Arc<dyn Executor>>;
    fn be(&self, decorators: Decorators, resources: &[ResourceId], dir: &Path)
        -> Result<Arc<dyn Executor>>;
    /// The load generator master and its agents.
    fn load_generator(&self, dir: &Path) -> Result<(Arc<dyn Executor>, Vec<Arc<dyn Executor>>)>;
}

fn is_local_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == HOSTNAME.as_str()
}

/// HP and BE run locally or as pods. The load generator runs locally unless
/// the master is another host, agents always run over ssh.
pub struct HostExecutors {
    args: Args,
    registry: Arc<IsolationRegistry>,
}

impl HostExecutors {
    pub fn new(args: &Args, registry: Arc<IsolationRegistry>) -> Self {
        Self {
            args: args.clone(),
            registry,
        }
    }

    fn local(&self, dir: &Path) -> LocalExecutor {
        LocalExecutor::new(dir, self.registry.clone()).output_lines(self.args.output_lines)
    }

    fn remote(&self, host: &str, dir: &Path) -> RemoteExecutor {
        let cfg = SshConfig::new(
            &self.args.ssh_user,
            host,
            self.args.ssh_port,
            &self.args.ssh_key,
        );
        RemoteExecutor::new(cfg, dir, self.registry.clone())
    }
}

impl ExecutorFactory for HostExecutors {
    fn hp(
        &self,
        decorators: Decorators,
        resources: &[ResourceId],
        dir: &Path,
    ) -> Result<Arc<dyn Executor>> {
        if self.args.kubernetes {
            Ok(Arc::new(
                KubeExecutor::new(KubeConfig::hp(&self.args), dir, self.registry.clone())
                    .decorators(decorators)
                    .resources(resources),
            ))
        } else {
            Ok(Arc::new(self.local(dir).decorators(decorators).resources(resources)))
        }
    }

    fn be(
        &self,
        decorators: Decorators,
        resources: &[ResourceId],
        dir: &Path,
    ) -> Result<Arc<dyn Executor>> {
        if self.args.kubernetes {
            Ok(Arc::new(
                KubeExecutor::new(KubeConfig::be(&self.args), dir, self.registry.clone())
                    .decorators(decorators)
                    .resources(resources),
            ))
        } else {
            Ok(Arc::new(self.local(dir).decorators(decorators).resources(resources)))
        }
    }

    fn load_generator(&self, dir: &Path) -> Result<(Arc<dyn Executor>, Vec<Arc<dyn Executor>>)> {
        let master: Arc<dyn Executor> = if is_local_host(&self.args.mutilate_master) {
            Arc::new(self.local(dir))
        } else {
            Arc::new(self.remote(&self.args.mutilate_master, dir))
        };
        let agents = self
            .args
            .mutilate_agents
            .iter()
            .map(|host| Arc::new(self.remote(host, dir)) as Arc<dyn Executor>)
            .collect();
        Ok((master, agents))
    }
}

enum Participant {
    Task(Box<dyn TaskHandle>),
    Session(Box<dyn SessionHandle>),
}

impl Participant {
    fn name(&self) -> &str {
        match self {
            Self::Task(h) => h.name(),
            Self::Session(s) => s.name(),
        }
    }

    /// Stops and then cleans, both are attempted.
    fn teardown(&self) -> Result<()> {
        let mut errs = ErrorCollection::new();
        match self {
            Self::Task(h) => {
                errs.add(h.stop());
                errs.add(h.clean());
            }
            Self::Session(s) => errs.add(s.stop()),
        }
        errs.into_result()
    }
}

/// Everything a phase acquired, in acquisition order.
#[derive(Default)]
struct PhaseRun {
    participants: Vec<Participant>,
    resources: Vec<ResourceId>,
}

impl PhaseRun {
    fn push_task(&mut self, handle: Box<dyn TaskHandle>) -> usize {
        self.participants.push(Participant::Task(handle));
        self.participants.len() - 1
    }

    fn push_session(&mut self, session: Box<dyn SessionHandle>) {
        self.participants.push(Participant::Session(session));
    }

    fn task(&self, idx: usize) -> Option<&dyn TaskHandle> {
        match self.participants.get(idx) {
            Some(Participant::Task(h)) => Some(h.as_ref()),
            _ => None,
        }
    }
}

struct PhaseIsolation {
    hp: Decorators,
    hp_res: Vec<ResourceId>,
    be: Decorators,
    be_res: Vec<ResourceId>,
}

pub struct Experiment {
    id: String,
    args: Args,
    dir: PathBuf,
    topo: ThreadSet,
    registry: Arc<IsolationRegistry>,
    factory: Box<dyn ExecutorFactory>,
    store: Arc<dyn MetadataStore>,
    mutilate_session: Box<dyn SessionLauncher>,
    aggressor_session: Option<Box<dyn SessionLauncher>>,
    cache: CacheAllocation,
    probe_timeout: Duration,
    nr_phases: usize,
    nr_failed: usize,
}

impl Experiment {
    pub fn new<P: AsRef<Path>>(
        id: &str,
        args: &Args,
        dir: P,
        topo: ThreadSet,
        registry: Arc<IsolationRegistry>,
        factory: Box<dyn ExecutorFactory>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let (mutilate_session, aggressor_session): (
            Box<dyn SessionLauncher>,
            Option<Box<dyn SessionLauncher>>,
        ) = match args.telemetry.as_ref() {
            Some(endpoint) => {
                let api = CollectorApi::new(endpoint);
                (
                    Box::new(MutilateCollector::new(api.clone())),
                    Some(Box::new(AggressorCollector::new(api))),
                )
            }
            None => (Box::new(LocalMutilateSeries::new(store.clone())), None),
        };

        Self {
            id: id.into(),
            args: args.clone(),
            dir: dir.as_ref().to_path_buf(),
            topo,
            registry,
            factory,
            store,
            mutilate_session,
            aggressor_session,
            cache: CacheAllocation::new(Box::new(Pqos)),
            probe_timeout: crate::workload::DFL_PROBE_TIMEOUT,
            nr_phases: 0,
            nr_failed: 0,
        }
    }

    pub fn sessions(
        mut self,
        mutilate: Box<dyn SessionLauncher>,
        aggressor: Option<Box<dyn SessionLauncher>>,
    ) -> Self {
        self.mutilate_session = mutilate;
        self.aggressor_session = aggressor;
        self
    }

    pub fn cache_allocation(mut self, cache: CacheAllocation) -> Self {
        self.cache = cache;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nr_phases(&self) -> usize {
        self.nr_phases
    }

    pub fn nr_failed(&self) -> usize {
        self.nr_failed
    }

    fn check_exiting(&self) -> Result<()> {
        if prog_exiting() {
            bail!("interrupted");
        }
        Ok(())
    }

    fn placement(&self, knobs: &Knobs) -> Result<Placement> {
        let hp_cpus = knobs
            .hp_threads
            .map(|nr| nr as usize)
            .unwrap_or(self.args.hp_cpus);
        let placement = Placement::new(&self.topo, &self.args, hp_cpus)?;
        match knobs.be_cpus {
            Some(nr) => placement.with_be_cpus(nr),
            None => Ok(placement),
        }
    }

    /// Confines a task to `cpus`: a way-mask when cache allocation is in
    /// use, a cpuset scope with `--cpuset`, taskset otherwise.
    fn pin(
        &self,
        name: &str,
        cpus: &IntSet,
        mems: &IntSet,
        mask: Option<u64>,
        run: &mut PhaseRun,
    ) -> Result<(Decorators, Vec<ResourceId>)> {
        if let Some(mask) = mask {
            let decs: Decorators = vec![Arc::new(Rdtset::new(mask, cpus))];
            return Ok((decs, vec![]));
        }
        if self.args.cpuset {
            let cg = Cgroup::new(
                &format!("sensbench/{}", name),
                CgroupKind::CpuSet {
                    cpus: cpus.clone(),
                    mems: mems.clone(),
                },
            );
            let decs: Decorators = vec![Arc::new(cg.decorator())];
            let id = self.registry.register_prepared(IsolationResource::Cgroup(cg))?;
            run.resources.push(id);
            return Ok((decs, vec![id]));
        }
        let decs: Decorators = vec![Arc::new(Taskset::new(cpus.clone()))];
        Ok((decs, vec![]))
    }

    fn isolation(&self, spec: &PhaseSpec, run: &mut PhaseRun) -> Result<PhaseIsolation> {
        let p = self.placement(&spec.knobs)?;
        let (hp_mask, be_mask) = match spec.knobs.cache_masks {
            Some((hp, be)) => (Some(hp), Some(be)),
            None => (None, None),
        };
        let (hp, hp_res) = self.pin("hp", &p.hp, &p.mems, hp_mask, run)?;

        let mut be: Decorators = vec![];
        let mut be_res = vec![];
        if let Some(aggr) = spec.aggressor.as_ref() {
            let (l1, llc) = match aggr.isolation {
                BeIsolation::L1 => {
                    let (decs, res) = self.pin("be-l1", &p.be_l1, &p.mems, be_mask, run)?;
                    be_res = res;
                    (decs, vec![])
                }
                BeIsolation::Llc => {
                    let (decs, res) = self.pin("be-llc", &p.be_llc, &p.mems, be_mask, run)?;
                    be_res = res;
                    (vec![], decs)
                }
                BeIsolation::None => (vec![], vec![]),
            };
            if let Some(nice) = spec.knobs.be_nice {
                be.push(Arc::new(Nice::new(nice)));
            }
            be.extend(aggr.decorators(&l1, &llc));
        }
        Ok(PhaseIsolation {
            hp,
            hp_res,
            be,
            be_res,
        })
    }

    fn memcached(&self, exec: Arc<dyn Executor>, knobs: &Knobs) -> Result<Memcached> {
        let mut cfg = MemcachedConfig::from_args(&self.args)?;
        if let Some(nr) = knobs.hp_threads {
            cfg.threads = nr;
        }
        Ok(Memcached::new(exec, cfg).probe_timeout(self.probe_timeout))
    }

    fn mutilate(&self, dir: &Path) -> Result<Mutilate> {
        let (master, agents) = self.factory.load_generator(dir)?;
        Ok(Mutilate::new(master, MutilateConfig::from_args(&self.args))
            .agents(agents)
            .output_lines(self.args.output_lines))
    }

    /// Tears `run` down in reverse acquisition order. The body's error comes
    /// first, followed by teardown errors.
    fn finish<T>(&self, run: PhaseRun, res: Result<T>) -> Result<T> {
        let mut errs = ErrorCollection::new();
        let val = match res {
            Ok(v) => Some(v),
            Err(e) => {
                errs.add_err(Some(e));
                None
            }
        };
        for part in run.participants.iter().rev() {
            debug!("experiment: Tearing down {:?}", part.name());
            if let Err(e) = part.teardown() {
                warn!("experiment: Failed to tear down {:?} ({:#})", part.name(), &e);
                errs.add_err(Some(e));
            }
        }
        // Scopes nothing ended up using.
        for id in run.resources.iter().rev() {
            if self.registry.users(*id) == Some(0) {
                errs.add(self.registry.release(*id));
            }
        }
        match (errs.first_or_nil(), val) {
            (Some(e), _) => Err(e),
            (None, Some(v)) => Ok(v),
            (None, None) => bail!("phase failed without an error"),
        }
    }

    fn tune_body(&self, dir: &Path, run: &mut PhaseRun) -> Result<u64> {
        let knobs = Knobs::default();
        let p = self.placement(&knobs)?;
        let (hp, hp_res) = self.pin("hp", &p.hp, &p.mems, None, run)?;
        let hp_exec = self.factory.hp(hp, &hp_res, dir)?;

        let mc = self.memcached(hp_exec, &knobs)?;
        run.push_task(mc.launch().context("launching memcached")?);
        self.check_exiting()?;

        let lg = self.mutilate(dir)?;
        lg.populate()?;
        self.check_exiting()?;
        let (qps, lat) = lg.tune(self.args.slo)?;

        let mut data = BTreeMap::new();
        data.insert("peak_load".to_string(), qps.to_string());
        data.insert("peak_latency".to_string(), lat.to_string());
        data.insert("slo".to_string(), self.args.slo.to_string());
        self.store
            .record(&MetadataRecord::new(&self.id, MetadataKind::Experiment, data))?;
        Ok(qps)
    }

    /// Finds the highest load meeting the SLO without an aggressor.
    pub fn tune(&self) -> Result<u64> {
        info!("experiment: Tuning peak load for {}us SLO", self.args.slo);
        let dir = self.dir.join("tuning");
        fs::create_dir_all(&dir)?;
        let mut run = PhaseRun::default();
        let res = self.tune_body(&dir, &mut run);
        self.finish(run, res)
    }

    /// Waits for the load run and attaches its telemetry session.
    fn drive_load(&self, load: &dyn TaskHandle, tags: &Tags) -> Result<Box<dyn SessionHandle>> {
        let timeout = Duration::from_secs_f64(self.args.load_generator_wait_timeout);
        wait_or_stop(load, timeout)?;
        self.mutilate_session
            .launch_session(load, tags)
            .context("launching load telemetry session")
    }

    fn phase_body(&mut self, spec: &PhaseSpec, dir: &Path, run: &mut PhaseRun) -> Result<()> {
        let tags = spec.desc.tags();
        let iso = self.isolation(spec, run)?;
        if spec.knobs.cache_masks.is_some() {
            self.cache.acquire().context("clearing cache allocations")?;
        }

        let hp_exec = self.factory.hp(iso.hp, &iso.hp_res, dir)?;
        let mc = self.memcached(hp_exec, &spec.knobs)?;
        run.push_task(mc.launch().context("launching memcached")?);
        self.check_exiting()?;

        let lg = self.mutilate(dir)?;
        lg.populate()?;
        self.check_exiting()?;

        if let Some(aggr) = spec.aggressor.as_ref() {
            let be_exec = self.factory.be(iso.be, &iso.be_res, dir)?;
            let handle = Aggressor::new(aggr.clone(), be_exec)
                .as_service(self.args.be_as_service)
                .output_lines(self.args.output_lines)
                .launch()
                .with_context(|| format!("launching aggressor {:?}", &aggr.name))?;
            let session = self
                .aggressor_session
                .as_ref()
                .map(|launcher| launcher.launch_session(handle.as_ref(), &tags));
            run.push_task(handle);
            if let Some(session) = session {
                run.push_session(session.context("launching aggressor telemetry session")?);
            }
        }
        self.check_exiting()?;

        let duration = Duration::from_secs_f64(self.args.load_duration);
        let load = lg.load(spec.desc.qps, duration)?;
        let res = self.drive_load(load.as_ref(), &tags);
        let load_idx = run.push_task(load);
        run.push_session(res?);

        if wait_prog_state(Duration::from_secs_f64(self.args.telemetry_flush)) == ProgState::Exiting {
            bail!("interrupted");
        }

        if let Some(load) = run.task(load_idx) {
            let code = load.exit_code()?;
            if code != 0 {
                return Err(Error::ExitNonZero {
                    what: format!("load generator {:?}", load.name()),
                    code,
                }
                .into());
            }
        }
        Ok(())
    }

    fn run_phase(&mut self, idx: usize, nr: usize, spec: &PhaseSpec) -> Result<()> {
        info!("experiment: [{}/{}] {}", idx + 1, nr, &spec.desc);
        let dir = self.dir.join(spec.desc.dir_name());
        fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", &dir))?;

        let started = Instant::now();
        let mut run = PhaseRun::default();
        let res = self.phase_body(spec, &dir, &mut run);
        let res = self.finish(run, res);
        if res.is_ok() {
            debug!(
                "experiment: {} took {}",
                &spec.desc,
                format_duration(started.elapsed().as_secs_f64())
            );
        }
        res
    }

    fn run_phases(&mut self) -> Result<()> {
        let peak = if sweep::needs_peak(&self.args) {
            self.tune()
                .map_err(|e| e.context(Error::PhaseFailed("peak load tuning".into())))?
        } else {
            self.args.peak_load
        };
        let nr_be_cpus = self.placement(&Knobs::default())?.be_pool.len();
        let phases = sweep::plan(&self.args, &self.id, peak, nr_be_cpus)?;
        self.nr_phases = phases.len();

        let mut data = BTreeMap::new();
        data.insert("peak_load".to_string(), peak.to_string());
        data.insert("load_points".to_string(), self.args.load_points.to_string());
        data.insert("repetitions".to_string(), self.args.repetitions.to_string());
        data.insert("load_duration".to_string(), self.args.load_duration.to_string());
        data.insert("sweep".to_string(), self.args.sweep.to_string());
        data.insert("nr_phases".to_string(), phases.len().to_string());
        self.store
            .record(&MetadataRecord::new(&self.id, MetadataKind::Experiment, data))?;
        info!(
            "experiment: {} {} sweep phases, peak load {}",
            phases.len(),
            &self.args.sweep,
            peak
        );

        for (idx, spec) in phases.iter().enumerate() {
            self.check_exiting()?;
            if let Err(e) = self.run_phase(idx, phases.len(), spec) {
                self.nr_failed += 1;
                error!("experiment: {} failed ({:#})", &spec.desc, &e);
                if self.args.stop_on_error || prog_exiting() {
                    return Err(e.context(Error::PhaseFailed(spec.desc.to_string())));
                }
            }
        }
        Ok(())
    }

    /// Runs every phase. Failed phases are logged and skipped unless
    /// `stop_on_error` is set.
    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut errs = ErrorCollection::new();
        errs.add(self.run_phases());
        errs.add(self.cache.release());
        errs.add(self.registry.release_all());

        info!(
            "experiment: {} finished in {}, {}/{} phases failed",
            &self.id,
            format_duration(started.elapsed().as_secs_f64()),
            self.nr_failed,
            self.nr_phases
        );
        errs.into_result()
    }
}
