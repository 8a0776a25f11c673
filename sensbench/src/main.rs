// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{error, info};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use sb_util::*;
use sensbench_intf::Args;

mod errors;
mod executor;
mod experiment;
mod isolation;
mod metadata;
mod precheck;
mod telemetry;
mod topo;
mod workload;

use errors::Error;
use executor::Executor;
use experiment::{Experiment, ExecutorFactory, HostExecutors};
use isolation::IsolationRegistry;
use metadata::{FileStore, MetadataStore};
use precheck::Precheck;

const EXIT_INTERRUPTED: i32 = 1;
const EXIT_USAGE: i32 = 64;
const EXIT_SOFTWARE: i32 = 70;

/// Written to `--result` when the experiment ends.
#[derive(Debug, Default, Serialize)]
struct RunSummary {
    experiment_id: String,
    sweep: String,
    dir: String,
    metadata: String,
    started_at: u64,
    finished_at: u64,
    nr_phases: usize,
    nr_failed: usize,
    error: Option<String>,
}

impl JsonSave for RunSummary {}

fn exit_code_of(err: &anyhow::Error) -> i32 {
    if prog_exiting() {
        return EXIT_INTERRUPTED;
    }
    // A failed phase wraps whatever went wrong inside it, preconditions
    // included. Only those hit before the first phase are usage errors.
    match err.downcast_ref::<Error>() {
        Some(Error::PhaseFailed(_)) => EXIT_SOFTWARE,
        Some(Error::Precondition(_)) => EXIT_USAGE,
        _ => EXIT_SOFTWARE,
    }
}

/// One executor per location the experiment runs tasks on.
fn precheck_executors(
    factory: &dyn ExecutorFactory,
    args: &Args,
    dir: &Path,
) -> Result<Vec<Arc<dyn Executor>>> {
    let mut execs = vec![factory.hp(vec![], &[], dir)?];
    if args.kubernetes {
        execs.push(factory.be(vec![], &[], dir)?);
    }
    let (master, agents) = factory.load_generator(dir)?;
    execs.push(master);
    execs.extend(agents);
    Ok(execs)
}

fn run(args: &Args, id: &str, summary: &mut RunSummary) -> Result<()> {
    let dir = PathBuf::from(&args.dir).join(id);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", &dir))?;
    let md_path = match args.metadata.as_ref() {
        Some(path) => PathBuf::from(path),
        None => dir.join("metadata.jsonl"),
    };
    summary.dir = dir.to_string_lossy().to_string();
    summary.metadata = md_path.to_string_lossy().to_string();

    let store = Arc::new(FileStore::new(&md_path)?);
    metadata::record_experiment(store.as_ref(), id, args)?;
    info!("sensbench: Experiment {} in {:?}", id, &dir);

    let topo = topo::discover().context("discovering cpu topology")?;
    let registry = IsolationRegistry::new();
    let factory = HostExecutors::new(args, registry.clone());

    let execs = precheck_executors(&factory, args, &dir)?;
    Precheck::new().run(args, &execs)?;
    drop(execs);

    let store: Arc<dyn MetadataStore> = store;
    let mut exp = Experiment::new(id, args, &dir, topo, registry, Box::new(factory), store);
    let res = exp.run();
    summary.nr_phases = exp.nr_phases();
    summary.nr_failed = exp.nr_failed();
    res
}

fn main() {
    setup_prog_state();

    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("Failed to process args ({:#})", &e);
        exit(EXIT_USAGE);
    });
    let args = &args_file.data;

    if args.dump_config {
        match args.dump_config() {
            Ok(buf) => {
                print!("{}", buf);
                return;
            }
            Err(e) => {
                error!("Failed to dump configuration ({:#})", &e);
                exit(EXIT_SOFTWARE);
            }
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let mut report = JsonReportFile::<RunSummary>::new(args.result.as_ref());
    report.data.experiment_id = id.clone();
    report.data.sweep = args.sweep.to_string();
    report.data.started_at = unix_now();

    let res = run(args, &id, &mut report.data);

    report.data.finished_at = unix_now();
    if let Err(e) = res.as_ref() {
        report.data.error = Some(format!("{:#}", e));
    }
    if let Err(e) = report.commit() {
        error!("Failed to write result summary ({:#})", &e);
    }

    match res {
        Ok(()) => println!("{}", &id),
        Err(e) => {
            error!("sensbench: {:#}", &e);
            exit(exit_code_of(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_exit_code_of() {
        let precond = || anyhow::Error::from(Error::Precondition("root required".into()));
        for pair in &[
            (precond(), EXIT_USAGE),
            (precond().context("planning phases"), EXIT_USAGE),
            (precond().context(Error::PhaseFailed("Aggressor l3 - qps=10".into())), EXIT_SOFTWARE),
            (anyhow!("pod never ran"), EXIT_SOFTWARE),
            (Error::Probe { addr: "127.0.0.1:11211".into(), timeout: 5.0 }.into(), EXIT_SOFTWARE),
        ] {
            assert_eq!(exit_code_of(&pair.0), pair.1, "{:#}", pair.0);
        }
    }
}
