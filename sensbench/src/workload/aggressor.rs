// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use std::sync::Arc;

use sensbench_intf::Args;

use super::{Launcher, ServiceHandle};
use crate::errors::Error;
use crate::executor::{Executor, TaskHandle};
use crate::isolation::{Decorators, Parallel};

/// Aggressors run until stopped, this only bounds the ones taking a duration.
const AGGRESSOR_SECS: u64 = 86400;
const L1I_ITERATIONS: u64 = i32::MAX as u64;
const L1I_INTENSITY: u32 = 0;
const CAFFE_MODEL: &str = "examples/cifar10/cifar10_quick_train_test.prototxt";
const CAFFE_WEIGHTS: &str = "examples/cifar10/cifar10_quick_iter_5000.caffemodel.h5";
const CAFFE_ITERATIONS: u64 = 1_000_000_000;

pub const AGGRESSORS: &[&str] = &[
    "l1d",
    "l1i",
    "l3",
    "membw",
    "stream",
    "stress-ng-cache-l1",
    "stress-ng-cache-l3",
    "stress-ng-memcpy",
    "stress-ng-stream",
    "caffe",
    "caffe-isolated",
];

/// Which BE isolation an aggressor runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeIsolation {
    /// Sibling hyperthreads of the HP cores.
    L1,
    /// Separate cores sharing the last level cache.
    Llc,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggressorSpec {
    pub name: String,
    pub command: String,
    pub processes: u32,
    pub isolation: BeIsolation,
}

impl AggressorSpec {
    pub fn new(name: &str, args: &Args) -> Result<Self> {
        let dur = AGGRESSOR_SECS;
        let (command, processes, isolation) = match name {
            "l1d" => (format!("l1d {}", dur), args.l1d_processes, BeIsolation::L1),
            "l1i" => (
                format!("l1i {} {}", L1I_ITERATIONS, L1I_INTENSITY),
                args.l1i_processes,
                BeIsolation::L1,
            ),
            "l3" => (format!("l3 {}", dur), args.l3_processes, BeIsolation::Llc),
            "membw" => (format!("membw {}", dur), args.membw_processes, BeIsolation::Llc),
            "stream" => {
                let cmd = match args.stream_threads {
                    0 => "stream".to_string(),
                    nr => format!("env OMP_NUM_THREADS={} stream", nr),
                };
                (cmd, 1, BeIsolation::Llc)
            }
            "stress-ng-cache-l1" => (
                format!("stress-ng --cache={} --cache-level=1", args.stressng_processes),
                1,
                BeIsolation::L1,
            ),
            "stress-ng-cache-l3" => (
                format!("stress-ng --cache={} --cache-level=3", args.stressng_processes),
                1,
                BeIsolation::Llc,
            ),
            "stress-ng-memcpy" => (
                format!("stress-ng --memcpy={}", args.stressng_processes),
                1,
                BeIsolation::Llc,
            ),
            "stress-ng-stream" => (
                format!("stress-ng --stream={}", args.stressng_processes),
                1,
                BeIsolation::Llc,
            ),
            "caffe" | "caffe-isolated" => (
                format!(
                    "{} test -model {} -weights {} -iterations {} -sigint_effect stop",
                    &args.caffe_path, CAFFE_MODEL, CAFFE_WEIGHTS, CAFFE_ITERATIONS
                ),
                1,
                if name == "caffe" {
                    BeIsolation::None
                } else {
                    BeIsolation::Llc
                },
            ),
            v => {
                return Err(Error::Precondition(format!(
                    "unknown aggressor {:?}, known ones are {}",
                    v,
                    AGGRESSORS.join(", ")
                ))
                .into())
            }
        };
        Ok(Self {
            name: name.into(),
            command,
            processes,
            isolation,
        })
    }

    /// The decorators of the BE executor running this aggressor, the
    /// isolation outermost.
    pub fn decorators(&self, l1: &Decorators, llc: &Decorators) -> Decorators {
        let mut decs = match self.isolation {
            BeIsolation::L1 => l1.clone(),
            BeIsolation::Llc => llc.clone(),
            BeIsolation::None => vec![],
        };
        if self.processes != 1 {
            decs.push(Arc::new(Parallel::new(self.processes)));
        }
        decs
    }
}

pub struct Aggressor {
    spec: AggressorSpec,
    exec: Arc<dyn Executor>,
    as_service: bool,
    output_lines: usize,
}

impl Aggressor {
    pub fn new(spec: AggressorSpec, exec: Arc<dyn Executor>) -> Self {
        Self {
            spec,
            exec,
            as_service: true,
            output_lines: 5,
        }
    }

    pub fn as_service(mut self, yes: bool) -> Self {
        self.as_service = yes;
        self
    }

    pub fn output_lines(mut self, nr: usize) -> Self {
        self.output_lines = nr;
        self
    }

    pub fn spec(&self) -> &AggressorSpec {
        &self.spec
    }
}

impl Launcher for Aggressor {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        let handle = self.exec.execute(&self.spec.command)?;
        if self.as_service {
            Ok(Box::new(ServiceHandle::new(handle, self.output_lines)))
        } else {
            Ok(handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{decorate, Taskset};

    #[test]
    fn test_catalogue() {
        let mut args = Args::default();
        for name in AGGRESSORS.iter() {
            let spec = AggressorSpec::new(name, &args).unwrap();
            assert_eq!(spec.name, *name);
            assert_eq!(spec.processes, 1);
        }
        assert!(AggressorSpec::new("None", &args).is_err());
        assert!(AggressorSpec::new("fork-bomb", &args).is_err());

        for pair in &[
            ("l1d", "l1d 86400", BeIsolation::L1),
            ("l1i", "l1i 2147483647 0", BeIsolation::L1),
            ("stress-ng-cache-l1", "stress-ng --cache=1 --cache-level=1", BeIsolation::L1),
            ("stress-ng-memcpy", "stress-ng --memcpy=1", BeIsolation::Llc),
            ("stream", "stream", BeIsolation::Llc),
            (
                "caffe",
                "caffe.sh test -model examples/cifar10/cifar10_quick_train_test.prototxt \
                 -weights examples/cifar10/cifar10_quick_iter_5000.caffemodel.h5 \
                 -iterations 1000000000 -sigint_effect stop",
                BeIsolation::None,
            ),
        ] {
            let spec = AggressorSpec::new(pair.0, &args).unwrap();
            assert_eq!(spec.command, pair.1);
            assert_eq!(spec.isolation, pair.2);
        }
        assert_eq!(
            AggressorSpec::new("caffe-isolated", &args).unwrap().isolation,
            BeIsolation::Llc
        );

        args.stream_threads = 4;
        assert_eq!(
            AggressorSpec::new("stream", &args).unwrap().command,
            "env OMP_NUM_THREADS=4 stream"
        );
    }

    #[test]
    fn test_decorators() {
        let mut args = Args::default();
        args.l3_processes = 3;
        let l1: Decorators = vec![Arc::new(Taskset::new("1".parse().unwrap()))];
        let llc: Decorators = vec![Arc::new(Taskset::new("2-3".parse().unwrap()))];

        let spec = AggressorSpec::new("l3", &args).unwrap();
        let decs = spec.decorators(&l1, &llc);
        assert_eq!(decs.len(), 2);
        let cmd = decorate(&decs, &spec.command);
        assert!(cmd.starts_with("taskset --cpu-list=2-3 -- unshare --fork --pid --mount-proc"), "{}", cmd);
        assert!(cmd.contains("xargs -P 3"), "{}", cmd);

        let spec = AggressorSpec::new("l1d", &args).unwrap();
        assert_eq!(decorate(&spec.decorators(&l1, &llc), "x"), "taskset --cpu-list=1 -- x");
        let spec = AggressorSpec::new("caffe", &args).unwrap();
        assert!(spec.decorators(&l1, &llc).is_empty());
    }
}
