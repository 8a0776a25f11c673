// Copyright (c) Facebook, Inc. and its affiliates.
//! Expands the configured sweep into the flat list of phases to run.
use anyhow::Result;

use sensbench_intf::{Args, PhaseDescriptor, Sweep};

use crate::errors::Error;
use crate::isolation::split_cache_ways;
use crate::workload::AggressorSpec;

/// Per-phase deviations from the default isolation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Knobs {
    pub be_cpus: Option<usize>,
    /// `(hp_mask, be_mask)` of the last level cache.
    pub cache_masks: Option<(u64, u64)>,
    pub be_nice: Option<i32>,
    pub hp_threads: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub desc: PhaseDescriptor,
    pub aggressor: Option<AggressorSpec>,
    pub knobs: Knobs,
}

/// Whether the sweep derives its load points from the peak load.
pub fn needs_peak(args: &Args) -> bool {
    args.peak_load == 0
        && match args.sweep {
            Sweep::Sensitivity | Sweep::Threads => true,
            Sweep::Cat | Sweep::Nice => args.qps.is_empty(),
            Sweep::Qps => false,
        }
}

/// `peak / points * (i + 1)` for each load point.
pub fn load_points(peak: u64, points: u32) -> Vec<u64> {
    let step = peak / points.max(1) as u64;
    (1..=points as u64).map(|i| step * i).collect()
}

fn aggressors(args: &Args) -> Result<Vec<Option<AggressorSpec>>> {
    let mut specs = vec![];
    for name in args.aggressors.iter() {
        if Args::aggressor_is_baseline(name) {
            specs.push(None);
        } else {
            specs.push(Some(AggressorSpec::new(name, args)?));
        }
    }
    if specs.is_empty() {
        return Err(Error::Precondition("no aggressors configured".into()).into());
    }
    Ok(specs)
}

struct Planner<'a> {
    args: &'a Args,
    experiment_id: &'a str,
    phases: Vec<PhaseSpec>,
}

impl<'a> Planner<'a> {
    /// Adds one phase per repetition.
    fn push<F>(&mut self, aggr: &Option<AggressorSpec>, load_point: u32, qps: u64, knobs: &Knobs, decorate: F)
    where
        F: Fn(PhaseDescriptor) -> PhaseDescriptor,
    {
        for rep in 0..self.args.repetitions {
            let desc = PhaseDescriptor::new(
                self.experiment_id,
                aggr.as_ref().map(|a| a.name.as_str()),
                load_point,
                qps,
            )
            .repetition(rep);
            self.phases.push(PhaseSpec {
                desc: decorate(desc),
                aggressor: aggr.clone(),
                knobs: knobs.clone(),
            });
        }
    }
}

/// Every phase of the experiment in execution order. `peak` is the tuned or
/// configured peak load and `nr_be_cpus` the number of cpus LLC aggressors
/// may use.
pub fn plan(args: &Args, experiment_id: &str, peak: u64, nr_be_cpus: usize) -> Result<Vec<PhaseSpec>> {
    let aggrs = aggressors(args)?;
    let qps_list = match args.sweep {
        Sweep::Qps => {
            if args.qps.is_empty() {
                return Err(Error::Precondition("qps sweep needs --qps".into()).into());
            }
            args.qps.clone()
        }
        Sweep::Cat | Sweep::Nice if !args.qps.is_empty() => args.qps.clone(),
        _ => {
            if peak == 0 {
                return Err(Error::Precondition("peak load is zero".into()).into());
            }
            load_points(peak, args.load_points)
        }
    };

    let mut planner = Planner {
        args,
        experiment_id,
        phases: vec![],
    };

    match args.sweep {
        Sweep::Sensitivity | Sweep::Qps => {
            for aggr in aggrs.iter() {
                for (lp, qps) in qps_list.iter().enumerate() {
                    planner.push(aggr, lp as u32, *qps, &Knobs::default(), |d| d);
                }
            }
        }
        Sweep::Cat => {
            let max_cpus = match args.cat_max_be_cpus {
                0 => nr_be_cpus,
                v => v,
            };
            if args.cat_min_be_cpus > max_cpus {
                return Err(Error::Precondition(format!(
                    "only {} BE cpus available, at least {} needed",
                    max_cpus, args.cat_min_be_cpus
                ))
                .into());
            }
            let total_ways = args.cat_max_cache_ways + args.cat_min_cache_ways;
            for aggr in aggrs.iter() {
                for (lp, qps) in qps_list.iter().enumerate() {
                    for cpus in (args.cat_min_be_cpus..=max_cpus).rev() {
                        for ways in (args.cat_min_cache_ways..=args.cat_max_cache_ways).rev() {
                            let (hp_mask, be_mask) = split_cache_ways(total_ways - ways, ways)?;
                            let knobs = Knobs {
                                be_cpus: Some(cpus),
                                cache_masks: Some((hp_mask, be_mask)),
                                ..Default::default()
                            };
                            planner.push(aggr, lp as u32, *qps, &knobs, |d| {
                                d.param("be_cpus", cpus)
                                    .param("be_ways", ways)
                                    .tag("number_of_cores", cpus)
                                    .tag("be_l3_cache_size", be_mask)
                                    .tag("hp_l3_cache_size", hp_mask)
                            });
                        }
                    }
                }
            }
        }
        Sweep::Nice => {
            for aggr in aggrs.iter() {
                for (lp, qps) in qps_list.iter().enumerate() {
                    for nice in args.nice_min..=args.nice_max {
                        let knobs = Knobs {
                            be_nice: Some(nice),
                            ..Default::default()
                        };
                        planner.push(aggr, lp as u32, *qps, &knobs, |d| {
                            d.param("be_nice", nice).tag("be_priority", -nice)
                        });
                    }
                }
            }
        }
        Sweep::Threads => {
            for threads in args.min_thread_count..=args.max_thread_count {
                let knobs = Knobs {
                    hp_threads: Some(threads),
                    ..Default::default()
                };
                for aggr in aggrs.iter() {
                    for (lp, qps) in qps_list.iter().enumerate() {
                        planner.push(aggr, lp as u32, *qps, &knobs, |d| d.param("hp_threads", threads));
                    }
                }
            }
        }
    }
    Ok(planner.phases)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(sweep: Sweep, aggrs: &[&str]) -> Args {
        let mut args = Args::default();
        args.sweep = sweep;
        args.aggressors = aggrs.iter().map(|s| s.to_string()).collect();
        args
    }

    #[test]
    fn test_load_points() {
        for pair in &[
            (10000u64, 4u32, vec![2500u64, 5000, 7500, 10000]),
            (1000, 3, vec![333, 666, 999]),
            (5, 10, vec![0; 10]),
        ] {
            assert_eq!(load_points(pair.0, pair.1), pair.2);
        }
    }

    #[test]
    fn test_needs_peak() {
        let mut a = args(Sweep::Sensitivity, &["None"]);
        assert!(needs_peak(&a));
        a.peak_load = 100;
        assert!(!needs_peak(&a));

        let mut a = args(Sweep::Cat, &["None"]);
        assert!(needs_peak(&a));
        a.qps = vec![1000];
        assert!(!needs_peak(&a));
        assert!(!needs_peak(&args(Sweep::Qps, &["None"])));
    }

    #[test]
    fn test_sensitivity() {
        let mut a = args(Sweep::Sensitivity, &["None", "l1d"]);
        a.load_points = 3;
        a.repetitions = 2;
        let phases = plan(&a, "exp", 3000, 2).unwrap();
        assert_eq!(phases.len(), 2 * 3 * 2);

        let names: Vec<String> = phases.iter().map(|p| p.desc.name()).collect();
        assert_eq!(names[0], "Aggressor None - load_point=0; qps=1000; repetition=0");
        assert_eq!(names[1], "Aggressor None - load_point=0; qps=1000; repetition=1");
        assert_eq!(names[11], "Aggressor l1d - load_point=2; qps=3000; repetition=1");
        assert!(phases[0].aggressor.is_none());
        assert_eq!(phases[6].aggressor.as_ref().unwrap().name, "l1d");
        assert!(phases.iter().all(|p| p.knobs == Knobs::default()));

        assert!(plan(&a, "exp", 0, 2).is_err());
        assert!(plan(&args(Sweep::Sensitivity, &["bogus"]), "exp", 3000, 2).is_err());
        assert!(plan(&args(Sweep::Sensitivity, &[]), "exp", 3000, 2).is_err());
    }

    #[test]
    fn test_qps() {
        let mut a = args(Sweep::Qps, &["stress-ng-stream"]);
        assert!(plan(&a, "exp", 0, 1).is_err());
        a.qps = vec![100, 200];
        let phases = plan(&a, "exp", 0, 1).unwrap();
        let qps: Vec<u64> = phases.iter().map(|p| p.desc.qps).collect();
        assert_eq!(qps, vec![100, 200]);
    }

    #[test]
    fn test_cat() {
        let mut a = args(Sweep::Cat, &["l3"]);
        a.qps = vec![1000];
        a.cat_min_cache_ways = 1;
        a.cat_max_cache_ways = 2;
        a.cat_min_be_cpus = 1;
        a.cat_max_be_cpus = 0;

        let phases = plan(&a, "exp", 0, 2).unwrap();
        let knobs: Vec<(Option<usize>, Option<(u64, u64)>)> = phases
            .iter()
            .map(|p| (p.knobs.be_cpus, p.knobs.cache_masks))
            .collect();
        assert_eq!(
            knobs,
            vec![
                (Some(2), Some((0b100, 0b011))),
                (Some(2), Some((0b110, 0b001))),
                (Some(1), Some((0b100, 0b011))),
                (Some(1), Some((0b110, 0b001))),
            ]
        );
        assert_eq!(
            phases[0].desc.name(),
            "Aggressor l3 - be_cpus=2; be_ways=2; load_point=0; qps=1000; repetition=0"
        );
        assert_eq!(phases[0].desc.tags()["be_l3_cache_size"], "3");

        a.cat_min_be_cpus = 3;
        assert!(plan(&a, "exp", 0, 2).is_err());
    }

    #[test]
    fn test_nice_and_threads() {
        let mut a = args(Sweep::Nice, &["None"]);
        a.nice_min = -1;
        a.nice_max = 1;
        a.load_points = 2;
        let phases = plan(&a, "exp", 2000, 1).unwrap();
        let nices: Vec<Option<i32>> = phases.iter().map(|p| p.knobs.be_nice).collect();
        assert_eq!(nices, vec![Some(-1), Some(0), Some(1), Some(-1), Some(0), Some(1)]);
        assert_eq!(phases[0].desc.tags()["be_priority"], "1");

        let mut a = args(Sweep::Threads, &["None"]);
        a.min_thread_count = 2;
        a.max_thread_count = 3;
        a.load_points = 1;
        let phases = plan(&a, "exp", 500, 1).unwrap();
        let threads: Vec<Option<u32>> = phases.iter().map(|p| p.knobs.hp_threads).collect();
        assert_eq!(threads, vec![Some(2), Some(3)]);
        assert_eq!(
            phases[1].desc.name(),
            "Aggressor None - hp_threads=3; load_point=0; qps=500; repetition=0"
        );
    }
}
