// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{debug, warn};

use sensbench_intf::Args;

use crate::topo::{IntSet, ThreadSet};

/// HP and BE cpus. `be_pool` holds every cpu LLC aggressors may use,
/// `be_llc` is the part of it the current phase uses.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub hp: IntSet,
    pub be_pool: IntSet,
    pub be_llc: IntSet,
    pub be_l1: IntSet,
    pub mems: IntSet,
}

fn parse_range(input: &str, what: &str) -> Result<IntSet> {
    input
        .parse::<IntSet>()
        .with_context(|| format!("invalid {} {:?}", what, input))
}

impl Placement {
    /// Manual ranges win. Otherwise HP takes the first `hp_cpus` shared
    /// cache threads, one per core, and LLC aggressors the following
    /// `be_cpus`. L1 aggressors take the hyperthread siblings of HP.
    pub fn new(topo: &ThreadSet, args: &Args, hp_cpus: usize) -> Result<Self> {
        let shared = topo.shared_cache_threads()?;

        let hp = match args.hp_range.as_ref() {
            Some(range) => parse_range(range, "--hp-range")?,
            None => shared.threads(hp_cpus)?.available_threads(),
        };
        let hp_set = topo.from_threads(&hp).context("placing HP")?;

        let be_pool = match args.be_range.as_ref() {
            Some(range) => parse_range(range, "--be-range")?,
            None => shared.available_threads().difference(&hp),
        };
        topo.from_threads(&be_pool).context("placing BE")?;
        let be_llc = be_pool.take(args.be_cpus).context("placing LLC aggressors")?;

        let mut be_l1 = match args.be_l1_range.as_ref() {
            Some(range) => parse_range(range, "--be-l1-range")?,
            None => topo.sibling_threads(&hp_set).available_threads(),
        };
        if be_l1.is_empty() {
            warn!(
                "placement: No hyperthread siblings of HP cpus {}, L1 aggressors use the LLC cpus {}",
                &hp, &be_llc
            );
            be_l1 = be_llc.clone();
        }

        let mut mems = IntSet::new();
        mems.insert(args.numa_node);

        let placement = Self {
            hp,
            be_pool,
            be_llc,
            be_l1,
            mems,
        };
        debug!("placement: {:?}", &placement);
        Ok(placement)
    }

    /// The same placement with `nr` LLC aggressor cpus.
    pub fn with_be_cpus(&self, nr: usize) -> Result<Self> {
        Ok(Self {
            be_llc: self.be_pool.take(nr)?,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::topo::parse_lscpu;

    const HT_4C: &str = "0,0,0\n1,1,0\n2,2,0\n3,3,0\n4,0,0\n5,1,0\n6,2,0\n7,3,0\n";
    const NO_HT: &str = "0,0,0\n1,1,0\n2,2,0\n3,3,0\n";

    #[test]
    fn test_policy() {
        let _ = ::env_logger::try_init();
        let topo = parse_lscpu(HT_4C).unwrap();
        let mut args = Args::default();
        args.be_cpus = 2;

        let p = Placement::new(&topo, &args, 1).unwrap();
        for pair in &[
            (&p.hp, "0"),
            (&p.be_pool, "1-3"),
            (&p.be_llc, "1-2"),
            (&p.be_l1, "4"),
            (&p.mems, "0"),
        ] {
            assert_eq!(pair.0.as_range_string(), pair.1);
        }
        assert_eq!(p.with_be_cpus(3).unwrap().be_llc.as_range_string(), "1-3");
        assert!(p.with_be_cpus(4).is_err());

        let p = Placement::new(&topo, &args, 2).unwrap();
        assert_eq!(p.be_l1.as_range_string(), "4-5");
        args.be_cpus = 3;
        match Placement::new(&topo, &args, 2)
            .unwrap_err()
            .root_cause()
            .downcast_ref::<Error>()
        {
            Some(Error::SetArithmetic(_)) => {}
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn test_l1_fallback() {
        let topo = parse_lscpu(NO_HT).unwrap();
        let p = Placement::new(&topo, &Args::default(), 1).unwrap();
        assert_eq!(p.be_l1, p.be_llc);
        assert_eq!(p.be_l1.as_range_string(), "1");
    }

    #[test]
    fn test_manual() {
        let topo = parse_lscpu(HT_4C).unwrap();
        let mut args = Args::default();
        args.hp_range = Some("0-1".into());
        args.be_range = Some("2-3,6".into());
        args.be_l1_range = Some("4".into());
        args.be_cpus = 3;
        args.numa_node = 1;

        let p = Placement::new(&topo, &args, 1).unwrap();
        assert_eq!(p.hp.as_range_string(), "0-1");
        assert_eq!(p.be_llc.as_range_string(), "2-3,6");
        assert_eq!(p.be_l1.as_range_string(), "4");
        assert_eq!(p.mems.as_range_string(), "1");

        args.hp_range = Some("0-9".into());
        assert!(Placement::new(&topo, &args, 1).is_err());
        args.hp_range = Some("x".into());
        assert!(Placement::new(&topo, &args, 1).is_err());
    }
}
