// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use scan_fmt::scan_fmt;
use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;
use std::str::FromStr;

use crate::errors::Error;

/// Highest id accepted when parsing. cpu and node ids stay well below it.
pub const MAX_ID: u32 = 65535;

fn check_id(id: u32, tok: &str, input: &str) -> Result<u32> {
    if id > MAX_ID {
        return Err(Error::Topology(format!(
            "id {} in {:?} of {:?} is above {}",
            id, tok, input, MAX_ID
        ))
        .into());
    }
    Ok(id)
}

/// Ordered set of non-negative ids, rendered as `"0-3,5,8-9"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IntSet(BTreeSet<u32>);

impl IntSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: u32) -> bool {
        self.0.insert(id)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        self.0.remove(&id)
    }

    pub fn union(&self, other: &IntSet) -> IntSet {
        self.0.union(&other.0).cloned().collect()
    }

    pub fn intersection(&self, other: &IntSet) -> IntSet {
        self.0.intersection(&other.0).cloned().collect()
    }

    pub fn difference(&self, other: &IntSet) -> IntSet {
        self.0.difference(&other.0).cloned().collect()
    }

    pub fn is_subset(&self, other: &IntSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// The lowest `nr` ids.
    pub fn take(&self, nr: usize) -> Result<IntSet> {
        if nr > self.len() {
            return Err(Error::SetArithmetic(format!(
                "can't take {} out of {} ids in {:?}",
                nr,
                self.len(),
                self.as_range_string()
            ))
            .into());
        }
        Ok(self.iter().take(nr).collect())
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    /// Plain comma separated list, e.g. for cgroup cpuset files.
    pub fn as_list_string(&self) -> String {
        self.iter()
            .map(|id| id.to_string())
            .collect::<Vec<String>>()
            .join(",")
    }

    pub fn as_range_string(&self) -> String {
        let mut ranges: Vec<(u32, u32)> = vec![];
        for id in self.iter() {
            match ranges.last_mut() {
                Some(last) if last.1 + 1 == id => last.1 = id,
                _ => ranges.push((id, id)),
            }
        }
        ranges
            .iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    format!("{}", lo)
                } else {
                    format!("{}-{}", lo, hi)
                }
            })
            .collect::<Vec<String>>()
            .join(",")
    }
}

impl FromIterator<u32> for IntSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        IntSet(iter.into_iter().collect())
    }
}

impl From<&[u32]> for IntSet {
    fn from(ids: &[u32]) -> Self {
        ids.iter().cloned().collect()
    }
}

impl FromStr for IntSet {
    type Err = anyhow::Error;

    /// Parses the `as_range_string` grammar. An empty string is the empty set.
    fn from_str(input: &str) -> Result<Self> {
        let mut set = IntSet::new();
        for tok in input.split(',').map(|t| t.trim()).filter(|t| t.len() > 0) {
            if tok.contains('-') {
                let (lo, hi) = scan_fmt!(tok, "{d}-{d}", u32, u32).map_err(|_| {
                    Error::SetArithmetic(format!("invalid range {:?} in {:?}", tok, input))
                })?;
                if lo > hi {
                    return Err(Error::SetArithmetic(format!(
                        "reversed range {:?} in {:?}",
                        tok, input
                    ))
                    .into());
                }
                check_id(hi, tok, input)?;
                for id in lo..=hi {
                    set.insert(id);
                }
            } else {
                let id = tok.parse::<u32>().map_err(|_| {
                    Error::SetArithmetic(format!("invalid id {:?} in {:?}", tok, input))
                })?;
                set.insert(check_id(id, tok, input)?);
            }
        }
        Ok(set)
    }
}

impl fmt::Display for IntSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_range_string())
    }
}
