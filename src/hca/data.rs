//! Per-step results, keyed by resource and bus, then by step counter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{HcEntry, Resource, ResourceKey, UpgradeKey, UpgradeRecord};
use crate::graph::Rating;
use crate::metrics::EvalReport;

type Steps<T> = BTreeMap<u64, T>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerStepData {
    /// Capacity installed at the bus at each step.
    pub sij: BTreeMap<ResourceKey, Steps<Rating>>,
    /// Headroom found at the bus at each step.
    pub hc: BTreeMap<ResourceKey, Steps<HcEntry>>,
    /// Margins observed at each step.
    pub eval: BTreeMap<ResourceKey, Steps<EvalReport>>,
    /// Installed capacity across the feeder after each step.
    pub stotal: Steps<BTreeMap<Resource, Rating>>,
    pub upgrades: BTreeMap<UpgradeKey, UpgradeRecord>,
}

impl PerStepData {
    pub fn is_empty(&self) -> bool {
        self.sij.is_empty()
            && self.hc.is_empty()
            && self.eval.is_empty()
            && self.stotal.is_empty()
            && self.upgrades.is_empty()
    }

    pub fn record_sij(&mut self, key: &ResourceKey, cnt: u64, sij: Rating) {
        self.sij.entry(key.clone()).or_default().insert(cnt, sij);
    }

    pub fn record_hc(&mut self, key: &ResourceKey, cnt: u64, hc: HcEntry) {
        self.hc.entry(key.clone()).or_default().insert(cnt, hc);
    }

    pub fn record_eval(&mut self, key: &ResourceKey, cnt: u64, eval: EvalReport) {
        self.eval.entry(key.clone()).or_default().insert(cnt, eval);
    }

    /// Most recent capacity recorded at or before step `cnt`.
    pub fn sij_at_or_before(&self, key: &ResourceKey, cnt: u64) -> Option<(u64, Rating)> {
        self.sij
            .get(key)?
            .range(..=cnt)
            .next_back()
            .map(|(c, r)| (*c, *r))
    }

    /// Most recent headroom recorded at or before step `cnt`.
    pub fn hc_at_or_before(&self, key: &ResourceKey, cnt: u64) -> Option<&HcEntry> {
        self.hc.get(key)?.range(..=cnt).next_back().map(|(_, h)| h)
    }

    /// Headroom series at one bus, in step order.
    pub fn hc_series(&self, key: &ResourceKey) -> Vec<(u64, &HcEntry)> {
        self.hc
            .get(key)
            .map(|m| m.iter().map(|(c, h)| (*c, h)).collect())
            .unwrap_or_default()
    }

    /// Folds `other` into `self`; entries of `other` win on equal keys.
    pub fn merge(&mut self, other: PerStepData) {
        for (k, steps) in other.sij {
            self.sij.entry(k).or_default().extend(steps);
        }
        for (k, steps) in other.hc {
            self.hc.entry(k).or_default().extend(steps);
        }
        for (k, steps) in other.eval {
            self.eval.entry(k).or_default().extend(steps);
        }
        self.stotal.extend(other.stotal);
        self.upgrades.extend(other.upgrades);
    }
}
