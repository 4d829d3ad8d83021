//! The frozen baseline result.

use serde::{Deserialize, Serialize};

use super::{IslandStats, ThermalStats, VoltStats};
use crate::config::{Limits, Tolerances};
use crate::graph::FeederGraph;
use crate::simulator::SolveResult;

/// Worst-case statistics of the untouched feeder.
///
/// Voltage limits are the looser of the stated limit and the observed
/// extremum, thermal limits the larger of the stated limit and the observed
/// loading, and integrals are the observed violation integrals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub volt_stats: VoltStats,
    pub thermal_stats: ThermalStats,
    pub island_stats: IslandStats,
}

impl Baseline {
    pub fn frame(
        graph: &FeederGraph,
        result: &SolveResult,
        limits: &Limits,
        tolerances: &Tolerances,
    ) -> Self {
        Self {
            volt_stats: VoltStats::compute(result, limits, true),
            thermal_stats: ThermalStats::compute(result, limits, true, tolerances.thermal),
            island_stats: IslandStats::compute(graph, result, limits, tolerances),
        }
    }
}
