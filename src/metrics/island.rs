//! Islanding screen over the components bounded by reclosers.
//!
//! Each component's net inflow is the sum of signed flows across the
//! reclosers on its boundary. A component could sustain an island when its
//! boundary flow both reverses direction and passes close to zero, for real
//! and reactive power alike.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{MetricOutcome, PMON_PREFIX};
use crate::config::{Limits, Tolerances};
use crate::graph::FeederGraph;
use crate::simulator::SolveResult;

/// Net real and reactive inflow of one component, per sample.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentFlow {
    pub p_kw: Vec<f64>,
    pub q_kvar: Vec<f64>,
}

/// Sub-test margins of one component; positive passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IslandRow {
    pub p_dir: f64,
    pub p_frac: f64,
    pub q_dir: f64,
    pub q_frac: f64,
}

impl IslandRow {
    /// Best sub-test margin. The component fails only when all four fail.
    pub fn margin(&self) -> f64 {
        self.p_dir.max(self.p_frac).max(self.q_dir).max(self.q_frac)
    }

    pub fn pass(&self) -> bool {
        self.p_dir >= 0.0 || self.p_frac > 0.0 || self.q_dir >= 0.0 || self.q_frac > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IslandStats {
    pub components: BTreeMap<usize, IslandRow>,
}

fn accumulate(into: &mut Vec<f64>, samples: &[f64], sign: f64) {
    if into.len() < samples.len() {
        into.resize(samples.len(), 0.0);
    }
    for (slot, v) in into.iter_mut().zip(samples) {
        if v.is_finite() {
            *slot += sign * v;
        }
    }
}

/// Aggregates recloser flows into per-component inflow series.
///
/// Flows are read from the `pmon_{recloser}` power monitors, or from the
/// branch trace of the recloser's line when no monitor was placed. A
/// recloser's flow leaves the component of its first bus and enters the
/// component of its second, so the series sum to zero at every sample.
pub fn island_flows(graph: &FeederGraph, result: &SolveResult) -> BTreeMap<usize, ComponentFlow> {
    let mut flows: BTreeMap<usize, ComponentFlow> = BTreeMap::new();
    for branch in graph.boundary_reclosers() {
        let monitor = branch
            .device
            .as_ref()
            .and_then(|d| result.monitors.get(&format!("{PMON_PREFIX}{d}")));
        let (p, q) = match monitor {
            Some(m) => (
                m.channel("p_kw").unwrap_or_default(),
                m.channel("q_kvar").unwrap_or_default(),
            ),
            None => match result.branches.get(&branch.element) {
                Some(t) => (t.p_kw.as_slice(), t.q_kvar.as_slice()),
                None => continue,
            },
        };
        let (Ok(from), Ok(to)) = (graph.component_of(&branch.bus1), graph.component_of(&branch.bus2))
        else {
            continue;
        };
        for (component, sign) in [(from, -1.0), (to, 1.0)] {
            let entry = flows.entry(component).or_default();
            accumulate(&mut entry.p_kw, p, sign);
            accumulate(&mut entry.q_kvar, q, sign);
        }
    }
    flows
}

/// Margin of the no-reversal test: positive when the flow never reaches
/// beyond `tol` in both directions.
fn direction_margin(series: &[f64], tol: f64) -> f64 {
    let pos = series.iter().copied().fold(0.0, f64::max);
    let neg = series.iter().map(|v| -v).fold(0.0, f64::max);
    tol - pos.min(neg)
}

/// Margin of the fraction test: smallest over largest magnitude, less the
/// configured floor.
fn fraction_margin(series: &[f64], floor: f64, tol: f64) -> f64 {
    let max = series.iter().map(|v| v.abs()).fold(0.0, f64::max);
    if max <= tol {
        return -floor;
    }
    let min = series.iter().map(|v| v.abs()).fold(f64::INFINITY, f64::min);
    min / max - floor
}

impl IslandStats {
    pub fn compute(
        graph: &FeederGraph,
        result: &SolveResult,
        limits: &Limits,
        tolerances: &Tolerances,
    ) -> Self {
        let tol = tolerances.island;
        let [p_floor, q_floor] = limits.island;
        let components = island_flows(graph, result)
            .into_iter()
            .map(|(c, f)| {
                (
                    c,
                    IslandRow {
                        p_dir: direction_margin(&f.p_kw, tol),
                        p_frac: fraction_margin(&f.p_kw, p_floor, tol),
                        q_dir: direction_margin(&f.q_kvar, tol),
                        q_frac: fraction_margin(&f.q_kvar, q_floor, tol),
                    },
                )
            })
            .collect();
        Self { components }
    }

    pub fn outcome(&self) -> MetricOutcome {
        MetricOutcome::from_rows(
            self.components
                .iter()
                .map(|(c, row)| (format!("component_{c}"), row.pass(), row.margin())),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::graph::test_feeders::looped;
    use crate::simulator::{ElementClass, ElementRef, MonitorTrace};

    fn graph() -> FeederGraph {
        FeederGraph::from_circuit(&looped()).expect("builds")
    }

    fn result(p: &[f64], q: &[f64]) -> SolveResult {
        let mut r = SolveResult {
            converged: true,
            step_hours: 1.0,
            times: (1..=p.len()).map(|h| h as f64).collect(),
            ..SolveResult::default()
        };
        r.monitors.insert(
            format!("{PMON_PREFIX}rec1"),
            MonitorTrace {
                element: ElementRef::new(ElementClass::Line, "rec_line"),
                terminal: 1,
                mode: 1,
                channels: BTreeMap::from([
                    ("p_kw".to_string(), p.to_vec()),
                    ("q_kvar".to_string(), q.to_vec()),
                ]),
            },
        );
        r
    }

    #[test]
    fn boundary_flows_are_conserved() {
        let g = graph();
        let flows = island_flows(&g, &result(&[10.0, -4.0, 3.0], &[2.0, 1.0, -1.0]));
        assert_eq!(flows.len(), 2);
        for t in 0..3 {
            let p: f64 = flows.values().map(|f| f.p_kw[t]).sum();
            let q: f64 = flows.values().map(|f| f.q_kvar[t]).sum();
            assert!(p.abs() < 1e-12 && q.abs() < 1e-12);
        }
        let downstream = g.component_of("b4").expect("b4");
        assert_eq!(flows[&downstream].p_kw[0], 10.0);
    }

    #[test]
    fn steady_import_passes() {
        let stats = IslandStats::compute(
            &graph(),
            &result(&[10.0, 5.0], &[2.0, 1.0]),
            &Limits::default(),
            &Tolerances::default(),
        );
        assert!(stats.outcome().pass);
    }

    #[test]
    fn reversal_through_zero_in_p_and_q_fails() {
        let stats = IslandStats::compute(
            &graph(),
            &result(&[10.0, -0.01], &[1.0, -0.01]),
            &Limits::default(),
            &Tolerances::default(),
        );
        let outcome = stats.outcome();
        assert!(!outcome.pass);
        assert!(outcome.margin < 0.0);
    }

    #[test]
    fn any_passing_subtest_saves_the_component() {
        let stats = IslandStats::compute(
            &graph(),
            &result(&[10.0, -0.01], &[1.0, 0.9]),
            &Limits::default(),
            &Tolerances::default(),
        );
        assert!(stats.outcome().pass);
    }
}
