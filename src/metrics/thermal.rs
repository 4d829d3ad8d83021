//! Thermal statistics: peak emergency loading and hours above normal rating.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StatRow;
use crate::config::Limits;
use crate::simulator::{ElementClass, SolveResult};

/// Per-branch thermal statistics keyed by `class.name`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThermalStats {
    /// Peak loading, percent of emergency rating.
    pub emerg: BTreeMap<String, StatRow>,
    /// Hours spent above the normal rating.
    pub norm_hrs: BTreeMap<String, StatRow>,
}

impl ThermalStats {
    /// Computes statistics for every line and transformer in `result`.
    ///
    /// With `worst_case` each limit becomes `max(limit, observed)`, so a
    /// branch overloaded in the baseline is held to its own loading.
    pub fn compute(result: &SolveResult, limits: &Limits, worst_case: bool, tol: f64) -> Self {
        let mut stats = ThermalStats::default();
        let frame = |limit: f64, observed: f64| {
            if worst_case {
                limit.max(observed)
            } else {
                limit
            }
        };
        for (element, trace) in &result.branches {
            if !matches!(element.class, ElementClass::Line | ElementClass::Transformer) {
                continue;
            }
            let key = element.to_string();
            let peak = trace
                .pct_emerg
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .fold(0.0, f64::max);
            let hours = trace
                .pct_normal
                .iter()
                .filter(|v| v.is_finite() && **v > 100.0 + tol)
                .count() as f64
                * result.step_hours;
            stats.emerg.insert(
                key.clone(),
                StatRow {
                    observed: peak,
                    limit: frame(limits.emerg, peak),
                    integral: 0.0,
                },
            );
            stats.norm_hrs.insert(
                key,
                StatRow {
                    observed: hours,
                    limit: frame(limits.norm_hrs, hours),
                    integral: 0.0,
                },
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_results::with_line_loading;
    use super::*;

    #[test]
    fn peak_and_hours_above_normal() {
        let r = with_line_loading("l1", &[90.0, 120.0, 130.0], &[60.0, 80.0, 87.0]);
        let stats = ThermalStats::compute(&r, &Limits::default(), false, 1e-6);
        let emerg = stats.emerg["line.l1"];
        assert_eq!(emerg.observed, 87.0);
        assert_eq!(emerg.limit, 100.0);
        assert_eq!(stats.norm_hrs["line.l1"].observed, 2.0);
    }

    #[test]
    fn baseline_holds_overloaded_branch_to_its_own_peak() {
        let r = with_line_loading("l1", &[200.0], &[140.0]);
        let framed = ThermalStats::compute(&r, &Limits::default(), true, 1e-6);
        assert_eq!(framed.emerg["line.l1"].limit, 140.0);
        assert_eq!(framed.norm_hrs["line.l1"].limit, 1.0);
    }

    #[test]
    fn reactors_and_nan_samples_are_ignored() {
        let mut r = with_line_loading("l1", &[f64::NAN, 50.0], &[f64::NAN, 30.0]);
        let reactor = crate::simulator::ElementRef::new(ElementClass::Reactor, "x1");
        r.branches.insert(reactor, Default::default());
        let stats = ThermalStats::compute(&r, &Limits::default(), false, 1e-6);
        assert_eq!(stats.emerg.len(), 1);
        assert_eq!(stats.emerg["line.l1"].observed, 30.0);
    }
}
