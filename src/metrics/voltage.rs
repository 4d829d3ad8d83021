//! Voltage statistics: extrema, violation integrals, and step changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{StatRow, VMON_PREFIX};
use crate::config::Limits;
use crate::simulator::SolveResult;

/// Per-row voltage statistics. Rows are keyed by monitored bus, or by
/// `mv` / `lv` when only the solver's exception table is available.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VoltStats {
    pub min: BTreeMap<String, StatRow>,
    pub max: BTreeMap<String, StatRow>,
    pub diff: BTreeMap<String, StatRow>,
}

/// Voltage time series extracted from a result.
#[derive(Debug, Default)]
pub(crate) struct VoltageSeries {
    pub low: BTreeMap<String, Vec<f64>>,
    pub high: BTreeMap<String, Vec<f64>>,
    /// Absent when step changes cannot be observed.
    pub steps: Option<BTreeMap<String, Vec<f64>>>,
}

/// Reads bus voltages from the `vmon_*` monitors, falling back to the
/// voltage exception table when no voltage monitors were placed.
pub(crate) fn voltage_series(result: &SolveResult) -> VoltageSeries {
    let monitored: BTreeMap<String, Vec<f64>> = result
        .monitors
        .iter()
        .filter_map(|(name, trace)| {
            let bus = name.strip_prefix(VMON_PREFIX)?;
            let v = trace.channel("v_pu")?;
            Some((bus.to_string(), v.to_vec()))
        })
        .collect();
    if !monitored.is_empty() {
        return VoltageSeries {
            low: monitored.clone(),
            high: monitored.clone(),
            steps: Some(monitored),
        };
    }

    let rows = &result.voltage_exceptions;
    let mut series = VoltageSeries::default();
    if rows.is_empty() {
        return series;
    }
    series
        .low
        .insert("mv".into(), rows.iter().map(|r| r.min_voltage).collect());
    series
        .high
        .insert("mv".into(), rows.iter().map(|r| r.max_voltage).collect());
    if rows.iter().any(|r| r.max_lv_voltage > 0.0) {
        series
            .low
            .insert("lv".into(), rows.iter().map(|r| r.min_lv_voltage).collect());
        series
            .high
            .insert("lv".into(), rows.iter().map(|r| r.max_lv_voltage).collect());
    }
    series
}

/// Trapezoidal integral of `excess(v).max(0)` over equally spaced samples.
///
/// Non-finite samples contribute nothing. A single sample counts for one
/// whole interval.
pub fn violation_integral(
    row: &str,
    samples: &[f64],
    step_hours: f64,
    excess: impl Fn(f64) -> f64,
) -> f64 {
    let skipped = samples.iter().filter(|v| !v.is_finite()).count();
    if skipped > 0 {
        warn!(row, skipped, "non-finite samples skipped in violation integral");
    }
    let e: Vec<f64> = samples
        .iter()
        .map(|&v| if v.is_finite() { excess(v).max(0.0) } else { 0.0 })
        .collect();
    match e.len() {
        0 => 0.0,
        1 => e[0] * step_hours,
        _ => e.windows(2).map(|w| 0.5 * (w[0] + w[1]) * step_hours).sum(),
    }
}

/// Largest absolute change between consecutive finite samples.
pub fn max_step_change(samples: &[f64]) -> f64 {
    samples
        .windows(2)
        .filter(|w| w[0].is_finite() && w[1].is_finite())
        .map(|w| (w[1] - w[0]).abs())
        .fold(0.0, f64::max)
}

fn finite_extremum(samples: &[f64], pick: fn(f64, f64) -> f64) -> Option<f64> {
    samples.iter().copied().filter(|v| v.is_finite()).reduce(pick)
}

impl VoltStats {
    /// Computes statistics for `result`.
    ///
    /// With `worst_case` the limits are framed by the observation:
    /// `min(vmin, observed)` for low rows, `max(vmax, observed)` for high
    /// rows and `max(vdiff, observed)` for step rows.
    pub fn compute(result: &SolveResult, limits: &Limits, worst_case: bool) -> Self {
        let series = voltage_series(result);
        let dt = result.step_hours;
        let mut stats = VoltStats::default();

        for (key, v) in &series.low {
            let Some(observed) = finite_extremum(v, f64::min) else {
                warn!(row = key.as_str(), "no finite voltage samples");
                continue;
            };
            stats.min.insert(
                key.clone(),
                StatRow {
                    observed,
                    limit: if worst_case {
                        limits.vmin.min(observed)
                    } else {
                        limits.vmin
                    },
                    integral: violation_integral(key, v, dt, |x| limits.vmin - x),
                },
            );
        }
        for (key, v) in &series.high {
            let Some(observed) = finite_extremum(v, f64::max) else {
                continue;
            };
            stats.max.insert(
                key.clone(),
                StatRow {
                    observed,
                    limit: if worst_case {
                        limits.vmax.max(observed)
                    } else {
                        limits.vmax
                    },
                    integral: violation_integral(key, v, dt, |x| x - limits.vmax),
                },
            );
        }
        if let Some(steps) = &series.steps {
            for (key, v) in steps {
                let observed = max_step_change(v);
                stats.diff.insert(
                    key.clone(),
                    StatRow {
                        observed,
                        limit: if worst_case {
                            limits.vdiff.max(observed)
                        } else {
                            limits.vdiff
                        },
                        integral: 0.0,
                    },
                );
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_results::with_voltages;
    use super::*;
    use crate::io::reports::VoltageException;

    #[test]
    fn integral_is_trapezoidal() {
        let area = violation_integral("b1", &[1.0, 1.07, 1.07, 1.0], 1.0, |v| v - 1.05);
        assert!((area - 0.04).abs() < 1e-12, "area = {area}");
        assert_eq!(violation_integral("b1", &[], 1.0, |v| v), 0.0);
    }

    #[test]
    fn single_sample_counts_one_interval() {
        let area = violation_integral("b1", &[0.93], 0.5, |v| 0.95 - v);
        assert!((area - 0.01).abs() < 1e-12);
    }

    #[test]
    fn nan_samples_contribute_nothing() {
        let area = violation_integral("b1", &[f64::NAN, 1.06, f64::NAN], 1.0, |v| v - 1.05);
        assert!((area - 0.01).abs() < 1e-12);
        assert_eq!(max_step_change(&[1.0, f64::NAN, 1.2]), 0.0);
    }

    #[test]
    fn worst_case_frames_limits_by_observation() {
        let r = with_voltages(&[("b1", &[0.93, 1.08]), ("b2", &[0.99, 1.0])]);
        let limits = Limits::default();
        let framed = VoltStats::compute(&r, &limits, true);
        assert_eq!(framed.min["b1"].limit, 0.93);
        assert_eq!(framed.min["b2"].limit, 0.95);
        assert_eq!(framed.max["b1"].limit, 1.08);
        assert_eq!(framed.max["b2"].limit, 1.05);
        assert!((framed.diff["b1"].limit - 0.15).abs() < 1e-12);

        let plain = VoltStats::compute(&r, &limits, false);
        assert_eq!(plain.min["b1"].limit, 0.95);
        assert_eq!(plain.min["b1"].observed, 0.93);
    }

    #[test]
    fn exception_table_is_the_fallback() {
        let r = SolveResult {
            converged: true,
            step_hours: 1.0,
            times: vec![1.0],
            voltage_exceptions: vec![VoltageException {
                hour: 1.0,
                min_voltage: 0.97,
                max_voltage: 1.01,
                min_lv_voltage: 0.0,
                max_lv_voltage: 0.0,
            }],
            ..SolveResult::default()
        };
        let stats = VoltStats::compute(&r, &Limits::default(), false);
        assert_eq!(stats.min["mv"].observed, 0.97);
        assert!(!stats.min.contains_key("lv"));
        assert!(stats.diff.is_empty());
    }
}
