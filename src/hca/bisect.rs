//! Capacity search between a feasible lower and an infeasible upper bound.
//!
//! The search is a loop over the `(lower, upper)` pair. With both bounds
//! known the trial is their kW midpoint; with only one known the open side
//! is widened by the configured [`BoundStrategy`](crate::config::BoundStrategy).
//! Non-rating fields of a trial scale with its kW.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{HcaEngine, ResourceKey, RoundOptions};
use crate::config::{BoundStrategy, SearchConfig};
use crate::error::{HcaError, Result};
use crate::graph::Rating;
use crate::metrics::EvalReport;
use crate::simulator::Simulator;

/// Marker recorded in violation lists when a trial did not converge.
pub const NON_CONVERGED: &str = "solver_nonconvergence";

/// The bounds in force when one trial was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BisectStep {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub trial: f64,
    pub passed: bool,
}

/// Limits and widening rule of one capacity search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SearchParams {
    pub kw_min: f64,
    pub kw_tol: f64,
    pub kw_max: f64,
    pub strategy: BoundStrategy,
}

impl From<&SearchConfig> for SearchParams {
    fn from(c: &SearchConfig) -> Self {
        Self {
            kw_min: c.kw_min,
            kw_tol: c.kw_tol,
            kw_max: c.kw_max,
            strategy: c.bnd_strategy,
        }
    }
}

impl SearchParams {
    /// Configured limits with the round's overrides applied.
    pub fn for_round(config: &SearchConfig, opts: &RoundOptions) -> Self {
        let base = Self::from(config);
        Self {
            kw_min: opts.kw_min.unwrap_or(base.kw_min),
            kw_tol: opts.kw_tol.unwrap_or(base.kw_tol),
            kw_max: base.kw_max,
            strategy: opts.bnd_strategy.unwrap_or(base.strategy),
        }
    }
}

/// Outcome of one trial solve.
#[derive(Debug, Clone)]
pub(crate) struct Trial {
    pub converged: bool,
    pub report: Option<EvalReport>,
}

impl Trial {
    pub fn passed(&self) -> bool {
        self.converged && self.report.as_ref().is_some_and(|r| !r.has_violations())
    }

    pub fn violations(&self) -> Vec<String> {
        match &self.report {
            Some(r) => r.violation_list(),
            None => vec![NON_CONVERGED.to_string()],
        }
    }
}

/// `rating` rescaled so that its kW equals `kw`.
fn resized(rating: &Rating, kw: f64) -> Rating {
    if rating.kw.abs() <= f64::EPSILON {
        return Rating {
            kw,
            ..Rating::default()
        };
    }
    rating.scaled(kw / rating.kw)
}

impl<S: Simulator> HcaEngine<S> {
    /// Rolls back to the last commit, places `rating` at the key's bus,
    /// solves, and evaluates.
    pub(crate) fn try_capacity(
        &mut self,
        key: &ResourceKey,
        name: &str,
        rating: Rating,
    ) -> Result<Trial> {
        self.rollback()?;
        if rating.kw > 0.0 {
            self.inject(key, name, rating)?;
        }
        let result = self.solve()?;
        if !result.converged {
            warn!(%key, kw = rating.kw, "trial did not converge");
            return Ok(Trial {
                converged: false,
                report: None,
            });
        }
        let report = self.evaluator.evaluate(&self.graph, &result);
        if report.has_violations() {
            self.last_failed = Some(report.clone());
        }
        Ok(Trial {
            converged: true,
            report: Some(report),
        })
    }

    /// Searches the largest passing capacity between `lower` and `upper`.
    ///
    /// Returns the limit, zero when it falls below `kw_min`, together with
    /// the violations of the last failing trial. A downward search keeps
    /// shrinking until a trial passes; a passing trial below `kw_min` still
    /// serves as the lower bound.
    ///
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::BisectionCorner`] when both bounds are missing,
    /// `lower` exceeds `upper`, or an upward search starts from zero.
    pub(crate) fn bisect(
        &mut self,
        key: &ResourceKey,
        name: &str,
        lower: Option<Rating>,
        upper: Option<Rating>,
        params: SearchParams,
    ) -> Result<(Rating, Vec<String>)> {
        let SearchParams {
            kw_min,
            kw_tol,
            kw_max,
            strategy,
        } = params;
        let zero = Rating::default();
        let floor = |r: Rating| if r.kw < kw_min { zero } else { r };

        let (mut lo, mut hi) = (lower, upper);
        let mut violations = Vec::new();
        self.bisection_trace.clear();

        loop {
            let trial = match (lo, hi) {
                (None, None) => {
                    return Err(HcaError::BisectionCorner("no bound is known".into()));
                }
                (Some(l), Some(h)) => {
                    if l.kw > h.kw {
                        return Err(HcaError::BisectionCorner(format!(
                            "lower {} kW above upper {} kW",
                            l.kw, h.kw
                        )));
                    }
                    if h.kw - l.kw < kw_tol {
                        return Ok((floor(l), violations));
                    }
                    resized(&h, l.kw + (h.kw - l.kw) / 2.0)
                }
                (Some(l), None) => {
                    if l.kw <= 0.0 {
                        return Err(HcaError::BisectionCorner(
                            "upward search from zero capacity".into(),
                        ));
                    }
                    resized(&l, strategy.grow(l.kw).min(kw_max.max(l.kw)))
                }
                (None, Some(h)) => {
                    let kw = strategy.shrink(h.kw);
                    if kw <= 0.0 {
                        return Ok((zero, violations));
                    }
                    resized(&h, kw)
                }
            };

            let outcome = self.try_capacity(key, name, trial)?;
            let passed = outcome.passed();
            self.bisection_trace.push(BisectStep {
                lower: lo.map(|r| r.kw),
                upper: hi.map(|r| r.kw),
                trial: trial.kw,
                passed,
            });
            debug!(%key, kw = trial.kw, passed, "bisection trial");

            if passed {
                match hi {
                    None if trial.kw >= kw_max => {
                        warn!(%key, kw_max, "search reached the growth ceiling");
                        return Ok((trial, violations));
                    }
                    None => lo = Some(trial),
                    Some(h) if h.kw - trial.kw < kw_tol => return Ok((floor(trial), violations)),
                    Some(_) => lo = Some(trial),
                }
            } else {
                violations = outcome.violations();
                if trial.kw < kw_min {
                    return Ok((zero, violations));
                }
                hi = Some(trial);
            }
        }
    }
}
