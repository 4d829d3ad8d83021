//! The adapter contract over a power-flow solver.
//!
//! The engine talks to the solver only through [`Simulator`]: it pushes
//! [`Command`]s, asks for a solve, reads back a [`SolveResult`] bundle, and
//! issues point [`Query`]s. The adapter holds no engine state beyond its
//! current session.

pub mod command;
pub mod sweep;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io::reports::{IntervalTotals, OverloadRecord, VoltageException};

pub use command::{Command, ElementClass, ElementRef, PropValue, Props};
pub use sweep::SweepSimulator;

/// Solution mode passed through to the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveMode {
    /// Single operating point, shape multipliers fixed at 1.0.
    #[default]
    Snapshot,
    /// Time steps follow daily shapes.
    Daily,
    /// Time steps follow yearly shapes.
    Yearly,
}

/// A solver clock position, `(hour, second)` with `second < 3600`.
///
/// # Examples
///
/// ```
/// use feeder_hca::simulator::SolverTime;
///
/// let t = SolverTime::new(0, 0.0).advance(5400.0);
/// assert_eq!(t, SolverTime::new(1, 1800.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(from = "(u32, f64)", into = "(u32, f64)")]
pub struct SolverTime {
    pub hour: u32,
    pub second: f64,
}

impl SolverTime {
    /// Creates a normalised time; seconds beyond an hour roll into `hour`.
    pub fn new(hour: u32, second: f64) -> Self {
        let extra = (second / 3600.0).floor();
        Self {
            hour: hour + extra.max(0.0) as u32,
            second: second - extra.max(0.0) * 3600.0,
        }
    }

    pub fn total_seconds(&self) -> f64 {
        self.hour as f64 * 3600.0 + self.second
    }

    pub fn hours(&self) -> f64 {
        self.total_seconds() / 3600.0
    }

    /// Returns the time `step_seconds` later.
    pub fn advance(&self, step_seconds: f64) -> Self {
        Self::new(self.hour, self.second + step_seconds)
    }
}

impl From<(u32, f64)> for SolverTime {
    fn from((hour, second): (u32, f64)) -> Self {
        Self::new(hour, second)
    }
}

impl From<SolverTime> for (u32, f64) {
    fn from(t: SolverTime) -> Self {
        (t.hour, t.second)
    }
}

impl fmt::Display for SolverTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.hour, self.second)
    }
}

/// Parameters of one solve call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveRequest {
    pub mode: SolveMode,
    pub start: SolverTime,
    pub num_steps: usize,
    pub step_seconds: f64,
}

impl SolveRequest {
    pub fn snapshot() -> Self {
        Self {
            mode: SolveMode::Snapshot,
            start: SolverTime::default(),
            num_steps: 1,
            step_seconds: 3600.0,
        }
    }
}

/// Time series for one power-delivery element, measured at terminal 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchTrace {
    pub p_kw: Vec<f64>,
    pub q_kvar: Vec<f64>,
    pub amps: Vec<f64>,
    pub pct_normal: Vec<f64>,
    pub pct_emerg: Vec<f64>,
}

/// Recorded channels of one monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorTrace {
    pub element: ElementRef,
    pub terminal: usize,
    /// 0 records `v_pu` and `i_amps`; 1 records `p_kw` and `q_kvar`.
    pub mode: u32,
    pub channels: BTreeMap<String, Vec<f64>>,
}

impl MonitorTrace {
    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channels.get(name).map(Vec::as_slice)
    }
}

/// Everything a solve produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveResult {
    pub converged: bool,
    /// Duration represented by each sample, in hours.
    pub step_hours: f64,
    /// Period-ending time of each sample, in hours.
    pub times: Vec<f64>,
    /// Per-unit voltage of every energised bus.
    pub node_vpu: BTreeMap<String, Vec<f64>>,
    pub branches: BTreeMap<ElementRef, BranchTrace>,
    pub monitors: BTreeMap<String, MonitorTrace>,
    pub voltage_exceptions: Vec<VoltageException>,
    pub overloads: Vec<OverloadRecord>,
    pub totals: Vec<IntervalTotals>,
}

impl SolveResult {
    /// A result flagged as not converged, with no data.
    pub fn failed(step_hours: f64) -> Self {
        Self {
            converged: false,
            step_hours,
            ..Self::default()
        }
    }

    pub fn num_samples(&self) -> usize {
        self.times.len()
    }

    /// Smallest node voltage over all buses and samples.
    pub fn min_vpu(&self) -> Option<f64> {
        self.node_vpu
            .values()
            .flatten()
            .copied()
            .filter(|v| v.is_finite())
            .reduce(f64::min)
    }

    /// Convergence after the minimum-voltage heuristic: a solve the solver
    /// reports as converged is downgraded when any node sits below `floor`.
    pub fn converged_above(&self, floor: f64) -> bool {
        self.converged && self.min_vpu().is_none_or(|v| v >= floor)
    }
}

/// Read-back requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Current properties and enabled state of an element.
    ElementProps(ElementRef),
    /// Base line-to-line kV of a bus.
    BusBaseKv(String),
    /// Names of transformers sharing the bus pair of the named transformer,
    /// the named one included.
    ParallelTransformers(String),
    /// Properties of a regulator control.
    RegControl(String),
    /// Last recorded trace of a monitor.
    Monitor(String),
    /// Names of enabled elements of a class.
    ActiveElements(ElementClass),
}

/// Answers to [`Query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryReply {
    Props { enabled: bool, props: Props },
    Number(f64),
    Names(Vec<String>),
    Trace(MonitorTrace),
    Missing,
}

/// A power-flow solver session.
pub trait Simulator {
    /// Starts a fresh session and loads the base circuit at `model_path`.
    fn compile(&mut self, model_path: &Path) -> Result<()>;

    /// Applies commands in order.
    fn execute(&mut self, commands: &[Command]) -> Result<()>;

    /// Runs the solver. Non-convergence is reported in the result, not as
    /// an error.
    fn solve(&mut self, request: &SolveRequest) -> Result<SolveResult>;

    fn query(&self, query: &Query) -> Result<QueryReply>;

    /// Whether the most recent solve converged.
    fn converged(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_time_normalises_seconds() {
        let t = SolverTime::new(23, 3600.0);
        assert_eq!(t.hour, 24);
        assert_eq!(t.second, 0.0);
        assert!(SolverTime::new(1, 0.0) < SolverTime::new(1, 1.0));
        assert_eq!(SolverTime::new(2, 1800.0).hours(), 2.5);
    }

    #[test]
    fn min_vpu_floor_downgrades_convergence() {
        let mut result = SolveResult {
            converged: true,
            step_hours: 1.0,
            times: vec![1.0],
            ..SolveResult::default()
        };
        result.node_vpu.insert("b1".into(), vec![0.42]);
        assert!(!result.converged_above(0.5));
        assert!(result.converged_above(0.4));
    }
}
