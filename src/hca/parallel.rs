//! Sequence runs split over disjoint time windows.
//!
//! Each window gets its own engine, solver session, and stream seeded from
//! the feeder name plus the window bounds. Workers share nothing mutable;
//! their per-step data is merged afterwards, sorted by step counter.

use rayon::prelude::*;
use tracing::info;

use super::{HcaEngine, HcaRng, PerStepData, Resource, RoundOutcome};
use crate::circuit::Circuit;
use crate::config::HcaConfig;
use crate::error::{HcaError, Result};
use crate::simulator::{Simulator, SolverTime};

/// Splits `[start, end)` into at most `n` windows of whole steps.
///
/// Windows are contiguous and as even as the step count allows; the
/// earlier windows take the extra steps.
pub fn split_windows(
    start: SolverTime,
    end: SolverTime,
    step_seconds: f64,
    n: usize,
) -> Vec<(SolverTime, SolverTime)> {
    if step_seconds <= 0.0 || n == 0 {
        return Vec::new();
    }
    let span = end.total_seconds() - start.total_seconds();
    let steps = (span / step_seconds - 1e-9).ceil().max(0.0) as usize;
    let n = n.min(steps);
    if n == 0 {
        return Vec::new();
    }
    let (base, extra) = (steps / n, steps % n);
    let mut out = Vec::with_capacity(n);
    let mut at = start;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        let next = if i + 1 == n {
            end
        } else {
            at.advance(len as f64 * step_seconds)
        };
        out.push((at, next));
        at = next;
    }
    out
}

/// The result of one window.
#[derive(Debug, Clone)]
pub struct WindowRun {
    pub start: SolverTime,
    pub end: SolverTime,
    /// Step counter the window started from.
    pub first_cnt: u64,
    pub outcomes: Vec<RoundOutcome>,
    pub data: PerStepData,
    /// Engine snapshot at the end of the window.
    pub snapshot: Vec<u8>,
}

impl WindowRun {
    /// Folds the data of several runs into one, sorted by step.
    pub fn merge(runs: &[WindowRun]) -> PerStepData {
        let mut merged = PerStepData::default();
        for run in runs {
            merged.merge(run.data.clone());
        }
        merged
    }
}

fn run_window<S: Simulator>(
    config: &HcaConfig,
    circuit: &Circuit,
    sim: S,
    resource: Resource,
    bus: &str,
    (start, end): (SolverTime, SolverTime),
) -> Result<WindowRun> {
    let offset = ((start.total_seconds() - config.start_time.total_seconds()) / config.stepsize)
        .round()
        .max(0.0) as u64;
    let mut window = config.clone();
    window.start_time = start;
    window.end_time = end;

    let mut engine = HcaEngine::new(window, circuit, sim)?;
    engine.rng = HcaRng::for_window(engine.graph.name(), start, end);
    engine.cnt = offset;
    let outcomes = engine.run_sequence(resource, bus)?;
    info!(start = %start, end = %end, steps = outcomes.len(), "window finished");
    Ok(WindowRun {
        start,
        end,
        first_cnt: offset,
        outcomes,
        data: engine.data.clone(),
        snapshot: engine.save()?,
    })
}

/// Runs the sequence over `workers` windows in parallel.
///
/// `make_sim` builds one solver session per window. Runs come back in
/// window order.
///
/// # Errors
///
/// Returns [`HcaError::Config`] unless `config` is in sequence mode, and
/// the first error any window raised.
pub fn run_windows<S, F>(
    config: &HcaConfig,
    circuit: &Circuit,
    resource: Resource,
    bus: &str,
    workers: usize,
    make_sim: F,
) -> Result<Vec<WindowRun>>
where
    S: Simulator,
    F: Fn() -> S + Sync,
{
    if config.hca_method != crate::config::HcaMethod::Sequence {
        return Err(HcaError::Config(
            "window fan-out requires hca_method = \"sequence\"".into(),
        ));
    }
    let windows = split_windows(config.start_time, config.end_time, config.stepsize, workers);
    info!(windows = windows.len(), %bus, "starting window fan-out");
    windows
        .par_iter()
        .map(|w| run_window(config, circuit, make_sim(), resource, bus, *w))
        .collect()
}
