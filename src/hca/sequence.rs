//! Time-sequenced mode.
//!
//! The engine walks solver time from `start_time` to `end_time` in
//! `stepsize` increments. Before each solve the presolve buffer receives
//! the regulator taps scheduled for the period-ending time and re-attaches
//! the shapes of storage proxy loads.

use tracing::info;

use super::{HcaEngine, Resource, RoundOptions, RoundOutcome};
use crate::config::HcaMethod;
use crate::error::{HcaError, Result};
use crate::simulator::{Command, ElementClass, ElementRef, Props, Simulator, SolverTime};

/// A solver clock stepping over `[start, end)`.
///
/// # Examples
///
/// ```
/// use feeder_hca::hca::SequenceClock;
/// use feeder_hca::simulator::SolverTime;
///
/// let mut clock = SequenceClock::new(SolverTime::new(0, 0.0), SolverTime::new(3, 0.0), 3600.0);
/// let mut hours = Vec::new();
///
/// clock.run(|t| hours.push(t.hour));
/// assert_eq!(hours, vec![0, 1, 2]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceClock {
    /// Next time to hand out.
    current: SolverTime,
    /// Exclusive end.
    end: SolverTime,
    step_seconds: f64,
}

impl SequenceClock {
    /// Creates a clock. A non-positive step yields no ticks.
    pub fn new(start: SolverTime, end: SolverTime, step_seconds: f64) -> Self {
        Self {
            current: start,
            end,
            step_seconds,
        }
    }

    /// Returns the current time and advances by one step, or `None` once
    /// the end is reached.
    pub fn tick(&mut self) -> Option<SolverTime> {
        if self.step_seconds <= 0.0
            || self.current.total_seconds() >= self.end.total_seconds() - 1e-9
        {
            return None;
        }
        let t = self.current;
        self.current = t.advance(self.step_seconds);
        Some(t)
    }

    /// Runs `f` at every remaining time.
    pub fn run(&mut self, mut f: impl FnMut(SolverTime)) {
        while let Some(t) = self.tick() {
            f(t);
        }
    }

    pub fn current(&self) -> SolverTime {
        self.current
    }

    /// Number of ticks left.
    pub fn remaining(&self) -> usize {
        if self.step_seconds <= 0.0 {
            return 0;
        }
        let span = self.end.total_seconds() - self.current.total_seconds();
        (span / self.step_seconds - 1e-9).ceil().max(0.0) as usize
    }
}

impl<S: Simulator> HcaEngine<S> {
    /// Stages the time-dependent edits for the coming solve.
    pub(crate) fn stage_presolve(&mut self) -> Result<()> {
        let mut cmds = Vec::new();
        if self.config.hca_method == HcaMethod::Sequence {
            let at = self.time.advance(self.config.stepsize);
            for shape in &self.reg_shapes {
                if let Some(point) = shape.tap_at(at) {
                    cmds.push(Command::edit(
                        ElementRef::new(ElementClass::Transformer, &shape.transformer),
                        Props::new()
                            .with("wdg", point.wdg as f64)
                            .with("tap", point.tap_pu),
                    ));
                }
            }
        }
        for (proxy, shape) in &self.proxies {
            cmds.push(Command::edit(
                ElementRef::new(ElementClass::Load, proxy),
                Props::new().with("daily", shape.as_str()),
            ));
        }
        for cmd in cmds {
            self.ledger.push_presolve(&mut self.sim, cmd)?;
        }
        Ok(())
    }

    /// Clock over the remaining sequence window.
    pub fn clock(&self) -> SequenceClock {
        SequenceClock::new(self.time, self.config.end_time, self.config.stepsize)
    }

    /// Recalculates the hosting capacity at `bus` once per time step until
    /// the end time, advancing the step counter each time.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::Config`] unless the engine runs in sequence mode,
    /// and propagates round errors.
    pub fn run_sequence(&mut self, resource: Resource, bus: &str) -> Result<Vec<RoundOutcome>> {
        if self.config.hca_method != HcaMethod::Sequence {
            return Err(HcaError::Config(
                "run_sequence requires hca_method = \"sequence\"".into(),
            ));
        }
        let mut clock = self.clock();
        let mut outcomes = Vec::with_capacity(clock.remaining());
        while let Some(t) = clock.tick() {
            self.time = t;
            self.cnt += 1;
            let out = self.hca_round(
                RoundOptions::new(resource)
                    .at_bus(bus)
                    .recalculate(true),
            )?;
            outcomes.push(out);
        }
        self.time = clock.current();
        info!(
            steps = outcomes.len(),
            %bus,
            resource = %resource,
            end = %self.time,
            "sequence finished"
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_stops_at_exclusive_end() {
        let mut clock = SequenceClock::new(SolverTime::new(0, 0.0), SolverTime::new(1, 0.0), 1800.0);
        assert_eq!(clock.remaining(), 2);
        assert_eq!(clock.tick(), Some(SolverTime::new(0, 0.0)));
        assert_eq!(clock.tick(), Some(SolverTime::new(0, 1800.0)));
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.current(), SolverTime::new(1, 0.0));
    }

    #[test]
    fn empty_or_stalled_clock_never_ticks() {
        let t = SolverTime::new(5, 0.0);
        let mut clock = SequenceClock::new(t, t, 3600.0);
        let mut was_called = false;
        clock.run(|_| was_called = true);
        assert!(!was_called);
        assert_eq!(SequenceClock::new(t, SolverTime::new(6, 0.0), 0.0).tick(), None);
    }

    #[test]
    fn uneven_step_covers_the_window() {
        let clock = SequenceClock::new(SolverTime::new(0, 0.0), SolverTime::new(1, 0.0), 2400.0);
        assert_eq!(clock.remaining(), 2);
    }
}
