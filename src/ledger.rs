//! Change-line ledger.
//!
//! Every edit the engine makes to a solver session goes through the ledger,
//! which executes it and records it in one of four buffers:
//!
//! - `history`: committed edits, replayed in order on every reset.
//! - `pending`: edits staged by the current trial.
//! - `upgrade_pending`: staged upgrade edits, promoted with `pending`.
//! - `presolve`: edits applied for the next solve only, never persisted.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::simulator::{Command, Simulator};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    history: Vec<Command>,
    pending: Vec<Command>,
    upgrade_pending: Vec<Command>,
    #[serde(skip)]
    presolve: Vec<Command>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes `cmd` and stages it in `pending`.
    pub fn push<S: Simulator + ?Sized>(&mut self, sim: &mut S, cmd: Command) -> Result<()> {
        sim.execute(std::slice::from_ref(&cmd))?;
        self.pending.push(cmd);
        Ok(())
    }

    /// Executes and stages several commands in order.
    pub fn push_all<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        cmds: impl IntoIterator<Item = Command>,
    ) -> Result<()> {
        for cmd in cmds {
            self.push(sim, cmd)?;
        }
        Ok(())
    }

    /// Executes `cmd` and stages it in `upgrade_pending`.
    pub fn push_upgrade<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        cmd: Command,
    ) -> Result<()> {
        sim.execute(std::slice::from_ref(&cmd))?;
        self.upgrade_pending.push(cmd);
        Ok(())
    }

    /// Executes `cmd` for the coming solve only.
    pub fn push_presolve<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        cmd: Command,
    ) -> Result<()> {
        sim.execute(std::slice::from_ref(&cmd))?;
        self.presolve.push(cmd);
        Ok(())
    }

    /// Drops the presolve buffer. Called after every solve.
    pub fn clear_presolve(&mut self) {
        self.presolve.clear();
    }

    /// Promotes `pending` and `upgrade_pending` into `history`.
    pub fn save_state(&mut self) {
        self.history.append(&mut self.pending);
        self.history.append(&mut self.upgrade_pending);
    }

    /// Discards staged edits without touching the solver.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.upgrade_pending.clear();
    }

    /// Starts a fresh solver session and replays `history`.
    ///
    /// With `clear_pending` the staged buffers are dropped; otherwise they
    /// are replayed after `history` so the session still reflects them.
    pub fn reset<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        model_path: &Path,
        clear_pending: bool,
    ) -> Result<()> {
        sim.compile(model_path)?;
        sim.execute(&self.history)?;
        if clear_pending {
            self.discard_pending();
        } else {
            sim.execute(&self.pending)?;
            sim.execute(&self.upgrade_pending)?;
        }
        self.presolve.clear();
        debug!(
            history = self.history.len(),
            pending = self.pending.len(),
            upgrades = self.upgrade_pending.len(),
            "solver session reset"
        );
        Ok(())
    }

    pub fn history(&self) -> &[Command] {
        &self.history
    }

    pub fn pending(&self) -> &[Command] {
        &self.pending
    }

    pub fn upgrade_pending(&self) -> &[Command] {
        &self.upgrade_pending
    }

    pub fn presolve(&self) -> &[Command] {
        &self.presolve
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::simulator::{
        ElementClass, ElementRef, Props, Query, QueryReply, SolveRequest, SweepSimulator,
    };

    const FEEDER: &str = r#"
name = "ledger"

[source]
bus = "src"
base_kv = 12.47

[[lines]]
name = "l1"
bus1 = "src"
bus2 = "b1"
length = 1.0
units = "mi"
r1 = 0.3
x1 = 0.6

[[loads]]
name = "ld1"
bus = "b1"
kw = 100.0
"#;

    fn session() -> SweepSimulator {
        let c = Circuit::from_toml_str(FEEDER).expect("valid");
        let mut sim = SweepSimulator::new().with_model("ledger.toml", c);
        sim.compile(Path::new("ledger.toml")).expect("compiles");
        sim
    }

    fn load_kw(sim: &SweepSimulator) -> Option<f64> {
        match sim
            .query(&Query::ElementProps(ElementRef::new(ElementClass::Load, "ld1")))
            .expect("query")
        {
            QueryReply::Props { props, .. } => props.num("kw"),
            _ => None,
        }
    }

    fn edit_load(kw: f64) -> Command {
        Command::edit(
            ElementRef::new(ElementClass::Load, "ld1"),
            Props::new().with("kw", kw),
        )
    }

    #[test]
    fn save_state_promotes_pending_in_order() {
        let mut sim = session();
        let mut ledger = Ledger::new();
        ledger.push(&mut sim, edit_load(150.0)).expect("push");
        ledger.push_upgrade(&mut sim, edit_load(175.0)).expect("push");
        assert_eq!(ledger.pending().len(), 1);
        ledger.save_state();
        assert!(ledger.pending().is_empty());
        assert!(ledger.upgrade_pending().is_empty());
        assert_eq!(ledger.history().len(), 2);
    }

    #[test]
    fn reset_with_clear_discards_trial_edits() {
        let mut sim = session();
        let mut ledger = Ledger::new();
        ledger.push(&mut sim, edit_load(150.0)).expect("push");
        ledger.save_state();
        ledger.push(&mut sim, edit_load(900.0)).expect("push");
        assert_eq!(load_kw(&sim), Some(900.0));

        ledger
            .reset(&mut sim, Path::new("ledger.toml"), true)
            .expect("resets");
        assert_eq!(load_kw(&sim), Some(150.0));
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn reset_without_clear_keeps_staged_edits_live() {
        let mut sim = session();
        let mut ledger = Ledger::new();
        ledger.push(&mut sim, edit_load(300.0)).expect("push");
        ledger
            .reset(&mut sim, Path::new("ledger.toml"), false)
            .expect("resets");
        assert_eq!(load_kw(&sim), Some(300.0));
        assert_eq!(ledger.pending().len(), 1);
    }

    #[test]
    fn presolve_edits_are_not_persisted() {
        let mut sim = session();
        let mut ledger = Ledger::new();
        ledger.push_presolve(&mut sim, edit_load(10.0)).expect("push");
        sim.solve(&SolveRequest::snapshot()).expect("solves");
        ledger.clear_presolve();
        ledger.save_state();
        assert!(ledger.history().is_empty());
        assert!(ledger.presolve().is_empty());
    }
}
