//! Versioned engine snapshots.
//!
//! A snapshot is a JSON document carrying everything the engine needs to
//! continue a run: configuration, ledger buffers, the graph and its
//! checkpoint, per-step data, sampling state, the counter and solver time,
//! the seeded stream's position, and the evaluator with its baseline.
//! Loading optionally reopens a solver session and replays the ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::HcaConfig;
use crate::error::{HcaError, Result};
use crate::graph::FeederGraph;
use crate::hca::{BisectStep, HcaEngine, HcaRng, PerStepData, Resource, RngState};
use crate::io::shapes::RegulatorShape;
use crate::ledger::Ledger;
use crate::metrics::{EvalReport, MetricEvaluator};
use crate::simulator::{Simulator, SolverTime};

/// Snapshot layout version. Bumped on any incompatible change.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Deserialize)]
struct Header {
    format_version: u32,
}

/// Serialized engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    /// Version of the crate that wrote the snapshot.
    pub crate_version: String,
    pub config: HcaConfig,
    pub model_path: PathBuf,
    pub ledger: Ledger,
    pub graph: FeederGraph,
    pub checkpoint: FeederGraph,
    pub evaluator: MetricEvaluator,
    pub rng: RngState,
    pub data: PerStepData,
    pub visited: Vec<String>,
    pub exhausted: BTreeMap<Resource, BTreeSet<String>>,
    pub cnt: u64,
    pub time: SolverTime,
    pub reg_shapes: Vec<RegulatorShape>,
    pub proxies: BTreeMap<String, String>,
    pub last_report: Option<EvalReport>,
    pub last_failed: Option<EvalReport>,
    #[serde(default)]
    pub bisection_trace: Vec<BisectStep>,
}

impl Snapshot {
    /// Parses snapshot bytes, checking the format version first.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::IncompatibleSnapshot`] for another format
    /// version and [`HcaError::Json`] for malformed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Header = serde_json::from_slice(bytes)?;
        if header.format_version != FORMAT_VERSION {
            return Err(HcaError::IncompatibleSnapshot {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

impl<S: Simulator> HcaEngine<S> {
    /// Captures the engine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            format_version: FORMAT_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            config: self.config.clone(),
            model_path: self.model_path.clone(),
            ledger: self.ledger.clone(),
            graph: self.graph.clone(),
            checkpoint: self.checkpoint.clone(),
            evaluator: self.evaluator.clone(),
            rng: self.rng.state(),
            data: self.data.clone(),
            visited: self.visited.clone(),
            exhausted: self.exhausted.clone(),
            cnt: self.cnt,
            time: self.time,
            reg_shapes: self.reg_shapes.clone(),
            proxies: self.proxies.clone(),
            last_report: self.last_report.clone(),
            last_failed: self.last_failed.clone(),
            bisection_trace: self.bisection_trace.clone(),
        }
    }

    /// Serializes the engine state to bytes.
    pub fn save(&self) -> Result<Vec<u8>> {
        self.snapshot().to_bytes()
    }

    /// Writes [`HcaEngine::save`] output to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.save()?)?;
        info!(path = %path.display(), cnt = self.cnt, "snapshot written");
        Ok(())
    }

    /// Rebuilds an engine from a snapshot around `sim`.
    ///
    /// With `replay` the solver session is reopened from the model file and
    /// the ledger is replayed, staged edits included. Without it `sim` is
    /// taken as is.
    pub fn restore(snapshot: Snapshot, mut sim: S, replay: bool) -> Result<Self> {
        let Snapshot {
            config,
            model_path,
            mut ledger,
            graph,
            checkpoint,
            evaluator,
            rng,
            data,
            visited,
            exhausted,
            cnt,
            time,
            reg_shapes,
            proxies,
            last_report,
            last_failed,
            bisection_trace,
            ..
        } = snapshot;
        if replay {
            ledger.reset(&mut sim, &model_path, false)?;
        }
        info!(feeder = graph.name(), cnt, replay, "engine restored");
        Ok(Self {
            config,
            model_path,
            sim,
            ledger,
            graph,
            checkpoint,
            evaluator,
            rng: HcaRng::from_state(rng),
            data,
            visited,
            exhausted,
            cnt,
            time,
            reg_shapes,
            proxies,
            last_report,
            last_failed,
            bisection_trace,
        })
    }

    /// Parses `bytes` and restores the engine; see [`HcaEngine::restore`].
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::IncompatibleSnapshot`] for another format
    /// version and propagates parse and solver errors.
    pub fn load(bytes: &[u8], sim: S, replay: bool) -> Result<Self> {
        Self::restore(Snapshot::from_bytes(bytes)?, sim, replay)
    }

    pub fn load_from(path: &Path, sim: S, replay: bool) -> Result<Self> {
        Self::restore(Snapshot::read(path)?, sim, replay)
    }
}

/// Per-step data of several snapshots folded into one, sorted by step.
pub fn merge_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a Snapshot>) -> PerStepData {
    let mut merged = PerStepData::default();
    for snap in snapshots {
        merged.merge(snap.data.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::graph::Rating;
    use crate::hca::test_engines::{RADIAL, radial_engine};
    use crate::hca::RoundOptions;
    use crate::simulator::{SweepSimulator, SolveMode};

    fn fresh_sim(config: &HcaConfig) -> SweepSimulator {
        let circuit = Circuit::from_toml_str(RADIAL).expect("valid");
        SweepSimulator::new().with_model(config.model_path(), circuit)
    }

    #[test]
    fn round_trip_keeps_state() {
        let config = HcaConfig::trivial();
        let mut engine = radial_engine(config.clone());
        engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b1")
                    .with_sij(Rating::new(100.0, 125.0)),
            )
            .expect("round");
        let bytes = engine.save().expect("saves");
        let restored =
            HcaEngine::load(&bytes, fresh_sim(&config), true).expect("loads");
        assert_eq!(restored.data(), engine.data());
        assert_eq!(restored.cnt(), engine.cnt());
        assert_eq!(restored.rng_state(), engine.rng_state());
        assert_eq!(restored.ledger(), engine.ledger());
        assert_eq!(restored.evaluator(), engine.evaluator());
        assert_eq!(restored.visited(), engine.visited());
    }

    #[test]
    fn other_format_versions_are_rejected() {
        let engine = radial_engine(HcaConfig::trivial());
        let mut snap = engine.snapshot();
        snap.format_version = FORMAT_VERSION + 1;
        let bytes = snap.to_bytes().expect("serializes");
        let err = HcaEngine::load(&bytes, fresh_sim(engine.config()), false);
        assert!(matches!(
            err,
            Err(HcaError::IncompatibleSnapshot { found, expected }) if found == FORMAT_VERSION + 1 && expected == FORMAT_VERSION
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(Snapshot::from_bytes(b"not json"), Err(HcaError::Json(_))));
    }

    #[test]
    fn snapshot_file_round_trip() {
        let mut config = HcaConfig::trivial();
        config.solnmode = SolveMode::Daily;
        config.numsteps = 4;
        let engine = radial_engine(config);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        engine.save_to(&path).expect("writes");
        let snap = Snapshot::read(&path).expect("reads");
        assert_eq!(snap.crate_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(snap.config.numsteps, 4);
        assert_eq!(snap.graph.bus_count(), engine.graph().bus_count());
    }
}
