mod common;

use common::{session_state, trivial_config, trivial_engine, weak_engine, weak_sim};
use feeder_hca::config::HcaConfig;
use feeder_hca::graph::{Rating, ShuntClass};
use feeder_hca::hca::{Resource, RoundOptions};
use feeder_hca::simulator::{Simulator, SweepSimulator};

#[test]
fn graph_aggregates_match_entries_after_every_operation() {
    let mut engine = trivial_engine(trivial_config());
    engine
        .hca_round(
            RoundOptions::new(Resource::Pv)
                .at_bus("b1")
                .with_sij(Rating::new(200.0, 250.0)),
        )
        .expect("pv round");
    assert!(engine.graph().aggregate_mismatches(1e-9).is_empty());

    engine
        .hca_round(
            RoundOptions::new(Resource::Bat)
                .at_bus("b1")
                .with_sij(Rating::new(100.0, 100.0).with_kwh(400.0)),
        )
        .expect("storage round");
    assert!(engine.graph().aggregate_mismatches(1e-9).is_empty());

    let removed = engine.remove_der(Resource::Pv, "b1").expect("removes");
    assert_eq!(removed.map(|r| r.kw), Some(200.0));
    assert!(engine.graph().aggregate_mismatches(1e-9).is_empty());

    let b1 = engine.graph().bus("b1").expect("bus");
    assert_eq!(b1.total(ShuntClass::PvSystem).kw, 0.0);
    assert_eq!(b1.total(ShuntClass::Storage).kw, 100.0);
    assert_eq!(engine.stotal()[&Resource::Pv].kw, 0.0);
}

#[test]
fn replaying_the_ledger_rebuilds_the_live_session() {
    let mut engine = weak_engine(HcaConfig::trivial());
    engine
        .hca_round(
            RoundOptions::new(Resource::Der)
                .at_bus("b1")
                .with_sij(Rating::new(150.0, 150.0))
                .hciter(false),
        )
        .expect("round");
    engine.upgrade_line("weak", Some(2.0)).expect("upgrade");
    engine
        .hca_round(
            RoundOptions::new(Resource::Pv)
                .at_bus("b1")
                .with_sij(Rating::new(100.0, 125.0))
                .hciter(false),
        )
        .expect("round");

    let ledger = engine.ledger();
    let mut fresh = weak_sim(engine.config());
    fresh.compile(engine.model_path()).expect("compiles");
    fresh.execute(ledger.history()).expect("history");
    fresh.execute(ledger.pending()).expect("pending");
    fresh.execute(ledger.upgrade_pending()).expect("upgrades");

    assert_eq!(session_state(&fresh), session_state(engine.simulator()));
}

#[test]
fn same_seed_gives_the_same_results() {
    let run = || {
        let mut config = trivial_config();
        config.seed = Some(3);
        let mut engine = trivial_engine(config);
        for _ in 0..3 {
            engine
                .hca_round(RoundOptions::new(Resource::Pv))
                .expect("round");
        }
        engine
    };
    let a = run();
    let b = run();
    assert_eq!(a.data(), b.data());
    assert_eq!(a.rng_state(), b.rng_state());
    assert_eq!(a.ledger().history(), b.ledger().history());
}

#[test]
fn missing_model_file_is_an_error() {
    let mut config = trivial_config();
    config.choice = "no_such_feeder".into();
    let result = feeder_hca::hca::HcaEngine::from_config(config, SweepSimulator::new());
    assert!(result.is_err());
}
