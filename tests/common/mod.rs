//! Shared fixtures for integration tests.

#![allow(dead_code)]

use feeder_hca::circuit::Circuit;
use feeder_hca::config::HcaConfig;
use feeder_hca::hca::HcaEngine;
use feeder_hca::simulator::{ElementClass, Query, QueryReply, Simulator, SweepSimulator};

/// Feeder with a lateral that carries almost nothing: `src` feeds `b1`
/// (200 kW load) over a 1 mi trunk, and `b1` feeds `b2` over a 0.1 mi line
/// rated 1 A.
pub const WEAK_LATERAL: &str = r#"
name = "weak_lateral"

[source]
bus = "src"
base_kv = 12.47

[[lines]]
name = "trunk"
bus1 = "src"
bus2 = "b1"
length = 1.0
units = "mi"
r1 = 0.3
x1 = 0.6

[[lines]]
name = "weak"
bus1 = "b1"
bus2 = "b2"
length = 0.1
units = "mi"
r1 = 0.3
x1 = 0.6
normamps = 1.0
emergamps = 1.0

[[loads]]
name = "ld1"
bus = "b1"
kw = 200.0
residential = true
"#;

/// Trivial preset configuration; its circuit is read from `circuits/`.
pub fn trivial_config() -> HcaConfig {
    HcaConfig::trivial()
}

/// Engine over the trivial feeder shipped in `circuits/trivial.toml`.
pub fn trivial_engine(config: HcaConfig) -> HcaEngine<SweepSimulator> {
    HcaEngine::from_config(config, SweepSimulator::new()).expect("trivial engine builds")
}

pub fn weak_circuit() -> Circuit {
    Circuit::from_toml_str(WEAK_LATERAL).expect("valid test circuit")
}

/// A solver session that serves the weak-lateral feeder under the
/// configuration's model path.
pub fn weak_sim(config: &HcaConfig) -> SweepSimulator {
    SweepSimulator::new().with_model(config.model_path(), weak_circuit())
}

pub fn weak_engine(config: HcaConfig) -> HcaEngine<SweepSimulator> {
    let sim = weak_sim(&config);
    HcaEngine::new(config, &weak_circuit(), sim).expect("weak engine builds")
}

/// Classes compared when checking that two sessions agree.
pub const CLASSES: [ElementClass; 8] = [
    ElementClass::Line,
    ElementClass::Transformer,
    ElementClass::RegControl,
    ElementClass::Load,
    ElementClass::PvSystem,
    ElementClass::Storage,
    ElementClass::Generator,
    ElementClass::Monitor,
];

/// Enabled elements of every compared class with their properties.
pub fn session_state(sim: &impl Simulator) -> Vec<(String, QueryReply)> {
    let mut out = Vec::new();
    for class in CLASSES {
        let names = match sim.query(&Query::ActiveElements(class)).expect("query") {
            QueryReply::Names(names) => names,
            other => panic!("expected names for {class}, got {other:?}"),
        };
        for name in names {
            let element = feeder_hca::simulator::ElementRef::new(class, name.as_str());
            let reply = sim
                .query(&Query::ElementProps(element.clone()))
                .expect("query");
            out.push((element.to_string(), reply));
        }
    }
    out
}
