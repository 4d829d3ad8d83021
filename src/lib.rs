//! Hosting-capacity analysis for radial distribution feeders.
//!
//! The [`hca::HcaEngine`] repeatedly places photovoltaic, storage, or
//! generic DER capacity on a feeder, solves power flow through a
//! [`simulator::Simulator`], scores the result with the
//! [`metrics::MetricEvaluator`], and searches the largest capacity each bus
//! can take without violations.

pub mod circuit;
pub mod config;
pub mod error;
/// Feeder graph: buses, branches, and shunt inventory.
pub mod graph;
pub mod hca;
pub mod io;
pub mod ledger;
pub mod metrics;
pub mod simulator;
pub mod snapshot;
pub mod upgrade;
