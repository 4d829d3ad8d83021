//! feeder-hca entry point: CLI wiring and config-driven engine runs.

mod cli;

use std::process;

use tracing::info;
use tracing_subscriber::EnvFilter;

use feeder_hca::circuit::Circuit;
use feeder_hca::config::{HcaConfig, HcaMethod};
use feeder_hca::error::{HcaError, Result};
use feeder_hca::hca::{HcaEngine, PerStepData, RoundOptions, WindowRun, run_windows};
use feeder_hca::io::export::{export_hc_csv, write_upgrades_csv};
use feeder_hca::io::reports::write_reports;
use feeder_hca::simulator::SweepSimulator;

use cli::{CliOptions, Parsed};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(opts: &CliOptions) -> Result<HcaConfig> {
    let mut config = match (&opts.config, &opts.preset) {
        (Some(path), _) => HcaConfig::from_toml_file(path)?,
        (None, Some(name)) => HcaConfig::from_preset(name)?,
        (None, None) => HcaConfig::trivial(),
    };
    if let Some(seed) = opts.seed {
        config.seed = Some(seed);
    }
    config.check()?;
    Ok(config)
}

fn require_bus(opts: &CliOptions) -> Result<&str> {
    opts.bus
        .as_deref()
        .ok_or_else(|| HcaError::Config("sequence mode needs --bus".into()))
}

fn export(opts: &CliOptions, data: &PerStepData) -> Result<()> {
    if let Some(path) = &opts.hc_out {
        export_hc_csv(data, path)?;
        eprintln!("Headroom results written to {}", path.display());
    }
    if let Some(path) = &opts.upgrades_out {
        let file = std::fs::File::create(path)?;
        write_upgrades_csv(data, std::io::BufWriter::new(file))?;
        eprintln!("Upgrades written to {}", path.display());
    }
    Ok(())
}

/// Fans a sequence run out over time windows and merges the results.
fn run_parallel(opts: &CliOptions, config: &HcaConfig) -> Result<()> {
    let bus = require_bus(opts)?;
    let circuit = Circuit::from_toml_file(&config.model_path())?;
    let runs = run_windows(config, &circuit, opts.resource, bus, opts.workers, SweepSimulator::new)?;
    for run in &runs {
        for out in &run.outcomes {
            println!("{out}");
        }
    }
    let data = WindowRun::merge(&runs);
    if let (Some(path), Some(last)) = (&opts.snapshot_out, runs.last()) {
        std::fs::write(path, &last.snapshot)?;
        eprintln!("Snapshot of the last window written to {}", path.display());
    }
    export(opts, &data)
}

fn run(opts: &CliOptions) -> Result<()> {
    let mut engine = match &opts.resume {
        Some(path) => HcaEngine::load_from(path, SweepSimulator::new(), true)?,
        None => {
            let config = load_config(opts)?;
            if config.hca_method == HcaMethod::Sequence && opts.workers > 1 {
                return run_parallel(opts, &config);
            }
            HcaEngine::from_config(config, SweepSimulator::new())?
        }
    };

    match engine.config().hca_method {
        HcaMethod::Sequence => {
            let bus = require_bus(opts)?;
            for out in engine.run_sequence(opts.resource, bus)? {
                println!("{out}");
            }
        }
        HcaMethod::TimeSeries => {
            for _ in 0..opts.rounds {
                let mut round = RoundOptions::new(opts.resource);
                if let Some(bus) = &opts.bus {
                    round = round.at_bus(bus.as_str());
                }
                match engine.hca_round(round) {
                    Ok(out) => println!("{out}"),
                    Err(HcaError::NoCandidateBus(resource)) => {
                        info!(%resource, "every candidate bus is exhausted");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    println!();
    for (resource, total) in engine.stotal() {
        println!(
            "stotal {:<4} {:>10.1} kW {:>10.1} kVA",
            resource.as_str(),
            total.kw,
            total.kva
        );
    }

    if let Some(dir) = &opts.reports_dir {
        let result = engine.solve_committed()?;
        write_reports(&result, dir)?;
        eprintln!("Solver reports written to {}", dir.display());
    }
    if let Some(path) = &opts.snapshot_out {
        engine.save_to(path)?;
        eprintln!("Snapshot written to {}", path.display());
    }
    export(opts, engine.data())
}

fn main() {
    init_tracing();

    let opts = match cli::parse_args() {
        Ok(Parsed::Run(opts)) => opts,
        Ok(Parsed::Help) => {
            cli::print_usage();
            process::exit(0);
        }
        Err(e) => {
            eprintln!("error: {e}");
            cli::print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = run(&opts) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
