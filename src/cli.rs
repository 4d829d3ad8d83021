use std::env;
use std::path::PathBuf;

use feeder_hca::hca::Resource;

pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub preset: Option<String>,
    pub seed: Option<u32>,
    pub resource: Resource,
    pub bus: Option<String>,
    pub rounds: usize,
    pub workers: usize,
    pub resume: Option<PathBuf>,
    pub snapshot_out: Option<PathBuf>,
    pub hc_out: Option<PathBuf>,
    pub upgrades_out: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
}

pub enum Parsed {
    Run(CliOptions),
    Help,
}

pub fn parse_args() -> Result<Parsed, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse_options(&args)
}

fn parse_options(args: &[String]) -> Result<Parsed, String> {
    let mut i = 0usize;
    let mut opts = CliOptions {
        config: None,
        preset: None,
        seed: None,
        resource: Resource::Pv,
        bus: None,
        rounds: 1,
        workers: 1,
        resume: None,
        snapshot_out: None,
        hc_out: None,
        upgrades_out: None,
        reports_dir: None,
    };

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--config" => {
                i += 1;
                let path = args.next_or_err(i, "missing value for --config (expected a TOML file path)")?;
                if opts.config.replace(PathBuf::from(path)).is_some() {
                    return Err("--config provided more than once".to_string());
                }
            }
            "--preset" => {
                i += 1;
                let name = args.next_or_err(i, "missing value for --preset (expected a preset name)")?;
                if opts.preset.replace(name.to_string()).is_some() {
                    return Err("--preset provided more than once".to_string());
                }
            }
            "--seed" => {
                i += 1;
                let raw = args.next_or_err(i, "missing value for --seed (expected a u32)")?;
                let seed = raw
                    .parse::<u32>()
                    .map_err(|_| format!("--seed value \"{raw}\" is not a valid u32"))?;
                opts.seed = Some(seed);
            }
            "--resource" => {
                i += 1;
                let raw = args.next_or_err(i, "missing value for --resource (expected pv, bat, or der)")?;
                opts.resource = raw.parse()?;
            }
            "--bus" => {
                i += 1;
                opts.bus = Some(args.next_or_err(i, "missing value for --bus (expected a bus name)")?.to_string());
            }
            "--rounds" | "--workers" => {
                i += 1;
                let raw = args.next_or_err(i, &format!("missing value for {flag} (expected a count)"))?;
                let n = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("{flag} value \"{raw}\" is not a positive integer"))?;
                if flag == "--rounds" {
                    opts.rounds = n;
                } else {
                    opts.workers = n;
                }
            }
            "--resume" | "--snapshot-out" | "--hc-out" | "--upgrades-out" | "--reports-dir" => {
                i += 1;
                let path = PathBuf::from(args.next_or_err(i, &format!("missing value for {flag} (expected a path)"))?);
                let slot = match flag {
                    "--resume" => &mut opts.resume,
                    "--snapshot-out" => &mut opts.snapshot_out,
                    "--hc-out" => &mut opts.hc_out,
                    "--upgrades-out" => &mut opts.upgrades_out,
                    _ => &mut opts.reports_dir,
                };
                if slot.replace(path).is_some() {
                    return Err(format!("{flag} provided more than once"));
                }
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if opts.config.is_some() && opts.preset.is_some() {
        return Err(
            "arguments `--config` and `--preset` are mutually exclusive; choose one source"
                .to_string(),
        );
    }
    if opts.config.is_none() && opts.preset.is_none() {
        opts.preset = Some("trivial".to_string());
    }

    Ok(Parsed::Run(opts))
}

trait SliceArgExt {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String>;
}

impl SliceArgExt for [String] {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String> {
        self.get(index)
            .map(String::as_str)
            .ok_or_else(|| err.to_string())
    }
}

pub fn print_usage() {
    eprintln!("feeder-hca: hosting-capacity analysis for radial distribution feeders");
    eprintln!();
    eprintln!("Usage: feeder-hca [--config <toml> | --preset <name>] [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>         Load the analysis configuration from TOML");
    eprintln!("  --preset <name>         Use a built-in preset (trivial, trivial_sequence)");
    eprintln!("  --seed <u32>            Override the seed derived from the feeder name");
    eprintln!("  --resource <kind>       Resource to place: pv, bat, or der (default: pv)");
    eprintln!("  --bus <name>            Place at this bus instead of sampling");
    eprintln!("  --rounds <n>            Rounds to run in time_series mode (default: 1)");
    eprintln!("  --workers <n>           Parallel time windows in sequence mode (default: 1)");
    eprintln!("  --resume <path>         Continue from a snapshot");
    eprintln!("  --snapshot-out <path>   Write a snapshot when done");
    eprintln!("  --hc-out <path>         Export headroom results to CSV");
    eprintln!("  --upgrades-out <path>   Export recorded upgrades to CSV");
    eprintln!("  --reports-dir <dir>     Write solver report tables of the final state");
    eprintln!("  --help                  Show this help message");
    eprintln!();
    eprintln!("Set RUST_LOG to change the log level (default: info).");
}
