use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use dircachesim::config::Hierarchy;
use dircachesim::{Machine, TraceOp};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Trace to simulate: JSON list of {cycle, node, op, address}
    #[arg(value_name = "TRACE")]
    trace: PathBuf,

    /// Hierarchy configuration (JSON); defaults apply when omitted
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Statistics output file (defaults to stderr)
    #[arg(short = 'o', long = "stats", value_name = "STATS_OUT")]
    stats_out: Option<PathBuf>,

    /// Give up if the machine has not drained this many cycles after the
    /// last issue
    #[arg(long = "drain-limit", default_value_t = 100_000)]
    drain_limit: u64,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    dircachesim::init_logging();

    let start = Instant::now();
    let options = Options::parse();

    let hier: Hierarchy = match &options.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).wrap_err("parsing hierarchy config")?
        }
        None => Hierarchy::default(),
    };
    hier.validate().wrap_err("invalid hierarchy config")?;

    let raw = std::fs::read_to_string(&options.trace)
        .wrap_err_with(|| format!("reading trace {}", options.trace.display()))?;
    let trace: Vec<TraceOp> = serde_json::from_str(&raw).wrap_err("parsing trace")?;

    let mut machine = Machine::new(hier);
    let completed = machine.run_trace(&trace, options.drain_limit);

    let report = machine.report();
    match &options.stats_out {
        Some(path) => std::fs::write(path, &report)
            .wrap_err_with(|| format!("writing stats to {}", path.display()))?,
        None => eprintln!("{report}"),
    }

    eprintln!(
        "completed {completed} accesses in {} cycles ({:?} wall time)",
        machine.cycle,
        start.elapsed()
    );
    Ok(())
}
