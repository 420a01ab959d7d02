use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chronos_scd::{HistoryPlanner, HistoryStore, PlanManager, PlannerConfig, Record, SchemaDescriptor, SystemProfile};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Plans Type II SCD history mutations", long_about = None)]
struct Args {
    /// Schema descriptor (JSON)
    #[clap(long)]
    schema: PathBuf,

    /// Arriving records, one JSON object per line
    #[clap(long)]
    arriving: PathBuf,

    /// Stored history for the affected keys, one JSON object per line
    #[clap(long)]
    existing: Option<PathBuf>,

    /// Planner configuration (JSON)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Fill nulls on arriving records from the row they supersede
    #[clap(long)]
    carry_forward: bool,

    /// Worker buckets (defaults to the detected core count)
    #[clap(long)]
    workers: Option<usize>,

    /// Apply the plan to the existing history and check the timeline invariant
    #[clap(long)]
    verify: bool,
}

fn main() {
    let args = Args::parse();
    let profile = SystemProfile::detect();

    tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chronos_scd=info")))
    .with_target(false)
    .with_level(true)
    .with_writer(io::stderr)
    .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(profile.worker_threads)
    .enable_all()
    .build();

    let result = match runtime {
        Ok(rt) => rt.block_on(async_main(args, profile)),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns `false` when keys were rejected or verification failed.
async fn async_main(args: Args, profile: SystemProfile) -> Result<bool, Box<dyn Error>> {
    let schema: SchemaDescriptor = serde_json::from_reader(File::open(&args.schema)?)?;
    let mut config = match &args.config {
        Some(path) => PlannerConfig::from_json_file(path)?,
        None => PlannerConfig::default(),
    };
    config.carry_forward_when_null |= args.carry_forward;

    let arriving = read_jsonl(&args.arriving)?;
    let existing = match &args.existing {
        Some(path) => read_jsonl(path)?,
        None => Vec::new(),
    };
    info!("Loaded {} arriving and {} existing record(s)", arriving.len(), existing.len());

    let workers = args.workers.unwrap_or(profile.worker_threads);
    let manager = PlanManager::with_workers(HistoryPlanner::new(config.clone()), workers);
    let batch = manager.plan(arriving, existing.clone(), &schema).await?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for planned in &batch.planned {
        serde_json::to_writer(&mut out, planned)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    for rejected in &batch.rejected {
        warn!("{}", rejected);
    }
    let mut ok = batch.rejected.is_empty();

    if args.verify {
        let mut store = HistoryStore::new(schema, &config);
        store.load(existing)?;
        store.apply(&batch.planned)?;
        let violations = store.verify();
        for v in &violations {
            warn!("Invariant violated: {}", v);
        }
        info!("Verification found {} violation(s)", violations.len());
        ok &= violations.is_empty();
    }

    Ok(ok)
}

fn read_jsonl(path: &Path) -> Result<Vec<Record>, Box<dyn Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| format!("{}:{}: {}", path.display(), n + 1, e))?;
        records.push(record);
    }
    Ok(records)
}
