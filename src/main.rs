use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use log::{error, info};
use nem_ingest::{BackfillOrchestrator, BackfillTarget, Engine, Scheduler, TimeWindow};
use std::path::PathBuf;
use std::sync::Arc;

mod report;
mod settings;

#[derive(Parser)]
#[command(name = "nem_updater")]
#[command(about = "Keep AEMO NEM market series current and reconciled on disk")]
struct Args {
    /// Storage root for the series files (overrides NEM_DATA_PATH)
    #[arg(long, global = true)]
    data_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every enabled series on the configured interval until Ctrl-C
    Run,

    /// Run a single update cycle and print what changed
    Once {
        #[arg(long)]
        json: bool,
    },

    /// Fill a historical range (market time) of one series, or its detected gaps
    Backfill {
        #[arg(short, long)]
        series: String,

        /// Range start, YYYY-MM-DD or YYYY-MM-DD HH:MM
        #[arg(long, value_parser = parse_market_time, required_unless_present = "gaps")]
        start: Option<NaiveDateTime>,

        /// Range end (exclusive)
        #[arg(long, value_parser = parse_market_time, required_unless_present = "gaps")]
        end: Option<NaiveDateTime>,

        /// Backfill the gaps found in the store instead of a range
        #[arg(long, conflicts_with_all = ["start", "end"])]
        gaps: bool,
    },

    /// List missing intervals of one series
    Gaps {
        #[arg(short, long)]
        series: String,
    },

    /// Freshness, size and health of every series
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Rebuild a derived series from its source
    Recompute {
        #[arg(short, long)]
        series: String,
    },

    /// Check every store for duplicate keys, ordering and gaps
    Verify,
}

fn parse_market_time(text: &str) -> std::result::Result<NaiveDateTime, String> {
    let text = text.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("expected YYYY-MM-DD or YYYY-MM-DD HH:MM, got {:?}", text))
}

/// Resolves on Ctrl-C; if the handler cannot be installed the loop runs until killed
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn backfill(
    engine: &Engine,
    series: &str,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
    gaps: bool,
) -> Result<()> {
    let target = if gaps {
        let found = engine.gaps(series).with_context(|| format!("reading gaps of {}", series))?;
        if found.is_empty() {
            println!("✅ {}: no gaps to backfill", series);
            return Ok(());
        }
        report::print_gaps(series, &found);
        BackfillTarget::Gaps(found)
    } else {
        let (Some(start), Some(end)) = (start, end) else {
            bail!("--start and --end are required unless --gaps is given");
        };
        if end <= start {
            bail!("--end ({}) must be after --start ({})", end, start);
        }
        BackfillTarget::Range(TimeWindow::new(start, end))
    };

    let pb = report::progress_bar(series);
    let result = BackfillOrchestrator::new(engine)
        .run(series, target, |done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })
        .await;
    pb.finish_and_clear();

    let result = result.with_context(|| format!("backfilling {}", series))?;
    report::print_backfill(&result);
    match result.error {
        Some(e) => bail!("backfill of {} stopped early: {}", series, e),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()
        .context("configuring the rayon thread pool")?;

    let args = Args::parse();
    let config = settings::from_env(args.data_path).context("reading configuration")?;
    let storage_root = config.storage_root.clone();
    let engine = Arc::new(
        Engine::new(config).with_context(|| format!("starting engine at {}", storage_root.display()))?,
    );

    match args.command {
        Command::Run => {
            println!("🚀 NEM updater");
            println!("Using {} CPU cores", num_cpus::get());
            println!("Storage root: {}", storage_root.display());
            println!(
                "Polling every {}s, Ctrl-C stops after the running cycle",
                engine.config().poll_interval_secs
            );
            println!("{}", "=".repeat(60));

            let mut events = engine.subscribe();
            let listener = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let nem_ingest::EngineEvent::NewEntityDiscovered { series, keys } = event {
                        info!("🆕 {}: {} new unit(s): {}", series, keys.len(), keys.join(", "));
                    }
                }
            });

            Scheduler::new(engine.clone()).run(shutdown_signal()).await;
            listener.abort();
        }
        Command::Once { json } => {
            let report = Scheduler::new(engine.clone()).run_cycle().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report::print_cycle(&report);
            }
            if report.failures() > 0 {
                bail!("{} series failed this cycle", report.failures());
            }
        }
        Command::Backfill {
            series,
            start,
            end,
            gaps,
        } => backfill(&engine, &series, start, end, gaps).await?,
        Command::Gaps { series } => {
            let gaps = engine.gaps(&series).with_context(|| format!("reading {}", series))?;
            report::print_gaps(&series, &gaps);
        }
        Command::Status { json } => {
            let statuses = engine.status_all();
            let market_now = engine.config().market_now();
            if json {
                println!("{}", report::status_json(&statuses, market_now)?);
            } else {
                report::print_status(&statuses, market_now);
            }
        }
        Command::Recompute { series } => {
            let stats = engine
                .recompute_derived(&series)
                .with_context(|| format!("recomputing {}", series))?;
            println!("♻️  {}: rebuilt with {} records", series, stats.total);
        }
        Command::Verify => {
            let issues = report::verify_all(&engine)?;
            if issues > 0 {
                bail!("verification found {} issues", issues);
            }
        }
    }

    Ok(())
}
