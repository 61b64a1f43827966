//! Segment Import CLI Application
//!
//! Command-line front end for the segment-import library:
//! - Imports one or many segment logs in parallel
//! - Loads bus and structured signal definitions into the store
//! - Deletes routes
//! - Lists and queries stored routes, segments and signals
//! - Defines calculated signals from formulas over stored signals

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use segment_import::{
    load_dbc_files, load_structured_definitions, BusDefinitionSet, Camera, CustomSignal,
    DefinitionHandle, ImportControl, ImportReport, ImportRequest, SegmentIdentity, SegmentImporter, Store,
    StoreHandle, TimeRange,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod config;
mod report;

use config::AppConfig;

/// Segment Import - decode driving segments into a queryable database
#[derive(Parser, Debug)]
#[command(name = "segment-cli")]
#[command(about = "Import recorded driving segments into SQLite", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the SQLite database (overrides the config file)
    #[arg(short, long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one or more segment logs (<dongle>--<hex>--<n>/rlog)
    Import {
        #[arg(required = true, value_name = "RLOG")]
        logs: Vec<PathBuf>,

        /// DBC file(s) for CAN decoding (can be repeated)
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,

        /// Store raw CAN frames only
        #[arg(long)]
        no_can_signals: bool,

        /// Override the route id (single log only)
        #[arg(long, requires = "segment")]
        route: Option<String>,

        /// Override the segment number (single log only)
        #[arg(long, requires = "route")]
        segment: Option<u32>,

        /// Parallel imports (default: one per core)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Cancel imports still running after this many seconds
        #[arg(long, value_name = "SECS")]
        deadline_secs: Option<u64>,
    },

    /// Delete a route with all of its segments
    DeleteRoute { route_id: String },

    /// Load signal definitions into the database
    LoadDefinitions {
        /// DBC file(s) (can be repeated)
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,

        /// Structured definition JSON file(s) (can be repeated)
        #[arg(long, value_name = "FILE")]
        structured: Vec<PathBuf>,
    },

    /// List routes
    Routes,

    /// List the segments of a route
    Segments { route_id: String },

    /// List the signals stored for a segment
    Signals { segment_id: i64 },

    /// Print the samples of one signal
    Query {
        segment_id: i64,
        signal: String,

        /// Start of the range (monotonic ns)
        #[arg(long)]
        from: Option<u64>,

        /// End of the range (monotonic ns)
        #[arg(long)]
        to: Option<u64>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the timestamp of one video frame
    Frame {
        segment_id: i64,
        /// fcamera, ecamera, qcamera or dcamera
        camera: String,
        frame: u32,
    },

    /// Re-derive a segment's CAN signal samples from its raw frames
    Rematerialize {
        segment_id: i64,

        /// DBC file(s) (can be repeated)
        #[arg(long, value_name = "FILE")]
        dbc: Vec<PathBuf>,
    },

    /// Define or replace a calculated signal, e.g. `speed_kmh "carState.vEgo * 3.6"`
    DefineSignal {
        name: String,
        formula: String,

        #[arg(long)]
        unit: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Remove a calculated signal
    DropSignal { name: String },

    /// List calculated signals
    CustomSignals,

    /// Print row counts for the whole database
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("Segment Import CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using segment-import library v{}", segment_import::VERSION);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    let database = args
        .database
        .clone()
        .unwrap_or_else(|| config.database.path.clone());

    match args.command {
        Command::Import {
            logs,
            dbc,
            no_can_signals,
            route,
            segment,
            jobs,
            deadline_secs,
        } => {
            let identity = match (route, segment) {
                (Some(route), Some(segment)) => {
                    if logs.len() != 1 {
                        anyhow::bail!("--route/--segment can only be used with a single log");
                    }
                    Some(SegmentIdentity::new(route, segment))
                }
                _ => None,
            };
            let options = ImportOptions {
                dbc,
                no_can_signals,
                identity,
                jobs: jobs.or(config.execution.jobs),
                deadline: deadline_secs
                    .map(Duration::from_secs)
                    .or_else(|| config.execution.deadline()),
            };
            import_mode(&database, &config, logs, options).await
        }
        Command::DeleteRoute { route_id } => {
            let store = open_store(&database)?;
            let outcome = store
                .delete_route(&route_id)
                .with_context(|| format!("Failed to delete route {route_id}"))?;
            println!("{}", report::deletion_summary(&outcome));
            Ok(())
        }
        Command::LoadDefinitions { dbc, structured } => {
            let store = open_store(&database)?;
            load_definitions_mode(&store, &config, &dbc, &structured)
        }
        Command::Routes => {
            let store = open_store(&database)?;
            print!("{}", report::routes_table(&store.list_routes()?));
            Ok(())
        }
        Command::Segments { route_id } => {
            let store = open_store(&database)?;
            print!("{}", report::segments_table(&store.list_segments(&route_id)?));
            Ok(())
        }
        Command::Signals { segment_id } => {
            let store = open_store(&database)?;
            print!("{}", report::signals_table(&store.list_signals(segment_id)?));
            let custom = store.list_custom_signals()?;
            if !custom.is_empty() {
                println!();
                print!("{}", report::custom_signals_table(&custom));
            }
            Ok(())
        }
        Command::Query {
            segment_id,
            signal,
            from,
            to,
            json,
        } => {
            let store = open_store(&database)?;
            let all = TimeRange::all();
            let range = TimeRange::new(from.unwrap_or(all.start_ns), to.unwrap_or(all.end_ns));
            query_mode(&store, segment_id, &signal, range, json)
        }
        Command::Frame {
            segment_id,
            camera,
            frame,
        } => {
            let store = open_store(&database)?;
            let camera: Camera = camera.parse()?;
            match store.query_frame_timestamp(segment_id, camera, frame)? {
                Some(timestamp) => {
                    let wall = store
                        .segment_wall_time(segment_id, timestamp)?
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{camera} frame {frame}: t={timestamp} ns  wall={wall}");
                    Ok(())
                }
                None => anyhow::bail!("No {camera} frame {frame} in segment {segment_id}"),
            }
        }
        Command::Rematerialize { segment_id, dbc } => {
            let store = open_store(&database)?;
            let set = load_bus_definitions(&config, &dbc)?;
            if set.is_empty() {
                anyhow::bail!("No bus definitions loaded; pass --dbc or set definitions.dbc_files");
            }
            let outcome = store.rematerialize_can_signals(segment_id, &set)?;
            println!(
                "Segment {}: {} CAN samples removed, {} inserted",
                outcome.segment_id, outcome.removed, outcome.inserted
            );
            Ok(())
        }
        Command::DefineSignal {
            name,
            formula,
            unit,
            description,
        } => {
            let store = open_store(&database)?;
            let signal = CustomSignal {
                signal_name: name,
                formula,
                unit,
                description,
            };
            let replaced = store
                .define_custom_signal(&signal)
                .with_context(|| format!("Failed to define signal {}", signal.signal_name))?;
            println!(
                "{} {} = {}",
                if replaced { "Replaced" } else { "Defined" },
                signal.signal_name,
                signal.formula
            );
            Ok(())
        }
        Command::DropSignal { name } => {
            let store = open_store(&database)?;
            if !store.delete_custom_signal(&name)? {
                anyhow::bail!("No calculated signal named {name}");
            }
            println!("Removed {name}");
            Ok(())
        }
        Command::CustomSignals => {
            let store = open_store(&database)?;
            print!("{}", report::custom_signals_table(&store.list_custom_signals()?));
            Ok(())
        }
        Command::Stats => {
            let store = open_store(&database)?;
            println!("{}", report::stats_summary(&store.stats()?));
            Ok(())
        }
    }
}

struct ImportOptions {
    dbc: Vec<PathBuf>,
    no_can_signals: bool,
    identity: Option<SegmentIdentity>,
    jobs: Option<usize>,
    deadline: Option<Duration>,
}

fn open_store(database: &Path) -> Result<Store> {
    Store::open(database).with_context(|| format!("Failed to open database {:?}", database))
}

/// Load DBC files from the config and the command line; rejected files are
/// reported and skipped
fn load_bus_definitions(config: &AppConfig, extra: &[PathBuf]) -> Result<BusDefinitionSet> {
    let paths: Vec<PathBuf> = config
        .definitions
        .dbc_files
        .iter()
        .chain(extra)
        .cloned()
        .collect();

    let mut set = BusDefinitionSet::new();
    let load_report = load_dbc_files(&mut set, &paths);
    for (path, messages) in &load_report.loaded {
        log::info!("Loaded {} messages from {:?}", messages, path);
    }
    for (path, err) in &load_report.rejected {
        log::error!("Rejected definition file {:?}: {}", path, err);
    }

    let stats = set.stats();
    log::info!(
        "Bus definitions: {} messages, {} signals from {} files",
        stats.num_messages,
        stats.num_signals,
        stats.num_sources
    );
    Ok(set)
}

fn load_definitions_mode(
    store: &Store,
    config: &AppConfig,
    dbc: &[PathBuf],
    structured: &[PathBuf],
) -> Result<()> {
    let set = load_bus_definitions(config, dbc)?;
    if !set.is_empty() {
        let outcome = store.upsert_can_definitions(&set)?;
        println!(
            "CAN definitions: {} new, {} updated",
            outcome.inserted, outcome.updated
        );
    }

    for path in config.definitions.structured_files.iter().chain(structured) {
        let definitions = load_structured_definitions(path)
            .with_context(|| format!("Failed to load structured definitions {:?}", path))?;
        let outcome = store.upsert_structured_definitions(&definitions)?;
        println!(
            "{}: {} new, {} updated",
            path.display(),
            outcome.inserted,
            outcome.updated
        );
    }
    Ok(())
}

fn query_mode(store: &Store, segment_id: i64, signal: &str, range: TimeRange, json: bool) -> Result<()> {
    let points = store.query_signal_range(segment_id, signal, range)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }

    let clock = store.get_segment(segment_id)?.clock();
    println!("{:>20} {:>32} {:>16}", "TIME (ns)", "WALL (UTC)", "VALUE");
    for point in &points {
        let wall = clock
            .real_time(point.time_ns)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>20} {:>32} {:>16.6}", point.time_ns, wall, point.value);
    }
    log::info!("{} samples of {}", points.len(), signal);
    Ok(())
}

/// Import mode - decode logs on a worker pool, cancel everything on Ctrl-C
async fn import_mode(
    database: &Path,
    config: &AppConfig,
    logs: Vec<PathBuf>,
    options: ImportOptions,
) -> Result<()> {
    let handle = StoreHandle::open(database)
        .with_context(|| format!("Failed to open database {:?}", database))?;

    let set = load_bus_definitions(config, &options.dbc)?;
    if !set.is_empty() {
        handle.connect()?.upsert_can_definitions(&set)?;
    }

    let mut import_config = config.import.clone();
    if options.no_can_signals {
        import_config = import_config.with_can_materialization(false);
    }
    if let Some(deadline) = options.deadline {
        import_config = import_config.with_timeout(deadline);
    }

    let importer = SegmentImporter::new(handle)
        .with_definitions(DefinitionHandle::new(set))
        .with_config(import_config);

    let requests: Vec<ImportRequest> = logs
        .into_iter()
        .map(|path| {
            let request = ImportRequest::new(path);
            match &options.identity {
                Some(identity) => request.with_identity(identity.clone()),
                None => request,
            }
        })
        .collect();

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received; cancelling running imports");
                token.cancel();
            }
        }
    });

    let runtime = tokio::runtime::Handle::current();
    let jobs = options.jobs;
    let results = tokio::task::spawn_blocking(move || {
        import_all(&importer, requests, &token, jobs, &runtime)
    })
    .await
    .context("Import worker panicked")??;

    print!("{}", report::import_summary(&results));

    let failed = results.iter().filter(|(_, result)| result.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} imports failed", failed, results.len());
    }
    Ok(())
}

fn import_all(
    importer: &SegmentImporter,
    requests: Vec<ImportRequest>,
    token: &CancellationToken,
    jobs: Option<usize>,
    runtime: &tokio::runtime::Handle,
) -> Result<Vec<(PathBuf, segment_import::Result<ImportReport>)>> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = jobs {
        builder = builder.num_threads(jobs);
    }
    let pool = builder.build().context("Failed to build import thread pool")?;

    let results = pool.install(|| {
        requests
            .par_iter()
            .map(|request| {
                let (control, mut progress) = ImportControl::new()
                    .with_cancellation(token.clone())
                    .with_progress_channel();

                let label = request.log_path.display().to_string();
                runtime.spawn(async move {
                    while progress.changed().await.is_ok() {
                        let snapshot = progress.borrow_and_update().clone();
                        log::debug!(
                            "{}: {:?} {} messages{}",
                            label,
                            snapshot.phase,
                            snapshot.messages_processed,
                            snapshot
                                .fraction()
                                .map(|f| format!(" ({:.0}%)", f * 100.0))
                                .unwrap_or_default()
                        );
                    }
                });

                let result = importer.import(request, &control);
                if let Err(e) = &result {
                    log::error!("Import of {:?} failed: {}", request.log_path, e);
                }
                (request.log_path.clone(), result)
            })
            .collect()
    });
    Ok(results)
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
