//! Dripline CLI Entry Point
//!
//! Runs the scheduler and exposes operator and repair commands over a
//! file-backed store.
//!
//! # Usage
//!
//! ```bash
//! # Run the scheduler until Ctrl-C
//! dripline run
//!
//! # One dispatch cycle, then exit
//! dripline tick
//!
//! # Enroll a contact
//! dripline enroll welcome c1 ada@example.com
//!
//! # Repairs are dry runs unless --apply is given
//! dripline fix-drift --workflow welcome
//! dripline fix-drift --workflow welcome --apply --all
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::{info, warn};

use dripline::config::{EngineConfig, RepairSettings};
use dripline::execution::{Engine, EnrollOptions, FileOutbox, MemoryDirectory};
use dripline::repair::{
    collect_stats, failed_samples, fix_drift, inspect, reclaim_orphans, reroute, retry_failed,
    run_to_convergence, spread_pending, waiting_at, RepairOptions, RepairReport, RerouteRequest,
    RetryRequest,
};
use dripline::scheduler::{spawn_scheduler, Dispatcher, SchedulerConfig};
use dripline::store::{ExecutionId, ExecutionRecord, FileStore};
use dripline::workflow::load_registry;
use dripline::{APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "dripline", version, about = "Contact journey execution engine")]
struct Cli {
    /// Config file (defaults to $DRIPLINE_CONFIG or ./dripline.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,

    /// Run a single dispatch cycle
    Tick,

    /// Enroll a contact in the latest version of a workflow
    Enroll {
        workflow_id: String,
        contact_id: String,
        recipient: String,

        /// Allow a second active enrollment
        #[arg(long)]
        allow_reenroll: bool,
    },

    /// Cancel an execution
    Cancel { execution_id: ExecutionId },

    /// Make a waiting execution due now
    SkipDelay { execution_id: ExecutionId },

    /// Dispatch one execution immediately
    Dispatch { execution_id: ExecutionId },

    /// Show one execution against its definition
    Inspect { execution_id: ExecutionId },

    /// Status counts and consistency check
    Stats {
        #[arg(short, long)]
        workflow: Option<String>,
    },

    /// Most recent failures
    Failed {
        #[arg(short, long)]
        workflow: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Pending executions waiting at a node
    WaitingAt {
        workflow_id: String,
        node_id: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Move records waiting out a delay back onto the delay node
    FixDrift {
        #[command(flatten)]
        repair: RepairArgs,
    },

    /// Requeue executions stuck in running
    ReclaimOrphans {
        #[command(flatten)]
        repair: RepairArgs,

        /// Grace period in seconds (defaults to a multiple of the poll interval)
        #[arg(long)]
        grace_secs: Option<i64>,
    },

    /// Reset failed executions with jittered schedules
    RetryFailed {
        #[command(flatten)]
        repair: RepairArgs,

        /// Spread window in minutes
        #[arg(long)]
        window_minutes: Option<i64>,

        /// Restart at this node instead of the failed one
        #[arg(long)]
        reset_to: Option<String>,
    },

    /// Re-stagger past-due pending executions
    SpreadPending {
        #[command(flatten)]
        repair: RepairArgs,

        /// Spread window in minutes
        #[arg(long)]
        window_minutes: Option<i64>,
    },

    /// Move executions at one node (or every pending one) to another
    Reroute {
        #[command(flatten)]
        repair: RepairArgs,

        /// Only move records at this node; omit to reset every pending record
        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: String,

        /// Due time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Re-pin moved executions to this version
        #[arg(long)]
        target_version: Option<u32>,
    },
}

/// Flags shared by repair commands.
#[derive(Args)]
struct RepairArgs {
    /// Restrict to one workflow (required for reroute)
    #[arg(short, long)]
    workflow: Option<String>,

    /// Write changes (default is a dry run)
    #[arg(long)]
    apply: bool,

    /// Keep going batch after batch until done
    #[arg(long)]
    all: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Resume after this execution id
    #[arg(long)]
    cursor: Option<ExecutionId>,
}

impl RepairArgs {
    fn options(&self, settings: &RepairSettings) -> RepairOptions {
        RepairOptions {
            dry_run: !self.apply,
            ..RepairOptions::default()
        }
        .with_batch_size(self.batch_size.unwrap_or(settings.batch_size))
        .with_cursor(self.cursor)
        .with_detail_limit(settings.detail_limit)
    }

    /// Runs one batch, or every batch with `--all`.
    fn run<F, E>(&self, settings: &RepairSettings, mut batch: F) -> Result<RepairReport, E>
    where
        F: FnMut(&RepairOptions) -> Result<RepairReport, E>,
    {
        let options = self.options(settings);
        if self.all {
            run_to_convergence(&options, batch)
        } else {
            batch(&options)
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Contact Journey Execution Engine");
    println!();
}

fn print_record(record: &ExecutionRecord) {
    let scheduled = record
        .scheduled_for
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<10} {} v{} @ {}  due {}",
        record.id,
        record.status.to_string().cyan(),
        record.workflow_id,
        record.workflow_version,
        record.current_node_id,
        scheduled
    );
    if let Some(message) = &record.error_message {
        println!("    {}", message.red());
    }
}

fn print_report(report: &RepairReport) {
    let headline = report.to_string();
    if report.dry_run {
        println!("{}", headline.yellow());
    } else {
        println!("{}", headline.green());
    }
    for detail in &report.fixed_details {
        println!("  {} {}", "fix".green(), detail);
    }
    for detail in &report.skipped_details {
        println!("  {} {}", "skip".yellow(), detail);
    }
    if let Some(cursor) = report.next_cursor {
        println!("More records remain; continue with --cursor {}", cursor);
    }
    if report.dry_run && report.fixed > 0 {
        println!("Dry run only; re-run with --apply to write changes");
    }
}

/// Wired-up engine for one CLI invocation.
struct App {
    config: EngineConfig,
    engine: Arc<Engine>,
    contacts: Arc<MemoryDirectory>,
}

impl App {
    fn open(config: EngineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let registry = load_registry(&config.workflows_dir)?;
        if registry.is_empty() {
            warn!("No workflows loaded from {}", config.workflows_dir.display());
        }

        let contacts = match &config.contacts_path {
            Some(path) if path.exists() => Arc::new(MemoryDirectory::load(path)?),
            _ => Arc::new(MemoryDirectory::new()),
        };

        let engine = Engine::new(
            Arc::new(FileStore::open(&config.store_path)),
            Arc::new(registry),
            Arc::new(FileOutbox::open(&config.outbox_path)),
            contacts.clone(),
        );
        info!("Store: {}", config.store_path.display());

        Ok(Self {
            config,
            engine: Arc::new(engine),
            contacts,
        })
    }

    fn dispatcher(&self) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(Arc::clone(&self.engine));
        dispatcher.set_batch_size(self.config.scheduler.batch_size);
        dispatcher
    }

    /// Merges this invocation's tag edits into the contact fixture.
    fn persist_contacts(&self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(path) = &self.config.contacts_path {
            self.contacts.merge_into(path)?;
        }
        Ok(())
    }
}

fn serve(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let dispatcher = Arc::new(app.dispatcher());
        let (handle, shutdown) = spawn_scheduler(dispatcher, SchedulerConfig::from(&app.config));

        tokio::signal::ctrl_c().await?;
        info!("Interrupt received, finishing current cycle");
        let _ = shutdown.send(true);
        handle.await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    app.persist_contacts()
}

fn execute(command: Command, app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let now = Utc::now();
    let store = app.engine.store().as_ref();
    let registry = app.engine.registry().as_ref();
    let settings = &app.config.repair;

    match command {
        Command::Run => serve(app)?,
        Command::Tick => {
            let report = app.dispatcher().run_cycle(now)?;
            println!("{:#?}", report);
            app.persist_contacts()?;
        }
        Command::Enroll {
            workflow_id,
            contact_id,
            recipient,
            allow_reenroll,
        } => {
            let record = app.engine.enroll(
                &workflow_id,
                &contact_id,
                &recipient,
                EnrollOptions { allow_reenroll },
                now,
            )?;
            print_record(&record);
        }
        Command::Cancel { execution_id } => print_record(&app.engine.cancel(execution_id, now)?),
        Command::SkipDelay { execution_id } => {
            print_record(&app.engine.skip_delay(execution_id, now)?)
        }
        Command::Dispatch { execution_id } => {
            print_record(&app.engine.dispatch_now(execution_id, now)?);
            app.persist_contacts()?;
        }
        Command::Inspect { execution_id } => {
            println!("{}", inspect(store, registry, execution_id, now)?)
        }
        Command::Stats { workflow } => {
            let stats = collect_stats(store, registry, workflow.as_deref(), now, settings.detail_limit)?;
            println!("{}", stats);
        }
        Command::Failed { workflow, limit } => {
            for record in failed_samples(store, workflow.as_deref(), limit)? {
                print_record(&record);
            }
        }
        Command::WaitingAt {
            workflow_id,
            node_id,
            limit,
        } => {
            for record in waiting_at(store, &workflow_id, &node_id, limit)? {
                print_record(&record);
            }
        }
        Command::FixDrift { repair } => {
            let workflow = repair.workflow.clone();
            let report = repair.run(settings, |o| {
                fix_drift(store, registry, workflow.as_deref(), now, o)
            })?;
            print_report(&report);
        }
        Command::ReclaimOrphans { repair, grace_secs } => {
            let grace = grace_secs
                .map(chrono::Duration::seconds)
                .unwrap_or_else(|| app.config.orphan_grace());
            let report = repair.run(settings, |o| reclaim_orphans(store, now, grace, o))?;
            print_report(&report);
        }
        Command::RetryFailed {
            repair,
            window_minutes,
            reset_to,
        } => {
            let request = RetryRequest {
                window: window_minutes
                    .map(chrono::Duration::minutes)
                    .unwrap_or_else(|| app.config.retry_spread()),
                workflow_id: repair.workflow.clone(),
                reset_to_node: reset_to,
            };
            let mut rng = rand::thread_rng();
            let report = repair.run(settings, |o| {
                retry_failed(store, registry, &request, now, o, &mut rng)
            })?;
            print_report(&report);
        }
        Command::SpreadPending {
            repair,
            window_minutes,
        } => {
            let window = window_minutes
                .map(chrono::Duration::minutes)
                .unwrap_or_else(|| app.config.pending_spread());
            let workflow = repair.workflow.clone();
            let mut rng = rand::thread_rng();
            let report = repair.run(settings, |o| {
                spread_pending(store, workflow.as_deref(), window, now, o, &mut rng)
            })?;
            print_report(&report);
        }
        Command::Reroute {
            repair,
            from,
            to,
            at,
            target_version,
        } => {
            let workflow_id = repair
                .workflow
                .clone()
                .ok_or("reroute requires --workflow")?;
            let request = RerouteRequest {
                workflow_id,
                from_node_id: from,
                to_node_id: to,
                scheduled_for: at.unwrap_or(now),
                target_version,
            };
            let report = repair.run(settings, |o| reroute(store, registry, &request, now, o))?;
            print_report(&report);
        }
    }
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    print_banner();

    let config = EngineConfig::resolve(cli.config.as_deref())?;
    let app = App::open(config)?;
    execute(cli.command, &app)
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
