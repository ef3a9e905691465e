//! Durable, crash-resumable step sequencer.
//!
//! Persists a plan under `.sequencer/<plan>/state.json` and advances it one
//! step per heartbeat (`step-sequencer check`), surviving restarts at any point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use step_sequencer::admin::{StatusReport, add_artifact, archive_label, unblock};
use step_sequencer::core::types::Halt;
use step_sequencer::exit_codes;
use step_sequencer::heartbeat::{Heartbeat, TickReport, WatchStop};
use step_sequencer::io::clock::SystemClock;
use step_sequencer::io::config::{SequencerConfig, resolve_config};
use step_sequencer::io::executor::CommandExecutor;
use step_sequencer::io::init::{DEFAULT_PLAN_ID, InitOptions, SequencerPaths, init_sequencer};
use step_sequencer::io::state_store::{FileStateStore, StateStore};
use step_sequencer::logging;
use step_sequencer::plan::{load_plan_request, persist_plan};
use step_sequencer::runner::{ExternalRunner, StepRunner};

#[derive(Parser)]
#[command(
    name = "step-sequencer",
    version,
    about = "Durable, crash-resumable step sequencer"
)]
struct Cli {
    /// Project root containing `.sequencer/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Plan instance id (a directory under `.sequencer/`).
    #[arg(long, global = true, conflicts_with = "state")]
    plan: Option<String>,

    /// Explicit state file; side artifacts are kept next to it.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.sequencer/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Persist a plan authored by the planning agent, then run one heartbeat.
    Plan {
        /// JSON file with `plan`, `stepQueue` and optional `stepDelayMinutes`.
        file: PathBuf,
        /// Replace a plan that is still in progress.
        #[arg(short, long)]
        force: bool,
        /// Persist only; leave the first step for the next heartbeat.
        #[arg(long)]
        no_check: bool,
    },
    /// Run one heartbeat: decide, run the current step, repeat while steps finish.
    Check,
    /// Run heartbeats at a fixed interval until the plan completes or blocks.
    Watch {
        /// Seconds between heartbeats (defaults to `watch_interval_secs`).
        #[arg(long)]
        interval_secs: Option<u64>,
        /// Stop after this many heartbeats.
        #[arg(long, hide = true)]
        max_ticks: Option<u64>,
    },
    /// Show progress of the plan.
    Status {
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check the state document against its schema and invariants.
    Validate,
    /// Clear a blocked step so the next heartbeat retries it.
    Unblock {
        step: String,
        /// Keep the step's try count instead of starting its retry budget over.
        #[arg(long)]
        keep_tries: bool,
    },
    /// Record an output reference under a key (usually a step id).
    Artifact { key: String, reference: String },
    /// Move the state document into the plan's `archive/` directory.
    Archive,
}

/// Resolved handles shared by every command.
struct Session {
    root: PathBuf,
    store: FileStateStore,
    config: SequencerConfig,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self> {
        let paths = SequencerPaths::new(&cli.root);
        let config = resolve_config(&paths.config_path)?;
        let store = match &cli.state {
            Some(state_path) => FileStateStore::at(state_path),
            None => FileStateStore::new(
                paths.plan(cli.plan.as_deref().unwrap_or(DEFAULT_PLAN_ID))?,
            ),
        };
        Ok(Self {
            root: cli.root.clone(),
            store,
            config,
        })
    }

    /// Build the configured runner and hand a heartbeat over it to `f`.
    fn with_heartbeat<T>(&self, f: impl FnOnce(&Heartbeat<'_>) -> Result<T>) -> Result<T> {
        let clock = SystemClock;
        match &self.config.runner.program {
            Some(program) => {
                let runner = ExternalRunner::new(program, &self.config.executor);
                f(&Heartbeat::new(
                    &self.store,
                    &runner,
                    &clock,
                    self.config.max_retries,
                ))
            }
            None => {
                let executor = CommandExecutor::from_config(&self.config.executor);
                let runner = StepRunner::new(&executor, &clock, self.root.clone())
                    .with_delay_mode(self.config.delay_mode);
                f(&Heartbeat::new(
                    &self.store,
                    &runner,
                    &clock,
                    self.config.max_retries,
                ))
            }
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if let Command::Init { force } = &cli.command {
        return cmd_init(&cli, *force);
    }
    let session = Session::open(&cli)?;
    match &cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Plan {
            file,
            force,
            no_check,
        } => cmd_plan(&session, file, *force, *no_check),
        Command::Check => cmd_check(&session),
        Command::Watch {
            interval_secs,
            max_ticks,
        } => cmd_watch(&session, *interval_secs, *max_ticks),
        Command::Status { json } => cmd_status(&session, *json),
        Command::Validate => cmd_validate(&session),
        Command::Unblock { step, keep_tries } => {
            unblock(&session.store, step, *keep_tries)?;
            println!("unblocked {step}");
            Ok(exit_codes::OK)
        }
        Command::Artifact { key, reference } => {
            add_artifact(&session.store, key, reference)?;
            println!("recorded {reference} under {key}");
            Ok(exit_codes::OK)
        }
        Command::Archive => cmd_archive(&session),
    }
}

fn cmd_init(cli: &Cli, force: bool) -> Result<i32> {
    let paths = init_sequencer(&cli.root, &InitOptions { force })?;
    println!("initialized {}", paths.sequencer_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_plan(session: &Session, file: &Path, force: bool, no_check: bool) -> Result<i32> {
    let request = load_plan_request(file)?;
    request
        .clone()
        .into_checked_state(&session.store.location())?;
    // A finished plan is archived rather than overwritten.
    if matches!(session.store.load(), Ok(Some(ref existing)) if existing.is_done()) {
        session.store.archive(&archive_label(Utc::now()))?;
    }
    let state = persist_plan(&session.store, request, force)?;
    println!(
        "persisted {} step(s) at {}",
        state.step_queue.len(),
        session.store.location()
    );
    if no_check {
        return Ok(exit_codes::OK);
    }
    let report = session.with_heartbeat(|heartbeat| heartbeat.tick())?;
    print_tick(&report);
    Ok(tick_code(&report))
}

fn cmd_check(session: &Session) -> Result<i32> {
    let report = session.with_heartbeat(|heartbeat| heartbeat.tick())?;
    print_tick(&report);
    Ok(tick_code(&report))
}

fn cmd_watch(session: &Session, interval_secs: Option<u64>, max_ticks: Option<u64>) -> Result<i32> {
    let interval = Duration::from_secs(interval_secs.unwrap_or(session.config.watch_interval_secs));
    let stop = session
        .with_heartbeat(|heartbeat| heartbeat.watch(interval, max_ticks, print_tick))?;
    Ok(match stop {
        WatchStop::Completed => exit_codes::COMPLETE,
        WatchStop::Blocked => exit_codes::BLOCKED,
        WatchStop::TickLimit => exit_codes::OK,
    })
}

fn cmd_status(session: &Session, json: bool) -> Result<i32> {
    let Some(state) = session.store.load()? else {
        println!("no plan at {}", session.store.location());
        return Ok(exit_codes::OK);
    };
    let report = StatusReport::from_state(&session.store.location(), &state);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize status")?
        );
    } else {
        print!("{}", report.render());
    }
    Ok(if state.is_done() {
        exit_codes::COMPLETE
    } else if report.is_blocked() {
        exit_codes::BLOCKED
    } else {
        exit_codes::OK
    })
}

fn cmd_validate(session: &Session) -> Result<i32> {
    match session.store.load()? {
        Some(_) => {
            println!("ok");
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("no plan at {}", session.store.location());
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_archive(session: &Session) -> Result<i32> {
    match session.store.archive(&archive_label(Utc::now()))? {
        Some(path) => println!("archived to {}", path.display()),
        None => println!("nothing to archive at {}", session.store.location()),
    }
    Ok(exit_codes::OK)
}

fn print_tick(report: &TickReport) {
    for action in &report.actions {
        println!("{}", action.label());
    }
    if let Some(until) = report.deferred_until {
        println!("deferred until {}", until.to_rfc3339());
    }
}

fn tick_code(report: &TickReport) -> i32 {
    match report.halt {
        Some(Halt::Completed) => exit_codes::COMPLETE,
        Some(Halt::Blocked) => exit_codes::BLOCKED,
        Some(Halt::NoPlan | Halt::Stale) | None => exit_codes::OK,
    }
}
