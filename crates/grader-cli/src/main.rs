//! Differential grader CLI
//!
//! The `grader` command grades external candidate programs against the
//! built-in reference exercise.
//!
//! ## Commands
//!
//! - `run`: Grade one or more candidate commands and write feedback files
//! - `catalog`: List the units of the reference exercise
//! - `complexity`: Classify the running time of the exercise's timed units

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use grader_core::complexity::auto_grade_time;
use grader_core::obs;
use grader_core::telemetry::level_for_verbosity;
use grader_core::worker;
use grader_core::{
    catalog, EntryPoint, FeedbackSink, Grader, GraderError, GradingConfig, ProcessCommand,
    Registry, Submission, SubmissionReport, TimingPlan, TrialExecutor, WorkerLauncher,
};

#[derive(Parser)]
#[command(name = "grader")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Differential grader: score candidates against a reference", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade candidate programs against the reference exercise
    Run {
        /// Candidate as `<id>=<command line>`; repeatable
        #[arg(short, long = "candidate", required = true)]
        candidates: Vec<String>,

        /// JSON grading configuration; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Submissions graded concurrently
        #[arg(short, long, env = "GRADER_WORKERS")]
        workers: Option<usize>,

        /// Deadline for one candidate call in milliseconds
        #[arg(long, env = "GRADER_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Candidate failures tolerated per unit
        #[arg(long)]
        exception_patience: Option<usize>,

        /// Scale of the final grade
        #[arg(long)]
        max_grade: Option<f64>,

        /// Leave sampled failure details out of the feedback
        #[arg(long)]
        no_failure_details: bool,

        /// Directory receiving `<id>_feedback.txt` files
        #[arg(long, default_value = "feedback")]
        feedback_dir: PathBuf,

        /// Write all submission reports as JSON to this file
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// List the units of the reference exercise
    Catalog {
        /// Also grade the reference against itself
        #[arg(long)]
        self_check: bool,
    },

    /// Classify the running time of the exercise's timed units
    Complexity {
        /// Candidate command line; the reference is measured when omitted
        #[arg(long)]
        command: Option<String>,

        /// Points available per unit
        #[arg(long, default_value = "4")]
        max_points: f64,

        /// Largest input size
        #[arg(long, default_value = "2500")]
        max_n: usize,

        /// Deadline for one call in milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Re-executed by `catalog --self-check` to host the reference as a candidate.
    if worker::requested().is_some() {
        return worker::serve(&catalog::reference()).context("Trial worker failed");
    }

    let cli = Cli::parse();

    grader_core::init_tracing(cli.json, level_for_verbosity(cli.verbose));

    match cli.command {
        Commands::Run {
            candidates,
            config,
            workers,
            timeout_ms,
            exception_patience,
            max_grade,
            no_failure_details,
            feedback_dir,
            summary,
        } => {
            let overrides = ConfigOverrides {
                workers,
                timeout_ms,
                exception_patience,
                max_grade,
                no_failure_details,
            };
            let config = load_config(config.as_deref(), &overrides)?;
            let reports =
                cmd_run(&candidates, config, &feedback_dir, summary.as_deref()).await?;
            for report in &reports {
                println!(
                    "{}\t{:.2}/{}",
                    report.submission_id, report.final_grade, report.max_grade
                );
            }
            Ok(())
        }
        Commands::Catalog { self_check } => cmd_catalog(self_check).await,
        Commands::Complexity {
            command,
            max_points,
            max_n,
            timeout_ms,
        } => cmd_complexity(command.as_deref(), max_points, max_n, timeout_ms).await,
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ConfigOverrides {
    workers: Option<usize>,
    timeout_ms: Option<u64>,
    exception_patience: Option<usize>,
    max_grade: Option<f64>,
    no_failure_details: bool,
}

fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<GradingConfig> {
    let mut config = match path {
        Some(path) => GradingConfig::from_json_file(path)
            .with_context(|| format!("Failed to load grading config {:?}", path))?,
        None => GradingConfig::default(),
    };
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(patience) = overrides.exception_patience {
        config.exception_patience = patience;
    }
    if let Some(max_grade) = overrides.max_grade {
        config.max_grade = max_grade;
    }
    if overrides.no_failure_details {
        config.log_failed_details = false;
    }
    config.validate().context("Invalid grading configuration")?;
    Ok(config)
}

/// Split `<id>=<command line>`.
fn parse_candidate(raw: &str) -> Result<(String, ProcessCommand)> {
    let (id, command_line) = raw
        .split_once('=')
        .with_context(|| format!("Candidate {:?} is not of the form <id>=<command>", raw))?;
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("Candidate {:?} has an empty id", raw);
    }
    // The id names the feedback file.
    if id.contains(['/', '\\']) || id == "." || id == ".." {
        anyhow::bail!("Candidate id {:?} must not contain path separators", id);
    }
    let command = ProcessCommand::parse(command_line)
        .with_context(|| format!("Candidate {:?} has an empty command", id))?;
    Ok((id.to_string(), command))
}

/// Route every graded unit of the exercise to one external command.
fn process_registry(command: &ProcessCommand) -> Registry {
    let mut registry = Registry::new();
    for spec in catalog::plan().ready() {
        registry.register_process(spec.name(), command.clone());
    }
    registry
}

// ---------------------------------------------------------------------------
// Feedback files
// ---------------------------------------------------------------------------

/// Writes each trail to `<dir>/<submission id>_feedback.txt`.
///
/// The first write of a run truncates the file; later writes append.
struct DirectorySink {
    dir: PathBuf,
    opened: Mutex<HashSet<String>>,
}

impl DirectorySink {
    async fn create(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create feedback directory {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            opened: Mutex::new(HashSet::new()),
        })
    }

    fn path_for(&self, submission_id: &str) -> PathBuf {
        self.dir.join(format!("{submission_id}_feedback.txt"))
    }
}

#[async_trait]
impl FeedbackSink for DirectorySink {
    async fn write(&self, submission_id: &str, lines: &[String]) -> grader_core::Result<()> {
        let first = self.opened.lock().await.insert(submission_id.to_string());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(!first)
            .truncate(first)
            .open(self.path_for(submission_id))
            .await?;

        let mut text = lines.join("\n");
        text.push('\n');
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| GraderError::Sink(format!("{submission_id}: {e}")))?;
        file.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    candidates: &[String],
    config: GradingConfig,
    feedback_dir: &Path,
    summary: Option<&Path>,
) -> Result<Vec<SubmissionReport>> {
    let mut submissions = Vec::with_capacity(candidates.len());
    let mut seen = HashSet::new();
    for raw in candidates {
        let (id, command) = parse_candidate(raw)?;
        if !seen.insert(id.clone()) {
            anyhow::bail!("Candidate id {:?} given more than once", id);
        }
        debug!(submission = %id, program = %command.program, "registered candidate");
        submissions.push(Submission::new(id, process_registry(&command)));
    }

    let sink = Arc::new(DirectorySink::create(feedback_dir).await?);
    let grader = Grader::new(catalog::plan(), config, sink).context("Failed to build grader")?;
    info!(run_id = %grader.run_id(), exercise = catalog::NAME, "grading run");

    let reports = grader
        .grade_all(submissions)
        .await
        .context("Grading run failed")?;

    let run_id = grader.run_id().to_string();
    for report in &reports {
        let _span = obs::GradingSpan::enter(&run_id, &report.submission_id);
        for defect in report.harness_defects() {
            warn!(unit = defect.unit(), "unit not graded because of a harness defect");
        }
    }

    if let Some(path) = summary {
        let json = serde_json::to_vec_pretty(&reports)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write summary to {:?}", path))?;
        info!("Wrote summary to {:?}", path);
    }

    Ok(reports)
}

async fn cmd_catalog(self_check: bool) -> Result<()> {
    let plan = catalog::plan();
    println!("Exercise: {}", catalog::NAME);
    for spec in plan.ready() {
        let mut notes = Vec::new();
        if let Some(class) = spec.class() {
            notes.push(format!("class, {} trials per instance", class.trials_per_instance));
        }
        if spec.is_extra_credit() {
            notes.push("extra credit".to_string());
        }
        if spec.has_custom_equality() {
            notes.push("custom equality".to_string());
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", notes.join(", "))
        };
        println!("  {:<20} {:>4} trials{}", spec.name(), spec.trial_count(), notes);
    }

    if self_check {
        let launcher = WorkerLauncher::current_exe(std::iter::empty::<String>())
            .context("Failed to locate the grader executable")?;
        let report = self_check_report(Some(launcher)).await?;
        println!(
            "Self-check: {:.2}/{}",
            report.final_grade, report.max_grade
        );
        if report.harness_defects().next().is_some() {
            anyhow::bail!("Reference exercise has harness defects");
        }
    }
    Ok(())
}

/// Grade the reference against itself, discarding feedback.
///
/// With a launcher, the candidate side runs in trial worker processes.
async fn self_check_report(launcher: Option<WorkerLauncher>) -> Result<SubmissionReport> {
    let sink = Arc::new(grader_core::MemorySink::new());
    let mut grader = Grader::new(catalog::plan(), GradingConfig::default(), sink)?;
    if let Some(launcher) = launcher {
        grader = grader.with_worker(launcher);
    }
    let report = grader
        .grade_submission(&Submission::new("reference", catalog::reference()))
        .await?;
    Ok(report)
}

async fn cmd_complexity(
    command: Option<&str>,
    max_points: f64,
    max_n: usize,
    timeout_ms: u64,
) -> Result<()> {
    let registry = match command {
        Some(line) => {
            let command = ProcessCommand::parse(line).context("Empty candidate command")?;
            process_registry(&command)
        }
        None => catalog::reference(),
    };
    let executor = TrialExecutor::new(Duration::from_millis(timeout_ms));
    let plan = TimingPlan {
        max_n,
        ..TimingPlan::default()
    };

    for case in catalog::timing_cases() {
        let entry: &EntryPoint = registry
            .get(case.unit)
            .with_context(|| format!("No entry point for {}", case.unit))?;
        let grade = auto_grade_time(
            &executor,
            entry,
            case.unit,
            &plan,
            case.expected,
            max_points,
            case.make_input,
        )
        .await
        .with_context(|| format!("Timing analysis of {} failed", case.unit))?;
        println!("{}: {}", case.unit, grade.summary());
    }
    Ok(())
}
