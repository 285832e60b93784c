//! Run orchestrator.
//!
//! `tw run` resolves the configured tasks for a regime, splits each task's
//! inputs across workers, and gives every worker its own browser session.
//! A worker fills the filter form, submits it and collects the results.
//! The orchestrator then merges what the workers found, drops malformed
//! identifiers, reconciles the rest against the notice store and appends
//! the new ones to the task's output file.
//!
//! All sessions are torn down before a worker failure is surfaced.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use thirtyfour::WebDriver;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::collect::Collector;
use crate::config::{Config, TaskConfig};
use crate::db;
use crate::dedup::{self, NoticeStore, SqliteNoticeStore};
use crate::files::{append_records, dedup_lines, read_inputs};
use crate::fill::FillEngine;
use crate::models::{retain_valid, CollectedRecord, MatchPolicy, Regime, SearchMode};
use crate::partition::partition;
use crate::progress::{RunProgressEvent, RunProgressReporter};
use crate::search_spec::{SearchRequest, SearchSpecification, TreeTraversal, WidgetKind};
use crate::session::SessionManager;

/// Command-line overrides for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub regime: Regime,
    pub mode: Option<SearchMode>,
    pub days: Option<u32>,
    pub match_policy: Option<MatchPolicy>,
    pub workers: Option<usize>,
    pub visible: bool,
}

impl RunOptions {
    /// `config` with these overrides applied.
    pub fn apply(&self, config: &Config) -> Config {
        let mut config = config.clone();
        if let Some(days) = self.days {
            config.search.days = days;
        }
        if let Some(policy) = self.match_policy {
            config.search.match_policy = policy;
        }
        if let Some(workers) = self.workers {
            config.search.workers = workers.max(1);
        }
        if self.visible {
            config.browser.headless = false;
        }
        config
    }
}

/// One worker's share of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub worker: usize,
    pub regime: Regime,
    pub mode: SearchMode,
    pub values: Vec<String>,
}

/// Split `inputs` into at most `workers` jobs. Empty slices get no worker.
pub fn plan_jobs(inputs: &[String], workers: usize, regime: Regime, mode: SearchMode) -> Vec<WorkerJob> {
    partition(inputs, workers)
        .into_iter()
        .filter(|slice| !slice.is_empty())
        .enumerate()
        .map(|(worker, values)| WorkerJob {
            worker,
            regime,
            mode,
            values,
        })
        .collect()
}

#[derive(Debug)]
struct WorkerOutcome {
    worker: usize,
    records: Vec<CollectedRecord>,
    pages: u32,
    truncated: bool,
}

/// Concatenate worker results in worker order.
fn merge(mut outcomes: Vec<WorkerOutcome>) -> Vec<CollectedRecord> {
    outcomes.sort_by_key(|outcome| outcome.worker);
    outcomes
        .into_iter()
        .flat_map(|outcome| outcome.records)
        .collect()
}

/// Widget that carries a task's criteria in the form.
fn criteria_kind(mode: SearchMode) -> WidgetKind {
    match mode {
        SearchMode::Keywords => WidgetKind::FreeText,
        SearchMode::Codes => WidgetKind::NestedTree,
    }
}

pub async fn run_search(
    config: &Config,
    options: &RunOptions,
    reporter: &dyn RunProgressReporter,
) -> Result<()> {
    let config = options.apply(config);
    let tasks: Vec<TaskConfig> = config
        .select_tasks(options.regime, options.mode)
        .into_iter()
        .cloned()
        .collect();
    if tasks.is_empty() {
        match options.mode {
            Some(mode) => bail!(
                "No {} tasks configured for regime {}",
                mode,
                options.regime
            ),
            None => bail!("No tasks configured for regime {}", options.regime),
        }
    }

    // Read every input up front so a bad file fails the run before any
    // browser is started.
    let mut planned = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let mode = task
            .mode
            .ok_or_else(|| anyhow!("Task '{}' has no mode", task.name))?;
        let inputs = read_inputs(&task.input)
            .with_context(|| format!("Task '{}' input unreadable", task.name))?;
        planned.push((task, mode, inputs));
    }

    let mut store = SqliteNoticeStore::new(db::connect(&config).await?);
    let config = Arc::new(config);
    let sessions = SessionManager::new(&config.browser, &config.site);

    for (task, mode, inputs) in planned {
        run_task(&config, &sessions, &mut store, task, mode, inputs, reporter).await?;
    }

    println!("ok");
    Ok(())
}

async fn run_task(
    config: &Arc<Config>,
    sessions: &SessionManager,
    store: &mut SqliteNoticeStore,
    task: &TaskConfig,
    mode: SearchMode,
    inputs: Vec<String>,
    reporter: &dyn RunProgressReporter,
) -> Result<()> {
    println!("run {} ({}, {})", task.name, task.regime, mode);
    if inputs.is_empty() {
        warn!(task = task.name.as_str(), input = %task.input.display(), "input file is empty, skipping task");
        println!("  skipped: no inputs");
        return Ok(());
    }

    let jobs = plan_jobs(&inputs, config.search.workers, task.regime, mode);
    reporter.report(RunProgressEvent::TaskStarted {
        task: task.name.clone(),
        inputs: inputs.len() as u64,
        workers: jobs.len() as u64,
    });
    info!(
        task = task.name.as_str(),
        inputs = inputs.len(),
        workers = jobs.len(),
        "starting workers"
    );

    let mut workers = JoinSet::new();
    for job in jobs {
        let config = Arc::clone(config);
        let sessions = sessions.clone();
        workers.spawn(async move {
            let worker = job.worker;
            run_worker(config, sessions, job)
                .await
                .with_context(|| format!("worker {}", worker))
        });
    }

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                if outcome.truncated {
                    warn!(
                        task = task.name.as_str(),
                        worker = outcome.worker,
                        "results were truncated"
                    );
                }
                reporter.report(RunProgressEvent::WorkerFinished {
                    task: task.name.clone(),
                    worker: outcome.worker as u64,
                    found: outcome.records.len() as u64,
                    pages: outcome.pages as u64,
                });
                outcomes.push(outcome);
            }
            Ok(Err(e)) => {
                error!(task = task.name.as_str(), error = %format!("{:#}", e), "worker failed");
                failures.push(e);
            }
            Err(e) => {
                error!(task = task.name.as_str(), error = %e, "worker aborted");
                failures.push(anyhow!("worker aborted: {}", e));
            }
        }
    }
    sessions.shutdown_all().await;

    if let Some(failure) = failures.into_iter().next() {
        return Err(failure.context(format!("Task '{}' failed", task.name)));
    }

    let persisted = persist_new(store, merge(outcomes), task.regime, &task.output)
        .await
        .with_context(|| format!("Failed to reconcile task '{}'", task.name))?;

    reporter.report(RunProgressEvent::TaskFinished {
        task: task.name.clone(),
        found: persisted.found as u64,
        fresh: persisted.fresh as u64,
    });
    println!("  found {}, {} new", persisted.found, persisted.fresh);
    println!(
        "  output: {} ({} lines)",
        task.output.display(),
        persisted.lines
    );
    Ok(())
}

/// What [`persist_new`] did with a task's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persisted {
    pub found: usize,
    pub fresh: usize,
    /// Lines in the output file afterwards.
    pub lines: usize,
}

/// Drop malformed records, keep the ones `store` has not seen, and append
/// them to `output`, which is then deduplicated line by line.
pub async fn persist_new<S: NoticeStore + ?Sized>(
    store: &mut S,
    records: Vec<CollectedRecord>,
    regime: Regime,
    output: &Path,
) -> Result<Persisted> {
    let found = records.len();
    let valid = retain_valid(records, regime);
    let fresh = dedup::reconcile(store, valid, regime).await?;

    append_records(output, &fresh)?;
    let lines = dedup_lines(output)?;
    Ok(Persisted {
        found,
        fresh: fresh.len(),
        lines,
    })
}

async fn run_worker(
    config: Arc<Config>,
    sessions: SessionManager,
    job: WorkerJob,
) -> Result<WorkerOutcome> {
    let session = sessions.start(job.worker).await?;
    let outcome = search(&config, session.driver(), &job).await;
    if let Err(e) = sessions.release(session).await {
        warn!(worker = job.worker, error = %format!("{:#}", e), "session release failed");
    }
    outcome
}

/// Fill, submit and collect for one job. In code mode, codes the tree walk
/// could not find get a second search through the autocomplete box.
async fn search(config: &Config, driver: &WebDriver, job: &WorkerJob) -> Result<WorkerOutcome> {
    let engine = FillEngine::new(
        driver,
        &config.locator,
        &config.site,
        &config.timeouts,
        &config.retry,
    );
    let collector = Collector::new(
        driver,
        &config.locator,
        &config.site,
        &config.timeouts,
        &config.retry,
    );

    let mut request = SearchRequest {
        regime: job.regime,
        mode: Some(job.mode),
        values: job.values.clone(),
        days: config.search.days,
        match_policy: config.search.match_policy,
        traversal: config.search.code_traversal,
        quick_settings: config.search.quick_settings.clone(),
        trade_platforms: config.search.trade_platforms.clone(),
    };
    let mut outcome = WorkerOutcome {
        worker: job.worker,
        records: Vec::new(),
        pages: 0,
        truncated: false,
    };

    loop {
        let spec = SearchSpecification::build(&request)?;
        let report = engine.fill_and_submit(&spec).await?;
        let missing = report.unfilled(criteria_kind(job.mode)).to_vec();

        // With no criteria in the form the listing is every notice of the
        // period, which is not what was asked for.
        if missing.len() < request.values.len() {
            let collection = collector.collect_all().await?;
            outcome.pages += collection.pages;
            outcome.truncated |= collection.truncated;
            outcome
                .records
                .extend(collector.records(collection, job.regime).await?);
        } else {
            warn!(worker = job.worker, ?missing, "no criteria could be applied, skipping results");
        }

        let fallback = job.mode == SearchMode::Codes
            && config.search.text_fallback
            && request.traversal == TreeTraversal::Tree
            && !missing.is_empty();
        if !fallback {
            break;
        }
        info!(worker = job.worker, codes = missing.len(), "searching unmatched codes by text");
        request.values = missing;
        request.traversal = TreeTraversal::Text;
    }

    Ok(outcome)
}

/// Reconcile an existing file of collected lines and print the unseen ones.
pub async fn run_reconcile(config: &Config, regime: Regime, file: &Path) -> Result<()> {
    let records: Vec<CollectedRecord> = read_inputs(file)?
        .iter()
        .filter_map(|line| CollectedRecord::from_line(line, regime))
        .collect();
    let read = records.len();
    let valid = retain_valid(records, regime);
    let dropped = read - valid.len();

    let mut store = SqliteNoticeStore::new(db::connect(config).await?);
    let fresh = dedup::reconcile(&mut store, valid, regime)
        .await
        .with_context(|| format!("Failed to reconcile against {}", regime.table()))?;

    for record in &fresh {
        println!("{}", record.to_line());
    }
    info!(read, dropped, fresh = fresh.len(), "reconcile finished");
    Ok(())
}

/// Print the configured tasks and whether their inputs exist.
pub fn list_tasks(config: &Config) {
    println!(
        "{:<16} {:<7} {:<9} {:<8} {}",
        "TASK", "REGIME", "MODE", "INPUT", "OUTPUT"
    );
    for task in &config.tasks {
        let mode = task
            .mode
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        let input = if task.input.exists() { "OK" } else { "MISSING" };
        println!(
            "{:<16} {:<7} {:<9} {:<8} {}",
            task.name,
            task.regime,
            mode,
            input,
            task.output.display()
        );
    }
}
