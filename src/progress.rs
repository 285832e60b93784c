//! Run progress reporting.
//!
//! Reports what `tw run` is doing, task by task and worker by worker, so
//! users see which searches are in flight and how many notices turned up.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// A task's inputs were split across `workers` sessions.
    TaskStarted {
        task: String,
        inputs: u64,
        workers: u64,
    },
    /// One worker finished its search.
    WorkerFinished {
        task: String,
        worker: u64,
        found: u64,
        pages: u64,
    },
    /// The task was reconciled and written.
    TaskFinished {
        task: String,
        found: u64,
        fresh: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run kw44  worker 2  1,234 notices over 13 pages".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::TaskStarted {
                task,
                inputs,
                workers,
            } => format!(
                "run {}  {} inputs across {} workers\n",
                task,
                format_number(*inputs),
                workers
            ),
            RunProgressEvent::WorkerFinished {
                task,
                worker,
                found,
                pages,
            } => format!(
                "run {}  worker {}  {} notices over {} pages\n",
                task,
                worker,
                format_number(*found),
                pages
            ),
            RunProgressEvent::TaskFinished { task, found, fresh } => format!(
                "run {}  done  {} found, {} new\n",
                task,
                format_number(*found),
                format_number(*fresh)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::TaskStarted {
                task,
                inputs,
                workers,
            } => serde_json::json!({
                "event": "task_started",
                "task": task,
                "inputs": inputs,
                "workers": workers
            }),
            RunProgressEvent::WorkerFinished {
                task,
                worker,
                found,
                pages,
            } => serde_json::json!({
                "event": "worker_finished",
                "task": task,
                "worker": worker,
                "found": found,
                "pages": pages
            }),
            RunProgressEvent::TaskFinished { task, found, fresh } => serde_json::json!({
                "event": "task_finished",
                "task": task,
                "found": found,
                "new": fresh
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
