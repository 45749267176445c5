//! Append-only run journal with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per run
//! at `<home>/runs/<run_id>/events.jsonl`. Appends take an exclusive file
//! lock so concurrent writers never interleave lines.
//!
//! The journal is an audit trail, not a source of truth: run state lives
//! in the durable store, and a journal write failure never fails a run.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use crate::domain::Event;

/// File-based journal using JSONL format
#[derive(Debug, Clone)]
pub struct Journal {
    /// Directory holding one subdirectory per run
    runs_dir: PathBuf,

    /// Disabled journals accept and drop every event
    enabled: bool,
}

impl Journal {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            enabled: true,
        }
    }

    /// A journal that records nothing
    pub fn disabled() -> Self {
        Self {
            runs_dir: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Path to a run's events file
    pub fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string()).join("events.jsonl")
    }

    /// Append an event to its run's journal
    pub async fn append(&self, event: &Event) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.events_path(event.run_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create run directory: {}", dir.display()))?;
        }

        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        tokio::task::spawn_blocking(move || append_line(&path, &json))
            .await
            .context("Journal writer task panicked")?
    }

    /// Append an event, logging instead of failing
    pub async fn record(&self, event: Event) {
        if let Err(e) = self.append(&event).await {
            warn!(
                run_id = %event.run_id,
                event_type = ?event.event_type,
                error = %e,
                "failed to append journal event"
            );
        }
    }

    /// Replay all events of a run in order
    pub async fn replay(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let path = self.events_path(run_id);
        if !self.enabled || !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Find events of a run matching a predicate
    pub async fn find_events<F>(&self, run_id: Uuid, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let events = self.replay(run_id).await?;
        Ok(events.into_iter().filter(predicate).collect())
    }
}

fn append_line(path: &Path, json: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_exclusive()
        .context("Failed to acquire file lock on events.jsonl")?;

    writeln!(file, "{}", json).context("Failed to write event")?;
    file.flush().context("Failed to flush event")?;

    // Lock is released when file is dropped
    Ok(())
}
