//! Attempt logging under `<plan-dir>/attempts/`.
//!
//! These are product artifacts for operators (what did the executor print on
//! try 2 of step-3?). They are never read back by the sequencer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::StepOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub step_id: String,
    pub tries: u32,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub meta_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempts_dir: &Path, step_id: &str, tries: u32) -> Self {
        let dir = attempts_dir.join(step_id);
        Self {
            log_path: dir.join(format!("{tries}.log")),
            meta_path: dir.join(format!("{tries}.meta.json")),
            dir,
        }
    }
}

/// Write the transcript (if any) and metadata for one attempt.
pub fn write_attempt(
    attempts_dir: &Path,
    meta: &AttemptMeta,
    transcript: Option<&str>,
) -> Result<AttemptPaths> {
    let paths = AttemptPaths::new(attempts_dir, &meta.step_id, meta.tries);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    if let Some(transcript) = transcript {
        fs::write(&paths.log_path, transcript)
            .with_context(|| format!("write {}", paths.log_path.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))?;

    Ok(paths)
}
