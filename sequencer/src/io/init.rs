//! Layout of `.sequencer/` and its scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{SequencerConfig, write_config};

/// Plan instance id used when none is given.
pub const DEFAULT_PLAN_ID: &str = "default";

/// Canonical paths within `.sequencer/` for a project root.
#[derive(Debug, Clone)]
pub struct SequencerPaths {
    pub root: PathBuf,
    pub sequencer_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl SequencerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sequencer_dir = root.join(".sequencer");
        Self {
            root: root.clone(),
            sequencer_dir: sequencer_dir.clone(),
            config_path: sequencer_dir.join("config.toml"),
            gitignore_path: sequencer_dir.join(".gitignore"),
        }
    }

    /// Paths owned by a single plan instance.
    pub fn plan(&self, plan_id: &str) -> Result<PlanPaths> {
        validate_id(plan_id)?;
        Ok(PlanPaths::in_dir(self.sequencer_dir.join(plan_id)))
    }
}

/// Paths for one plan instance: its state document plus side artifacts.
#[derive(Debug, Clone)]
pub struct PlanPaths {
    pub dir: PathBuf,
    pub state_path: PathBuf,
    pub attempts_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl PlanPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            state_path: dir.join("state.json"),
            attempts_dir: dir.join("attempts"),
            archive_dir: dir.join("archive"),
            dir,
        }
    }

    /// Paths for an explicitly given state file; side artifacts live next to it.
    pub fn for_state_file(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let dir = state_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            attempts_dir: dir.join("attempts"),
            archive_dir: dir.join("archive"),
            state_path,
            dir,
        }
    }
}

/// Plan ids double as directory names.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Options for `init_sequencer`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.sequencer/` with a default `config.toml`.
///
/// Existing plan directories are never touched.
pub fn init_sequencer(root: &Path, options: &InitOptions) -> Result<SequencerPaths> {
    let paths = SequencerPaths::new(root);
    if paths.sequencer_dir.exists() && !paths.sequencer_dir.is_dir() {
        return Err(anyhow!(
            "sequencer init: .sequencer exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "sequencer init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    fs::create_dir_all(&paths.sequencer_dir)
        .with_context(|| format!("create directory {}", paths.sequencer_dir.display()))?;
    write_config(&paths.config_path, &SequencerConfig::default())?;
    fs::write(&paths.gitignore_path, SEQUENCER_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    Ok(paths)
}

const SEQUENCER_GITIGNORE: &str = "*/attempts/\n*/archive/\n*/state.lock\n";
