use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load the closest `.env` above the working directory. See [`load_dotenv_from`].
pub fn load_dotenv_from_ancestors() -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    load_dotenv_from(&cwd)
}

/// Walk from `start` towards the root and load the first `.env` found.
///
/// A missing file is not an error. Variables already present in the process keep their value.
fn load_dotenv_from(start: &Path) -> Result<Option<PathBuf>> {
    let Some(path) = start
        .ancestors()
        .map(|dir| dir.join(".env"))
        .find(|candidate| candidate.is_file())
    else {
        return Ok(None);
    };

    dotenvy::from_path(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(path))
}
