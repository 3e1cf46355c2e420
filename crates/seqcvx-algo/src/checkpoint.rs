//! Per-iteration progress files.
//!
//! After every accepted iteration the full [`OptimizationOutput`] is written
//! twice, as JSON:
//!
//! - `<base>_iteration-<n>`: one file per iteration, never overwritten later
//! - `<base>`: always the latest iteration
//!
//! Each file is written to a temporary sibling, synced, and renamed into place,
//! so a crash mid-write leaves the previous checkpoint intact.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use seqcvx_core::OptimizationOutput;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::SolverResult;

#[derive(Debug, Clone)]
pub struct ProgressWriter {
    base: PathBuf,
}

impl ProgressWriter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the snapshot for one iteration.
    pub fn iteration_path(&self, iteration: usize) -> PathBuf {
        let mut name = OsString::from(self.base.as_os_str());
        name.push(format!("_iteration-{iteration}"));
        PathBuf::from(name)
    }

    /// Write both the numbered and the rolling snapshot.
    pub fn write(&self, iteration: usize, output: &OptimizationOutput) -> SolverResult<()> {
        let bytes = serde_json::to_vec_pretty(output)?;
        let numbered = self.iteration_path(iteration);
        write_atomic(&numbered, &bytes)?;
        write_atomic(&self.base, &bytes)?;
        debug!(path = %numbered.display(), "wrote progress checkpoint");
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> SolverResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a snapshot written by [`ProgressWriter`].
pub fn load_progress(path: impl AsRef<Path>) -> SolverResult<OptimizationOutput> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
