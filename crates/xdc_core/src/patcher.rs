//! Binary delta patches.
//!
//! Mods are usually distributed as delta patches against the vanilla binary. Applying
//! them is delegated to an external patcher; [`PatchStage`] runs independent patch jobs
//! concurrently, bounded by a semaphore.

use crate::error::{Error, Result};
use crate::layout::SourceId;
use crate::tool::{ToolInvocation, ToolRunner};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// File extensions treated as delta patches rather than ready-made binaries.
pub const PATCH_EXTENSIONS: &[&str] = &["xdelta", "vcdiff"];

/// Whether `path` looks like a delta patch.
pub fn is_patch_file(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| PATCH_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)))
        .unwrap_or(false)
}

/// Capability to apply and create binary delta patches.
pub trait DeltaPatcher: Send + Sync {
    /// Write `source` patched with `patch` to `target`.
    fn apply(&self, source: &Utf8Path, patch: &Utf8Path, target: &Utf8Path) -> Result<()>;

    /// Write the patch turning `original` into `modified` to `patch`.
    fn create(&self, original: &Utf8Path, modified: &Utf8Path, patch: &Utf8Path) -> Result<()>;
}

/// [`DeltaPatcher`] driving the `xdelta3` executable.
pub struct XDeltaPatcher {
    runner: Arc<dyn ToolRunner>,
    program: String,
}

impl XDeltaPatcher {
    pub fn new(runner: Arc<dyn ToolRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    fn run(&self, mode: &str, source: &Utf8Path, input: &Utf8Path, output: &Utf8Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        let invocation = ToolInvocation::new(&self.program)
            .args([mode, "-f", "-s"])
            .args([source.as_str(), input.as_str(), output.as_str()]);
        self.runner.run(&invocation)?.ensure_success(&self.program)?;
        Ok(())
    }
}

impl DeltaPatcher for XDeltaPatcher {
    fn apply(&self, source: &Utf8Path, patch: &Utf8Path, target: &Utf8Path) -> Result<()> {
        self.run("-d", source, patch, target)
    }

    fn create(&self, original: &Utf8Path, modified: &Utf8Path, patch: &Utf8Path) -> Result<()> {
        self.run("-e", original, modified, patch)
    }
}

/// Produce one mod slot's binary from vanilla and a patch.
#[derive(Debug, Clone)]
pub struct PatchJob {
    pub chapter: String,
    pub slot: SourceId,
    pub source: Utf8PathBuf,
    pub patch: Utf8PathBuf,
    pub target: Utf8PathBuf,
}

/// Result of one [`PatchJob`].
#[derive(Debug)]
pub struct PatchOutcome {
    pub job: PatchJob,
    pub result: Result<()>,
}

/// Runs patch jobs in parallel, at most `workers` at a time.
pub struct PatchStage {
    patcher: Arc<dyn DeltaPatcher>,
    gate: Arc<Semaphore>,
}

impl PatchStage {
    pub fn new(patcher: Arc<dyn DeltaPatcher>, workers: usize) -> Self {
        Self {
            patcher,
            gate: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Apply every job. Outcomes are returned in job order; a failing job never stops
    /// the others.
    pub async fn apply_all(&self, jobs: Vec<PatchJob>) -> Vec<PatchOutcome> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let patcher = Arc::clone(&self.patcher);
                let gate = Arc::clone(&self.gate);
                let task_job = job.clone();
                let handle = tokio::spawn(async move {
                    let _permit = match gate.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return Err(Error::Other(format!("patch gate closed: {e}"))),
                    };
                    match tokio::task::spawn_blocking(move || {
                        patcher.apply(&task_job.source, &task_job.patch, &task_job.target)
                    })
                    .await
                    {
                        Ok(result) => result,
                        Err(e) => Err(Error::from(e)),
                    }
                });
                (job, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            match &result {
                Ok(()) => tracing::info!(
                    "Patched chapter={} slot={} -> {}",
                    job.chapter,
                    job.slot,
                    job.target
                ),
                Err(e) => tracing::error!(
                    "Failed to patch chapter={} slot={} with {}: {}",
                    job.chapter,
                    job.slot,
                    job.patch,
                    e
                ),
            }
            outcomes.push(PatchOutcome { job, result });
        }
        outcomes
    }
}
