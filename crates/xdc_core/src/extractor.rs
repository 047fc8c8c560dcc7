//! The external asset extraction tool.
//!
//! Extraction turns one source binary into an asset tree. The work is done by an
//! external decompiler driven by export scripts; this module only builds its
//! invocations. The tool is single-instance, so callers must serialize calls (the
//! [`DumpPipeline`](crate::pipeline::DumpPipeline) holds a process-wide gate around
//! [`AssetExtractor::extract`]).

use crate::config::ExtractorConfig;
use crate::error::{Error, Result};
use crate::layout::SourceId;
use crate::tool::{ToolInvocation, ToolRunner};
use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level `Objects/` subdirectories produced by an extraction.
///
/// Stale copies of these are removed before a slot is extracted again.
pub const GENERATED_KINDS: &[&str] = &[
    "CodeEntries",
    "Sprites",
    "NewObjects",
    "Sounds",
    "Backgrounds",
    "Fonts",
    "Rooms",
    "Shaders",
];

/// Subtrees counted by the post-dump sanity check.
pub const SANITY_KINDS: &[&str] = &["CodeEntries", "Sprites", "NewObjects"];

/// One extraction of a source binary into a slot directory.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub chapter: String,
    pub slot: SourceId,
    /// The source binary (`<slot>/data.win`).
    pub data_file: Utf8PathBuf,
    pub slot_dir: Utf8PathBuf,
    /// Where the asset tree must end up (`<slot>/Objects`).
    pub objects_dir: Utf8PathBuf,
}

/// Capability to extract a source binary into an asset tree.
pub trait AssetExtractor: Send + Sync {
    fn extract(&self, request: &ExtractRequest) -> Result<()>;
}

/// [`AssetExtractor`] running the configured command line tool once per export script.
///
/// Each script is run as `<program> load <data_file> --scripts <script>` from inside the
/// slot directory, and writes its output below `Objects/`.
pub struct ToolExtractor {
    runner: Arc<dyn ToolRunner>,
    config: ExtractorConfig,
    timeout: Option<Duration>,
}

impl ToolExtractor {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        config: ExtractorConfig,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            runner,
            config,
            timeout,
        }
    }

    /// Scripts to run, falling back to the full export script when any configured
    /// script is missing on disk.
    pub fn resolve_scripts(&self) -> Result<Vec<Utf8PathBuf>> {
        let scripts: Vec<Utf8PathBuf> = self
            .config
            .scripts
            .iter()
            .map(|name| self.config.script_dir.join(name))
            .collect();

        let missing: Vec<&Utf8PathBuf> = scripts
            .iter()
            .filter(|path| !path.as_std_path().is_file())
            .collect();

        if !scripts.is_empty() && missing.is_empty() {
            return Ok(scripts);
        }

        match &self.config.full_export_script {
            Some(full) => {
                if !missing.is_empty() {
                    tracing::warn!(
                        "Export scripts missing ({}), using full export script {}",
                        missing
                            .iter()
                            .map(|p| p.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                        full
                    );
                }
                Ok(vec![self.config.script_dir.join(full)])
            }
            None if scripts.is_empty() => {
                Err(Error::Other("no export scripts configured".to_string()))
            }
            None => Err(Error::Other(format!(
                "export script not found: {}",
                missing[0]
            ))),
        }
    }

    fn invocation(&self, request: &ExtractRequest, script: &Utf8Path) -> ToolInvocation {
        let invocation = ToolInvocation::new(&self.config.program)
            .arg("load")
            .arg(request.data_file.as_str())
            .arg("--scripts")
            .arg(script.as_str())
            .current_dir(&request.slot_dir);
        match self.timeout {
            Some(timeout) => invocation.timeout(timeout),
            None => invocation,
        }
    }
}

impl AssetExtractor for ToolExtractor {
    fn extract(&self, request: &ExtractRequest) -> Result<()> {
        if !request.data_file.as_std_path().is_file() {
            return Err(Error::MissingSourceBinary(request.data_file.clone()));
        }
        std::fs::create_dir_all(request.objects_dir.as_std_path())?;

        for script in self.resolve_scripts()? {
            tracing::info!(
                "Extracting chapter={} slot={} with {}",
                request.chapter,
                request.slot,
                script
            );
            self.runner
                .run(&self.invocation(request, &script))?
                .ensure_success(&self.config.program)?;
        }
        Ok(())
    }
}
