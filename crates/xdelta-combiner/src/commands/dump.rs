use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{load_config, load_hashes, save_hashes};
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use xdc_core::{DumpPipeline, DumpReport, DumpState, SystemToolRunner, WorkspaceLayout};

#[derive(Debug, Clone)]
pub struct DumpArgs {
    pub config_path: Utf8PathBuf,
}

pub async fn run_dump(args: DumpArgs) -> Result<DumpReport> {
    let config = load_config(&args.config_path)?;
    let layout = WorkspaceLayout::from_config(&config).into_diagnostic()?;
    let hashes = Arc::new(load_hashes(&layout));

    println!(
        "{} {} chapter(s) into {}",
        "Dumping".bright_cyan().bold(),
        config.chapters.len(),
        layout.output_dir().to_string().bright_yellow()
    );

    let pipeline = DumpPipeline::from_config(config, hashes.clone(), Arc::new(SystemToolRunner))
        .into_diagnostic()?
        .with_progress(|progress| {
            tracing::debug!(
                "[{}] {}: {}",
                progress.chapter,
                progress.slot,
                progress.state
            );
        });
    let report = pipeline.run().await.into_diagnostic()?;
    save_hashes(&layout, &hashes);

    print_dump_report(&report);

    if !report.is_success() {
        return Err(CliError::DumpFailed {
            failed: report.failures.len(),
        }
        .into());
    }

    Ok(report)
}

fn print_dump_report(report: &DumpReport) {
    if report.parallel {
        println_pad!("{}", "Chapters dumped in parallel".dimmed());
    }

    for outcome in &report.outcomes {
        let state = match outcome.state {
            DumpState::Mirrored => outcome.state.to_string().bright_green(),
            DumpState::Cached => outcome.state.to_string().bright_blue(),
            _ => outcome.state.to_string().normal(),
        };
        println_pad!(
            "{} {} {} ({} files)",
            outcome.chapter.bright_white(),
            outcome.slot.to_string().bright_white(),
            state,
            outcome.files
        );
    }

    for failure in &report.failures {
        println_pad!(
            "{} {} {}: {}",
            "failed".bright_red().bold(),
            failure.chapter,
            failure.slot,
            failure.message
        );
    }

    for warning in &report.warnings {
        println_pad!("{} {}", "warning:".bright_yellow(), warning);
    }

    if let Some(eviction) = &report.eviction {
        if !eviction.removed.is_empty() {
            println_pad!(
                "Evicted {} cache entr(ies), freed {} bytes",
                eviction.removed.len(),
                eviction.freed_bytes
            );
        }
    }
}
