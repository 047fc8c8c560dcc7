use crate::errors::CliError;
use crate::println_pad;
use crate::utils::{load_config, load_hashes, save_hashes};
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use xdc_core::{ChapterConfig, CombineReport, ModCombiner, SystemToolRunner};

#[derive(Debug, Clone)]
pub struct CombineArgs {
    pub config_path: Utf8PathBuf,
    pub chapter: Option<String>,
}

pub fn combine_chapters(args: CombineArgs) -> Result<()> {
    let config = load_config(&args.config_path)?;
    let chapters = select_chapters(&config.chapters, args.chapter)?;

    let layout = xdc_core::WorkspaceLayout::from_config(&config).into_diagnostic()?;
    let hashes = Arc::new(load_hashes(&layout));
    let combiner = ModCombiner::from_config(&config, hashes.clone(), Arc::new(SystemToolRunner))
        .into_diagnostic()?;

    for chapter in chapters {
        println!(
            "{} {} ({} mod(s))",
            "Combining".bright_cyan().bold(),
            chapter.name.bright_white(),
            chapter.mods.len()
        );
        let report = combiner
            .combine_chapter(&chapter.name, chapter.mods.len())
            .into_diagnostic()?;
        print_combine_report(&report);
    }

    save_hashes(&layout, &hashes);
    Ok(())
}

fn select_chapters(
    chapters: &[ChapterConfig],
    wanted: Option<String>,
) -> Result<Vec<&ChapterConfig>> {
    let Some(name) = wanted else {
        return Ok(chapters.iter().collect());
    };

    match chapters.iter().find(|c| c.name == name) {
        Some(chapter) => Ok(vec![chapter]),
        None => {
            let known: Vec<String> = chapters.iter().map(|c| c.name.clone()).collect();
            Err(CliError::unknown_chapter(name, &known).into())
        }
    }
}

fn print_combine_report(report: &CombineReport) {
    if report.stamp.is_unchanged() {
        println_pad!("{}", "No differences from vanilla".dimmed());
        return;
    }

    println_pad!(
        "{} changed asset(s), code: {}, sprites: {}, asset order: {}",
        report.stamp.changed_count.to_string().bright_green(),
        yes_no(report.stamp.code_changed),
        yes_no(report.stamp.sprite_changed),
        yes_no(report.stamp.asset_order_changed)
    );

    for fallback in &report.fallbacks {
        let dropped: Vec<String> = fallback.dropped.iter().map(|s| s.to_string()).collect();
        println_pad!(
            "{} {} kept {}, dropped {}",
            "conflict:".bright_yellow(),
            fallback.asset,
            fallback.winner,
            dropped.join(", ")
        );
    }

    for failure in &report.failures {
        println_pad!(
            "{} {}: {}",
            "failed:".bright_red(),
            failure.asset,
            failure.message
        );
    }

    if !report.asset_order_duplicates.is_empty() {
        println_pad!(
            "{} duplicate asset order entries: {}",
            "warning:".bright_yellow(),
            report.asset_order_duplicates.join(", ")
        );
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
