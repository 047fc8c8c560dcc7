use crate::println_pad;
use crate::utils::load_config;
use camino::Utf8PathBuf;
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use xdc_core::{ExportCache, WorkspaceLayout};

#[derive(Debug, Clone)]
pub struct EvictCacheArgs {
    pub config_path: Utf8PathBuf,
}

pub fn evict_cache(args: EvictCacheArgs) -> Result<()> {
    let config = load_config(&args.config_path)?;
    let layout = WorkspaceLayout::from_config(&config).into_diagnostic()?;
    let cache = ExportCache::from_layout(&layout, &config.cache);

    if !cache.is_enabled() {
        println!("{}", "Export cache is disabled".dimmed());
        return Ok(());
    }
    let Some(cap_mb) = config.cache.max_size_mb else {
        println!(
            "{} uses {} bytes; no size cap configured",
            cache.root().to_string().bright_yellow(),
            cache.usage().into_diagnostic()?
        );
        return Ok(());
    };

    let report = cache.enforce_cap().into_diagnostic()?;
    println!(
        "{} {} entr(ies), freed {} bytes",
        "Evicted".bright_cyan().bold(),
        report.removed.len(),
        report.freed_bytes
    );
    for removed in &report.removed {
        println_pad!("{}", removed.to_string().dimmed());
    }
    println_pad!(
        "{} bytes remain (cap {} MB)",
        report.remaining_bytes,
        cap_mb
    );
    if report.over_cap {
        println_pad!(
            "{} some entries could not be removed; still above the cap",
            "warning:".bright_yellow()
        );
    }

    Ok(())
}
