use super::{combine_chapters, run_dump, CombineArgs, DumpArgs};
use miette::Result;

/// Dump every chapter, then combine them. Nothing is combined if any slot failed.
pub async fn run_all(args: DumpArgs) -> Result<()> {
    run_dump(args.clone()).await?;
    combine_chapters(CombineArgs {
        config_path: args.config_path,
        chapter: None,
    })
}
