use camino::Utf8PathBuf;
use miette::{IntoDiagnostic, Result};
use xdc_core::HashCache;

#[derive(Debug, Clone)]
pub struct HashFilesArgs {
    pub files: Vec<Utf8PathBuf>,
}

pub fn hash_files(args: HashFilesArgs) -> Result<()> {
    let hashes = HashCache::new();
    for file in &args.files {
        let digest = hashes.digest(file).into_diagnostic()?;
        println!("{}  {}", digest, file);
    }
    Ok(())
}
