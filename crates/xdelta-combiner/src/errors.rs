use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Configuration file not found: {path}")]
    #[diagnostic(
        code(config::not_found),
        help("Pass the path of your combiner TOML file with --config")
    )]
    ConfigNotFound { path: Utf8PathBuf },

    #[error("Invalid configuration file: {path}")]
    #[diagnostic(
        code(config::parse_error),
        help("Check the file for TOML syntax errors and unknown fields")
    )]
    ConfigParseError {
        path: Utf8PathBuf,
        #[source]
        source: xdc_core::Error,
    },

    #[error("No chapters configured")]
    #[diagnostic(
        code(config::no_chapters),
        help("Add at least one [[chapters]] table with a name and a vanilla binary")
    )]
    NoChapters,

    #[error("Unknown chapter: {name}")]
    #[diagnostic(code(config::unknown_chapter), help("Configured chapters: {known}"))]
    UnknownChapter { name: String, known: String },

    #[error("{failed} slot(s) failed to dump")]
    #[diagnostic(
        code(dump::failed),
        help("See the log output above for the failing chapter and slot")
    )]
    DumpFailed { failed: usize },
}

impl CliError {
    pub fn config_not_found(path: Utf8PathBuf) -> Self {
        Self::ConfigNotFound { path }
    }

    pub fn config_parse_error(path: Utf8PathBuf, source: xdc_core::Error) -> Self {
        Self::ConfigParseError { path, source }
    }

    pub fn unknown_chapter(name: String, known: &[String]) -> Self {
        Self::UnknownChapter {
            name,
            known: known.join(", "),
        }
    }
}
