use thiserror::Error;

/// Failures that can stop the binary before the trader loop ever starts.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read config file {path}: {source}")]
    ReadConfig { path: String, source: std::io::Error },

    #[error("failed to parse config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    #[error("missing required environment variable {0}")]
    MissingEnv(String),

    #[error("journal error: {0}")]
    Journal(#[from] arb_journal::JournalError),
}
