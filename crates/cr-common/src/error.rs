use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("mode {0:o} is outside the valid POSIX permission range (0..=0o7777)")]
    InvalidMode(u32),

    #[error("failed to inspect {path}: {source}")]
    Inspect {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to chmod {path}: {source}")]
    Chmod {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to chown {path}: {source}")]
    Chown {
        path: String,
        source: std::io::Error,
    },
}
