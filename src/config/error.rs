use std::path::PathBuf;

/// Errors raised while loading, merging or validating run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config file {path} must contain a mapping at the top level")]
    NotAMapping { path: PathBuf },

    #[error("unknown keys in config file {path}: {keys}")]
    UnknownKeys { path: PathBuf, keys: String },

    #[error("invalid configuration value: {0}")]
    Merge(#[source] serde_yaml::Error),

    #[error("missing required argument `--{0}`")]
    Missing(&'static str),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
