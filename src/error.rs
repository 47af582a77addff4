use std::path::PathBuf;

/// Errors that must abort startup before any service script runs.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("reading confdir {path:?}: {source}")]
    ReadConfDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reading script {path:?}: {source}")]
    ReadScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dependency cycle detected, involving at least {0:?}")]
    CycleDetected(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
