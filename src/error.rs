use thiserror::Error;

/// Errors surfaced by the recording pipeline.
///
/// Only configuration problems and sink open failures reach the caller of a
/// stage; everything else is contained in the stage and logged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{component} cannot do that while {state}")]
    InvalidState {
        component: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("short write: wrote {written} of {requested} bytes")]
    ShortWrite { requested: usize, written: usize },

    #[error("codec failure: {0}")]
    Codec(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("{0} worker is no longer running")]
    WorkerGone(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
