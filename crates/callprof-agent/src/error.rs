use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Rejected agent argument string. The message is shown to the user as is.
    #[error("{0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Profiler is already running")]
    AlreadyRunning,

    #[error("Event '{event}' is not supported by the {backend} backend")]
    Unsupported {
        event: &'static str,
        backend: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
