use thiserror::Error;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime binary could not be spawned or exited non-zero.
    #[error("`{command}` via container runtime: {message}")]
    CommandFailed { command: String, message: String },

    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// `ps`/`inspect` output was not the JSON we expected.
    #[error("unreadable runtime output: {0}")]
    ParseError(String),

    /// Rejected before reaching the runtime.
    #[error("rejected container argument: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
