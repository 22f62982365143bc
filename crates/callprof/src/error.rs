use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Agent(#[from] callprof_agent::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Missing debug info in {path}. Recompile with `debug = true` in Cargo.toml")]
    MissingDebugInfo { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Symbol resolution error: {0}")]
    SymbolResolution(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const UNSUPPORTED: i32 = 3;
    pub const PERMISSION_DENIED: i32 = 4;
    pub const MISSING_DEBUG_INFO: i32 = 5;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Agent(e) => agent_exit_code(e),
            Error::PermissionDenied(_) => exit_code::PERMISSION_DENIED,
            Error::MissingDebugInfo { .. } => exit_code::MISSING_DEBUG_INFO,
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            Error::UnsupportedPlatform(_) => exit_code::UNSUPPORTED,
            Error::Io(e) if is_permission_error(e) => exit_code::PERMISSION_DENIED,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}

/// Exit code for an engine error that reached `main` without being wrapped.
pub fn agent_exit_code(err: &callprof_agent::Error) -> i32 {
    use callprof_agent::Error as AgentError;

    match err {
        AgentError::Config(_) | AgentError::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
        AgentError::Unsupported { .. } => exit_code::UNSUPPORTED,
        AgentError::Io(e) if is_permission_error(e) => exit_code::PERMISSION_DENIED,
        _ => exit_code::GENERAL_ERROR,
    }
}

fn is_permission_error(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM))
        || err.kind() == std::io::ErrorKind::PermissionDenied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config: Error = callprof_agent::Error::Config("interval must be > 0".into()).into();
        assert_eq!(config.exit_code(), exit_code::INVALID_ARGUMENTS);
        assert_eq!(config.to_string(), "interval must be > 0");

        let unsupported: Error = callprof_agent::Error::Unsupported {
            event: "cycles",
            backend: "unsupported",
        }
        .into();
        assert_eq!(unsupported.exit_code(), exit_code::UNSUPPORTED);

        let denied = Error::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(denied.exit_code(), exit_code::PERMISSION_DENIED);

        let missing = Error::MissingDebugInfo {
            path: "/bin/true".into(),
        };
        assert_eq!(missing.exit_code(), exit_code::MISSING_DEBUG_INFO);
        assert_eq!(
            callprof_agent::Error::AlreadyRunning.to_string(),
            "Profiler is already running"
        );
        assert_eq!(
            agent_exit_code(&callprof_agent::Error::AlreadyRunning),
            exit_code::GENERAL_ERROR
        );
    }
}
