//! Error types for ovm.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by machine orchestration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A machine with this name is already live on the hypervisor.
    #[error("machine '{0}' already exists")]
    AlreadyExists(String),

    /// No persisted config for this machine name.
    #[error("machine '{0}' does not exist")]
    NoSuchVm(String),

    /// Operation not allowed in the machine's current state.
    #[error("invalid state: expected {expected}, got {actual}")]
    WrongState {
        /// State the operation requires.
        expected: String,
        /// State the machine is in.
        actual: String,
    },

    /// Requested resources exceed host capacity or a provider ceiling.
    #[error("requested {resource} ({requested}) exceeds the limit of {limit}")]
    ResourceExceeded {
        /// Resource name, e.g. "memory (MiB)".
        resource: &'static str,
        /// Requested amount.
        requested: u64,
        /// Allowed maximum.
        limit: u64,
    },

    /// Machine name does not satisfy naming rules.
    #[error("invalid machine name '{name}': {reason}")]
    InvalidName {
        /// Offending name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Persisted config has an unsupported schema version.
    #[error("incompatible machine config {}: {reason}", path.display())]
    Incompatible {
        /// Config file path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// A supervising or companion process exited.
    #[error("{role} process (pid {pid}) exited")]
    ProcessDied {
        /// Which process, e.g. "network proxy".
        role: String,
        /// Its pid.
        pid: u32,
    },

    /// The supervising parent process is gone.
    #[error("parent process {0} is not alive")]
    ParentDead(u32),

    /// A bounded wait elapsed.
    #[error("timed out {0}")]
    Timeout(String),

    /// Path could not be resolved.
    #[error("failed to resolve path '{}': {source}", path.display())]
    Path {
        /// The path being resolved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Guard against recursive deletion of an empty or root path.
    #[error("refusing to recursively delete '{}'", .0.display())]
    RefusingDelete(PathBuf),

    /// Interrupted by a termination signal.
    #[error("interrupted by signal")]
    Interrupted,

    /// Configuration error.
    #[error("{operation} failed: {reason}")]
    Config {
        /// What was being done.
        operation: String,
        /// Why it failed.
        reason: String,
    },

    /// Disk image or filesystem error.
    #[error("{operation} failed: {reason}")]
    Storage {
        /// What was being done.
        operation: String,
        /// Why it failed.
        reason: String,
    },

    /// Hypervisor backend error.
    #[error("{operation} failed: {reason}")]
    Provider {
        /// What was being done.
        operation: String,
        /// Why it failed.
        reason: String,
    },

    /// Network proxy, port or socket error.
    #[error("{operation} failed: {reason}")]
    Network {
        /// What was being done.
        operation: String,
        /// Why it failed.
        reason: String,
    },

    /// Remote command execution error.
    #[error("ssh {operation} failed: {reason}")]
    Ssh {
        /// What was being done.
        operation: String,
        /// Why it failed.
        reason: String,
    },

    /// Invalid volume mount specification.
    #[error("invalid mount: {0}")]
    Mount(String),

    /// No hypervisor backend is usable on this host.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// Several independent failures, e.g. from a reset.
    #[error("{}", join_errors(.0))]
    Multi(Vec<Error>),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a configuration error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a networking error.
    pub fn network(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a remote command error.
    pub fn ssh(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Ssh {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a wrong-state error.
    pub fn wrong_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        Self::WrongState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// True if this error means "the thing is absent".
    ///
    /// Callers that tolerate missing files use this to turn absence into success.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Path { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Collapse a list of errors: none → Ok, one → that error, many → `Multi`.
    pub fn from_many(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multi(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());

        let err = Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!err.is_not_found());

        assert!(!Error::NoSuchVm("x".into()).is_not_found());
    }

    #[test]
    fn test_from_many() {
        assert!(Error::from_many(vec![]).is_ok());

        let single = Error::from_many(vec![Error::Interrupted]).unwrap_err();
        assert!(matches!(single, Error::Interrupted));

        let multi = Error::from_many(vec![
            Error::RefusingDelete(PathBuf::from("/")),
            Error::storage("remove data dir", "busy"),
        ])
        .unwrap_err();
        let msg = multi.to_string();
        assert!(msg.contains("refusing to recursively delete '/'"));
        assert!(msg.contains("remove data dir failed: busy"));
    }
}
