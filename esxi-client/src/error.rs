use thiserror::Error;

/// Failure modes surfaced by the hypervisor client. Callers in `backend`
/// map these onto the system's error kinds (see `backend::error::AppError`).
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("authentication failed for {host}: {reason}")]
    Auth { host: String, reason: String },

    #[error("{operation} against {host} exceeded its deadline of {deadline_secs}s")]
    Timeout {
        host: String,
        operation: String,
        deadline_secs: u64,
    },

    #[error("hypervisor fault from {host}: {message}")]
    Remote { host: String, message: String },

    #[error("transport error talking to {host}: {source}")]
    Transport {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed response from {host}: {message}")]
    Protocol { host: String, message: String },

    #[error("virtual machine not found: {descriptor}")]
    VmNotFound { descriptor: String },
}

pub type Result<T> = std::result::Result<T, HypervisorError>;
