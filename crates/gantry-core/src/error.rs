//! Error types shared by all backends.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration is absent.
    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    /// The backend endpoint cannot be contacted.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// An explicit override named a backend that is not registered.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// No registered backend reported itself available.
    #[error("no backend available on this host")]
    NoBackendAvailable,

    #[error("failed to pull image '{image}': {reason}")]
    ImagePull { image: String, reason: String },

    /// Pull policy `never` and the image is not in the local store.
    #[error("image not present locally: {0}")]
    ImageMissing(String),

    #[error("failed to create {resource}: {reason}")]
    Create { resource: String, reason: String },

    #[error("failed to start {resource}: {reason}")]
    Start { resource: String, reason: String },

    /// The resource does not exist. Backends map their runtime's native
    /// not-found signal onto this variant; destroy paths swallow it.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to load task {0}")]
    LoadTask(String),

    #[error("wait failed: {0}")]
    WaitFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("workflow setup failed: {0}")]
    SetupFailed(String),

    /// Some cleanup sub-step failed. Non-fatal, but surfaced.
    #[error("cleanup incomplete: {0}")]
    DestroyPartial(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means the resource was already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the error was caused by context cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        assert!(Error::NotFound("t1-s1".into()).is_not_found());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found());
        assert!(!Error::Cancelled.is_not_found());
        assert!(
            !Error::Create {
                resource: "container t1-s1".into(),
                reason: "boom".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn display_carries_context() {
        let err = Error::ImagePull {
            image: "does.not.exist/x:y".into(),
            reason: "no such host".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to pull image 'does.not.exist/x:y': no such host"
        );
        assert_eq!(
            Error::UnknownBackend("podman".into()).to_string(),
            "unknown backend: podman"
        );
    }
}
