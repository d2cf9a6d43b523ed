use std::fmt;
use thiserror::Error;

pub type MedusaResult<T> = Result<T, MedusaError>;

#[derive(Debug, Error)]
pub enum MedusaError {
    /// Missing or invalid key material, unusable settings, unavailable backend
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Authentication tag, key commitment, or digest verification failed
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Storage driver failure (already retried by the driver, if at all)
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Malformed or misordered backup manifests
    #[error("aggregation error: {0}")]
    Aggregation(String),

    /// One or more files of a transfer batch failed
    #[error("{0}")]
    Batch(BatchFailure),

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MedusaError {
    pub fn transfer(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        MedusaError::Transfer(format!("{context}: {err}"))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, MedusaError::Integrity(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, MedusaError::Configuration(_))
    }

    /// Wrap this error so it can travel through an `AsyncRead`.
    ///
    /// The original variant is recovered by `MedusaError::from(io::Error)`.
    pub fn into_io(self) -> std::io::Error {
        match self {
            MedusaError::Io(inner) => inner,
            other => {
                let kind = if other.is_integrity() {
                    std::io::ErrorKind::InvalidData
                } else {
                    std::io::ErrorKind::Other
                };
                std::io::Error::new(kind, other)
            }
        }
    }
}

impl From<std::io::Error> for MedusaError {
    fn from(err: std::io::Error) -> Self {
        let wraps_medusa = err
            .get_ref()
            .is_some_and(|inner| inner.is::<MedusaError>());
        if !wraps_medusa {
            return MedusaError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<MedusaError>()) {
            Some(Ok(medusa)) => *medusa,
            Some(Err(other)) => MedusaError::Io(std::io::Error::other(other)),
            None => MedusaError::Transfer("I/O error without payload".into()),
        }
    }
}

/// A single item that failed inside a transfer batch
#[derive(Debug, Clone)]
pub struct TransferFailure {
    pub item: String,
    pub error: String,
}

/// Partial-completion report of a failed batch
#[derive(Debug, Clone, Default)]
pub struct BatchFailure {
    pub operation: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<TransferFailure>,
    pub not_started: Vec<String>,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for {} file(s) ({} succeeded, {} not started)",
            self.operation,
            self.failed.len(),
            self.succeeded.len(),
            self.not_started.len()
        )?;
        if let Some(first) = self.failed.first() {
            write!(f, ": {}: {}", first.item, first.error)?;
        }
        Ok(())
    }
}
