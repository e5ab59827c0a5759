//! Error types for the Vault operator
//!
//! Every reconciliation stage wraps its failure with a stage label before it
//! reaches the requeue policy, so a log line always says where a pass stopped.

use thiserror::Error;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Certificate error: {0}")]
    CertificateError(#[from] rcgen::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    /// An object this operator expects to exist is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// A workload member is terminating, not running, or unreachable
    #[error("Unhealthy member: {0}")]
    UnhealthyMember(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Innermost error, with every stage label peeled off
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a quick retry may succeed without any external change
    pub fn is_retriable(&self) -> bool {
        match self.root() {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code == 429 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::HttpError(_) => true,
            Error::UnhealthyMember(_) => true,
            Error::CertificateError(_) => true,
            Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::MissingField(_)
            | Error::NotFound(_)
            | Error::SerializationError(_) => false,
            Error::Stage { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// Short label used for the error metric and structured logs
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::CertificateError(_) => "certificate",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::MissingField(_) => "missing_field",
            Error::NotFound(_) => "not_found",
            Error::UnhealthyMember(_) => "unhealthy_member",
            Error::Stage { .. } => "unknown",
        }
    }

    /// Stage label of the outermost wrapper, if any
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Attach a reconciliation stage label to a failing result
pub trait StageContext<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E> StageContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| Error::Stage {
            stage,
            source: Box::new(e.into()),
        })
    }
}
