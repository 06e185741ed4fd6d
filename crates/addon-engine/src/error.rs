//! Error types for the deployment engine.
//!
//! Failures are split by concern. Per-object problems ([`DocumentError`],
//! [`ClusterError`]) are collected into outcomes and never abort a batch on
//! their own; only [`EngineError`] is surfaced at call level, and the
//! variants that interrupt a batch carry the partial outcome with them.

use std::time::Duration;

use thiserror::Error;

use crate::deployer::DeploymentOutcome;
use crate::resource::ResourceIdentity;

/// Errors returned by a [`ClusterClient`](crate::cluster::ClusterClient).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The object (or the namespace holding it) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, optimistic-lock conflict, throttling or server busy.
    #[error("transient API error: {0}")]
    Transient(String),

    /// Authorization or admission rejection.
    #[error("API rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The call did not complete within the configured bound.
    #[error("API call timed out after {0:?}")]
    Timeout(Duration),

    /// The API server does not serve this kind.
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// The object could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The client itself could not be configured.
    #[error("client configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Whether the outer reconciliation loop should retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound(response.message),
                409 | 429 | 500 | 502 | 503 | 504 => Self::Transient(response.message),
                code => Self::Rejected {
                    code,
                    message: response.message,
                },
            },
            kube::Error::SerdeError(e) => Self::Serialization(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure attached to a single manifest document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    /// The document is not a parseable resource.
    #[error("document {index}: parse error: {message}")]
    Parse { index: usize, message: String },

    /// The cluster refused or failed a call for this resource.
    #[error("document {index}: {identity}: {source}")]
    Api {
        index: usize,
        identity: ResourceIdentity,
        #[source]
        source: ClusterError,
    },
}

impl DocumentError {
    /// Position of the failing document in the bundle.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Parse { index, .. } | Self::Api { index, .. } => *index,
        }
    }

    /// Identity of the resource, when the document got far enough to have one.
    #[must_use]
    pub fn identity(&self) -> Option<&ResourceIdentity> {
        match self {
            Self::Parse { .. } => None,
            Self::Api { identity, .. } => Some(identity),
        }
    }

    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// Errors from the template/script collaborators and reference lookups.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("template {name} failed to render: {message}")]
    Template { name: String, message: String },

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("no template renderer configured for template source {0}")]
    NoRenderer(String),

    #[error("no script evaluator configured")]
    NoEvaluator,

    #[error("invalid content source: {0}")]
    InvalidSource(String),

    #[error("failed to fetch referenced resource {identifier}: {source}")]
    Reference {
        identifier: String,
        #[source]
        source: ClusterError,
    },
}

/// Errors from the Helm package manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HelmError {
    #[error("failed to run helm: {0}")]
    Spawn(String),

    #[error("helm {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("helm {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("unexpected helm output: {0}")]
    Output(String),
}

impl HelmError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(..) | Self::Spawn(_))
    }
}

/// Call-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Every document of the bundle failed; the outcome lists each failure.
    #[error("all {} documents failed", outcome.failures.len())]
    AggregateFailure { outcome: Box<DeploymentOutcome> },

    /// The caller cancelled the batch; work completed so far is in the outcome.
    #[error("reconciliation cancelled after {} documents", outcome.processed)]
    Cancelled { outcome: Box<DeploymentOutcome> },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Helm(#[from] HelmError),
}

impl EngineError {
    /// The partial outcome carried by batch-level failures.
    #[must_use]
    pub fn partial_outcome(&self) -> Option<&DeploymentOutcome> {
        match self {
            Self::AggregateFailure { outcome } | Self::Cancelled { outcome } => Some(outcome),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Helm(e) => e.is_retryable(),
            Self::AggregateFailure { outcome } => outcome.failures.iter().any(|f| {
                matches!(f, DocumentError::Api { source, .. } if source.is_retryable())
            }),
            Self::Render(_) => false,
        }
    }
}
