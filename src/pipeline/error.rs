use crate::cluster::ClusterError;
use crate::error::ApiError;
use crate::scm::ScmError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid pipeline: {0}")]
    Validation(String),

    #[error("pipeline spec unavailable: {0}")]
    SpecUnavailable(String),

    #[error("invalid pipeline spec: {0}")]
    SpecInvalid(String),

    #[error("illegal stage transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("manifest rendering failed: {0}")]
    RenderFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scm(#[from] ScmError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Object(#[from] opendal::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(what) => Self::NotFound(what),
            PipelineError::AlreadyExists(what) => Self::AlreadyExists(what),
            PipelineError::Validation(msg) => Self::BadRequest(msg),
            PipelineError::SpecUnavailable(msg) => Self::SpecUnavailable(msg),
            PipelineError::SpecInvalid(msg) => Self::SpecInvalid(msg),
            PipelineError::IllegalTransition { .. } => Self::IllegalTransition(err.to_string()),
            PipelineError::RenderFailed(msg) => Self::BadRequest(msg),
            PipelineError::Store(e) => e.into(),
            PipelineError::Scm(e) => e.into(),
            PipelineError::Cluster(e) => e.into(),
            PipelineError::Object(e) => Self::Storage(e.to_string()),
            PipelineError::Other(e) => Self::Internal(e),
        }
    }
}
