use http::StatusCode;
use octocrab::GitHubError;

/// Error from a mutating GitHub call whose "already exists" response is an expected outcome.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The object being created already exists, or the update is a no-op.
    /// GitHub signals this with 409 Conflict or 422 Unprocessable Entity.
    #[error("GitHub returned {status}: {message}")]
    Conflict { status: StatusCode, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict { .. }) }

    /// Classifies an octocrab error by the HTTP status GitHub responded with.
    pub fn from_octocrab(err: octocrab::Error, context: &'static str) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } if is_conflict_status(source.status_code) => {
                let GitHubError { status_code, message, .. } = *source;
                Self::Conflict { status: status_code, message }
            }
            err => Self::Other(anyhow::Error::new(err).context(context)),
        }
    }
}

fn is_conflict_status(status: StatusCode) -> bool {
    matches!(status, StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY)
}
