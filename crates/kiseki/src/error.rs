use std::sync::Arc;

use thiserror::Error;

use crate::mp4::Mp4Error;

#[derive(Error, Debug)]
pub enum KisekiError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("No uri available for segment")]
    NoUriAvailable,

    #[error("Fetch aborted")]
    Aborted,

    #[error(transparent)]
    Shared(Arc<KisekiError>),

    #[error("Invalid mp4 data: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("Failed to build http client: {0}")]
    HttpClientBuild(reqwest::Error),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

impl KisekiError {
    /// Whether the error comes from an intentional cancellation rather than a failure.
    pub fn is_aborted(&self) -> bool {
        match self {
            Self::Aborted => true,
            Self::Shared(inner) => inner.is_aborted(),
            _ => false,
        }
    }
}

pub type KisekiResult<T> = Result<T, KisekiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_aborted() {
        assert!(KisekiError::Aborted.is_aborted());
        assert!(KisekiError::Shared(Arc::new(KisekiError::Aborted)).is_aborted());
        assert!(!KisekiError::NoUriAvailable.is_aborted());
        assert!(!KisekiError::HttpError(reqwest::StatusCode::NOT_FOUND).is_aborted());
    }
}
