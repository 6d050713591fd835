use thiserror::Error;

/// Error kinds surfaced by the api layer. Each kind maps onto exactly one
/// HTTP status; transports must branch on the kind, not the message text.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthenticated(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Internal(_) => 500,
        }
    }

    /// Classify a store error: a lock wait that exhausted the busy timeout
    /// is retryable for the client, everything else is internal.
    pub fn from_store(err: anyhow::Error) -> Self {
        if let Some(sqlite) = err.downcast_ref::<rusqlite::Error>() {
            if matches!(
                sqlite.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy)
                    | Some(rusqlite::ErrorCode::DatabaseLocked)
            ) {
                return ApiError::Conflict("database busy, retry later".to_string());
            }
        }
        ApiError::Internal(err)
    }
}
