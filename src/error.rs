use thiserror::Error;


#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("token missing or invalid")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn bad_request<S: Into<String>>(message: S) -> AppError {
        AppError::BadRequest(message.into())
    }

    pub fn conflict<S: Into<String>>(message: S) -> AppError {
        AppError::Conflict(message.into())
    }

    pub fn status(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 403,
            AppError::Forbidden(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::Internal(_) | AppError::Io(_) | AppError::Json(_) => 500,
        }
    }
}

pub(crate) type AppResult<T> = Result<T, AppError>;
