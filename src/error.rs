use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// No credential configured; raised before any network call.
    #[error("Missing API key")]
    MissingApiKey,
    #[error("upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// HTTP status for errors that came from the provider.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::Upstream { status, .. } => Some(*status),
            AppError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        AppError::Other(value)
    }
}

impl From<&str> for AppError {
    fn from(value: &str) -> Self {
        AppError::Other(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_and_status() {
        let err = AppError::Upstream {
            status: 429,
            body: "slow down".into(),
        };
        assert_eq!(err.to_string(), "upstream returned HTTP 429: slow down");
        assert_eq!(err.status(), Some(429));
        assert_eq!(AppError::MissingApiKey.to_string(), "Missing API key");
        assert_eq!(AppError::from("boom").status(), None);
    }
}
