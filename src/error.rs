use thiserror::Error;

/// Errors surfaced at the replay boundary (form submission, launch).
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed submission: {0}")]
    MalformedSubmission(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ReplayError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PermissionDenied(_) => 403,
            Self::MalformedSubmission(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

pub type ReplayResult<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ReplayError::PermissionDenied("x".into()).http_status(), 403);
        assert_eq!(ReplayError::MalformedSubmission("x".into()).http_status(), 400);
        let internal: ReplayError = anyhow::anyhow!("store down").into();
        assert_eq!(internal.http_status(), 500);
        assert_eq!(internal.to_string(), "internal: store down");
    }
}
