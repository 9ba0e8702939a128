use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriveError>;

/// The gateway error taxonomy. The HTTP facade maps these to status
/// codes through [`DriveError::status`]; the core itself never builds
/// responses.
#[derive(Error, Debug)]
pub enum DriveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("operation not supported")]
    Unsupported,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("remote api error ({status}): {message}")]
    RemoteApi { status: u16, message: String },

    #[error("operation canceled")]
    Canceled,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriveError {
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteApi {
            status,
            message: message.into(),
        }
    }

    /// Status code the facade should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::NotAllowed(_) => 403,
            Self::Unauthorized => 401,
            Self::Unsupported => 405,
            Self::BadRequest(_) => 400,
            Self::RemoteApi { status, .. } => *status,
            Self::Canceled => 499,
            Self::Timeout => 504,
            Self::Io(_) => 500,
        }
    }

    /// Check a task context, mapping cancellation and expired deadlines
    /// onto the taxonomy.
    pub fn check_ctx(ctx: &libtask::TaskContext) -> Result<()> {
        if ctx.deadline_exceeded() {
            return Err(Self::Timeout);
        }
        if ctx.canceled() {
            return Err(Self::Canceled);
        }
        Ok(())
    }
}

impl From<DriveError> for std::io::Error {
    fn from(e: DriveError) -> Self {
        match e {
            DriveError::Io(io) => io,
            DriveError::NotFound(p) => std::io::Error::new(std::io::ErrorKind::NotFound, p),
            DriveError::Canceled => {
                std::io::Error::new(std::io::ErrorKind::Interrupted, "canceled")
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(DriveError::NotFound("x".into()).status(), 404);
        assert_eq!(DriveError::NotAllowed("x".into()).status(), 403);
        assert_eq!(DriveError::Unauthorized.status(), 401);
        assert_eq!(DriveError::Unsupported.status(), 405);
        assert_eq!(DriveError::BadRequest("x".into()).status(), 400);
        assert_eq!(DriveError::remote(502, "bad gateway").status(), 502);
    }
}
