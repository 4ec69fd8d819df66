pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("not authorized")]
    Authorization,

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("remote store error: {message}")]
    RemoteStore { message: String },

    #[error("transcode failed: {message}")]
    Transcode { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted by restart")]
    Interrupted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub fn remote_store(message: impl Into<String>) -> Self {
        Error::RemoteStore {
            message: message.into(),
        }
    }

    pub fn transcode(message: impl Into<String>) -> Self {
        Error::Transcode {
            message: message.into(),
        }
    }

    /// True for the transitions that stick without retrying the triggering
    /// operation: the caller cannot recover by calling again with the same
    /// arguments.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Validation { .. } | Error::Authorization | Error::NotFound { .. }
        )
    }
}
