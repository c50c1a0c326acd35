use thiserror::Error;

use crate::token::Token;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No instance with id {id} found in {application}")]
    NotFound { application: String, id: u32 },

    #[error("Conflict: {0}")]
    Conflict(#[from] Conflict),

    #[error("Token allocation exhausted after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    #[error("Registry store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Why a write lost against the current stored state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The stored version for the key no longer matches what the writer read.
    #[error("instance {id} was modified concurrently")]
    Version { id: u32 },

    /// Another live record in the same datacenter already holds the token.
    #[error("token {token} is already held by instance {holder:?}")]
    Token { token: Token, holder: Option<u32> },

    /// The id belongs to a different host and the caller did not ask to replace it.
    #[error("instance {id} is already registered to {instance_identifier}")]
    DuplicateId { id: u32, instance_identifier: String },
}

impl Error {
    pub fn not_found(application: impl Into<String>, id: u32) -> Self {
        Self::NotFound {
            application: application.into(),
            id,
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Returns true for failures worth retrying the whole call for.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Unavailable(format!("postgres: {e}"))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(format!("redis: {e}"))
    }
}
