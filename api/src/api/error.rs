use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ringkeeper_core::Error as RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Invalid input: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => match e {
                RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
                RegistryError::Conflict(_) => StatusCode::CONFLICT,
                RegistryError::AllocationExhausted { .. } | RegistryError::Unavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RegistryError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!("Registry unavailable: {}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "Request rejected: {}", self);
        }

        (status, format!("{self}\n")).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ringkeeper_core::{Conflict, Token};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RegistryError::not_found("cass", 1), StatusCode::NOT_FOUND),
            (
                Conflict::Token {
                    token: Token::new(5),
                    holder: Some(2),
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (
                RegistryError::AllocationExhausted { attempts: 10 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (RegistryError::unavailable("timeout"), StatusCode::SERVICE_UNAVAILABLE),
            (RegistryError::invalid("empty rack"), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(ApiError::bad_request("id").status(), StatusCode::BAD_REQUEST);
    }
}
