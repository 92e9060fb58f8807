use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0}")]
    BadRequest(&'static str),

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("You have no permission to access this resource")]
    Forbidden,

    #[error("No resource found")]
    NoResource,

    #[error("{0}")]
    Conflict(&'static str),

    #[error("You have already applied as a rider")]
    AlreadyApplied,

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0}")]
    GatewayError(#[from] reqwest::Error),

    #[error("payment gateway returned an unusable response")]
    GatewayFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("No session token provided")]
    MissingSessionToken,

    #[error("Invalid or expired session token")]
    InvalidSessionToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    message: String,

    #[serde(rename = "alreadyApplied", skip_serializing_if = "Option::is_none")]
    already_applied: Option<bool>,
}

impl From<&Error> for ErrorJson {
    fn from(err: &Error) -> Self {
        let already_applied = match err {
            Error::AlreadyApplied => Some(true),
            _ => None,
        };

        Self {
            message: err.to_string(),
            already_applied,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!("error: {:?}", self);
        let status = match self {
            Self::ValidationError(..) | Self::BadRequest(..) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(..) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NoResource => StatusCode::NOT_FOUND,
            Self::Conflict(..) | Self::AlreadyApplied => StatusCode::CONFLICT,
            Self::DatabaseError(..)
            | Self::BSONSerError(..)
            | Self::JWTError(..)
            | Self::GatewayError(..)
            | Self::GatewayFailure => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error = ErrorJson::from(&self);

        (status, Json(error)).into_response()
    }
}

impl From<axum::extract::rejection::PathRejection> for Error {
    fn from(_value: axum::extract::rejection::PathRejection) -> Self {
        Self::NoResource
    }
}

impl From<axum::extract::rejection::JsonRejection> for Error {
    fn from(_value: axum::extract::rejection::JsonRejection) -> Self {
        Self::BadRequest("invalid request body")
    }
}
