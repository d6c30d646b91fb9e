use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Detail of a 500 response, kept out of the body and carried in the
/// response extensions for [`attach_internal_details`].
#[derive(Debug, Clone)]
struct InternalErrorDetail {
    code: &'static str,
    detail: String,
}

/// Router layer that copies the detail of 500 responses into the body when
/// the deployment opts in (`EXPOSE_ERROR_DETAILS`).
pub async fn attach_internal_details(
    State(expose): State<bool>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if !expose {
        return response;
    }
    let Some(InternalErrorDetail { code, detail }) =
        response.extensions().get::<InternalErrorDetail>().cloned()
    else {
        return response;
    };
    (
        response.status(),
        Json(json!({ "error": "Internal server error", "code": code, "details": detail })),
    )
        .into_response()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    NotFound {
        code: &'static str,
        message: String,
    },
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("{message}")]
    BadRequest {
        code: &'static str,
        message: String,
    },
    #[error("{message}")]
    Unauthorized {
        code: &'static str,
        message: String,
    },
    #[error("{message}")]
    Forbidden {
        code: &'static str,
        message: String,
    },
    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: String,
    },
    #[error("internal error ({code}): {detail}")]
    Internal { code: &'static str, detail: String },
}

impl ApiError {
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, detail: impl ToString) -> Self {
        Self::Internal {
            code,
            detail: detail.to_string(),
        }
    }

    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Validation(_) | ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound { code, .. }
            | ApiError::BadRequest { code, .. }
            | ApiError::Unauthorized { code, .. }
            | ApiError::Forbidden { code, .. }
            | ApiError::Conflict { code, .. }
            | ApiError::Internal { code, .. } => code,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => ApiError::conflict("CONFLICT", what),
            other => ApiError::internal("DATABASE_ERROR", other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let body = match self {
            ApiError::Validation(details) => json!({
                "error": "Validation failed",
                "code": code,
                "details": details,
            }),
            ApiError::Internal { detail, .. } => {
                tracing::error!(code, %detail, "request failed");
                let mut response =
                    (status, Json(json!({ "error": "Internal server error", "code": code })))
                        .into_response();
                response
                    .extensions_mut()
                    .insert(InternalErrorDetail { code, detail });
                return response;
            }
            ApiError::NotFound { message, .. }
            | ApiError::BadRequest { message, .. }
            | ApiError::Unauthorized { message, .. }
            | ApiError::Forbidden { message, .. }
            | ApiError::Conflict { message, .. } => json!({ "error": message, "code": code }),
        };
        (status, Json(body)).into_response()
    }
}
