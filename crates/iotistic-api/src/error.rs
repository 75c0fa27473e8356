use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// Consistent error body: `{error, message, details?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            message: msg.into(),
            details: None,
        }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            error: "invalid_state",
            message: msg.into(),
            details: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            message: msg.into(),
            details: None,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::CONFLICT,
            error: "conflict",
            message: msg.into(),
            details: None,
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: "unavailable",
            message: msg.into(),
            details: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal",
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error, "message": self.message });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<iotistic_store::StoreError> for ApiError {
    fn from(e: iotistic_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<iotistic_domain::DomainError> for ApiError {
    fn from(e: iotistic_domain::DomainError) -> Self {
        ApiError::unprocessable("target state failed validation")
            .with_details(json!({ "violation": e.to_string() }))
    }
}

impl From<iotistic_runtime::RuntimeError> for ApiError {
    fn from(e: iotistic_runtime::RuntimeError) -> Self {
        use iotistic_runtime::RuntimeError as R;
        match &e {
            R::ContainerNotFound(_) | R::NetworkNotFound(_) | R::ImageNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            R::Unavailable(_) | R::Timeout(_) => ApiError::unavailable(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<iotistic_cloud::CloudError> for ApiError {
    fn from(e: iotistic_cloud::CloudError) -> Self {
        use iotistic_cloud::CloudError as C;
        match &e {
            C::AlreadyRegistered => ApiError::conflict(e.to_string()),
            C::Unauthorized => ApiError {
                status: StatusCode::UNAUTHORIZED,
                error: "unauthorized",
                message: e.to_string(),
                details: None,
            },
            C::Http(_) | C::RateLimited => ApiError::unavailable(e.to_string()),
            _ => ApiError::internal(e.to_string()),
        }
    }
}
