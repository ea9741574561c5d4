use std::fmt;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_derive::Serialize;

use crate::credentials::CredentialError;
use crate::exchange::ExchangeError;
use crate::geotab::FleetError;
use crate::properties::PropertyError;
use crate::sync::SyncError;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests. Please try again later.")
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        AppError::bad_request(format!("Invalid request body: {}", value.body_text()))
    }
}

impl From<CredentialError> for AppError {
    fn from(value: CredentialError) -> Self {
        match value {
            CredentialError::Secret(_) => AppError::internal(value.to_string()),
            ref e if e.is_unauthorized() => AppError::unauthorized(value.to_string()),
            _ => AppError::bad_request(value.to_string()),
        }
    }
}

impl From<FleetError> for AppError {
    fn from(value: FleetError) -> Self {
        match value {
            FleetError::Authentication(_) => AppError::unauthorized(value.to_string()),
            _ => AppError::bad_gateway(value.to_string()),
        }
    }
}

impl From<ExchangeError> for AppError {
    fn from(value: ExchangeError) -> Self {
        AppError::bad_gateway(value.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Credentials(e) => e.into(),
            SyncError::Fleet(e) => e.into(),
            SyncError::Exchange(e) => e.into(),
            SyncError::ExchangeNotConnected => AppError::unauthorized(value.to_string()),
        }
    }
}

impl From<PropertyError> for AppError {
    fn from(value: PropertyError) -> Self {
        match value {
            PropertyError::DeviceNotFound(_) => AppError::not_found(value.to_string()),
            PropertyError::PropertySetMissing(_) => AppError::bad_gateway(value.to_string()),
            PropertyError::Fleet(e) => e.into(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::SecretError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::from(CredentialError::InvalidApiKey).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::from(CredentialError::MissingEquipmentDomain).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::from(CredentialError::Missing).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::from(CredentialError::Secret(SecretError::InvalidName("x".to_string()))).status(),
                   StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AppError::from(SyncError::Fleet(FleetError::Authentication("bad".to_string()))).status(),
                   StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::from(SyncError::Exchange(ExchangeError::Unauthorized("x".to_string()))).status(),
                   StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::from(SyncError::ExchangeNotConnected).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::from(PropertyError::DeviceNotFound("b1".to_string())).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = AppError::from(CredentialError::MissingEquipmentDomain).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], serde_json::json!(false));
        assert_eq!(body["error"], serde_json::json!("Equipment domain not configured for this client. Please contact support."));
    }
}
