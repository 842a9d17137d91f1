//! Error handling and JSON error responses for the host

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Error codes for dispatch and forwarding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Host equals the parent domain, no subdomain to route on
    NoSubdomain,
    /// Host has more than one label in front of the parent domain
    AmbiguousHost,
    /// No tenant registered under this subdomain
    UnknownTenant,
    /// Tenant is stopping or stopped
    TenantStopping,
    /// Tenant has not finished binding its listener
    TenantNotReady,
    /// No handler or static file for this path
    RouteNotFound,
    /// Failed to reach the tenant listener
    ForwardFailed,
    /// Request timed out waiting for the tenant
    RequestTimeout,
    /// Internal host error
    InternalError,
}

impl HostErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            HostErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            HostErrorCode::NoSubdomain => StatusCode::NOT_FOUND,
            HostErrorCode::AmbiguousHost => StatusCode::NOT_FOUND,
            HostErrorCode::UnknownTenant => StatusCode::NOT_FOUND,
            HostErrorCode::TenantStopping => StatusCode::SERVICE_UNAVAILABLE,
            HostErrorCode::TenantNotReady => StatusCode::SERVICE_UNAVAILABLE,
            HostErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            HostErrorCode::ForwardFailed => StatusCode::BAD_GATEWAY,
            HostErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            HostErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Tenement-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            HostErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            HostErrorCode::NoSubdomain => "NO_SUBDOMAIN",
            HostErrorCode::AmbiguousHost => "AMBIGUOUS_HOST",
            HostErrorCode::UnknownTenant => "UNKNOWN_TENANT",
            HostErrorCode::TenantStopping => "TENANT_STOPPING",
            HostErrorCode::TenantNotReady => "TENANT_NOT_READY",
            HostErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            HostErrorCode::ForwardFailed => "FORWARD_FAILED",
            HostErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            HostErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: HostErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: HostErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Tenement-Error header
pub fn json_error_response(
    code: HostErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Tenement-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors raised while building tenants from configuration
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// A tenant name is already registered; the first registration wins
    #[error("duplicate tenant '{name}': already registered")]
    DuplicateTenant { name: String },

    /// A configured static root does not exist or is not a directory
    #[error("tenant '{name}': static root {path:?} is not a directory")]
    MissingStaticRoot { name: String, path: PathBuf },

    /// A tenant descriptor failed validation
    #[error("tenant '{name}': {reason}")]
    InvalidTenant { name: String, reason: String },
}

impl BootstrapError {
    /// Tenant name the error refers to
    pub fn tenant(&self) -> &str {
        match self {
            BootstrapError::DuplicateTenant { name } => name,
            BootstrapError::MissingStaticRoot { name, .. } => name,
            BootstrapError::InvalidTenant { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            HostErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HostErrorCode::UnknownTenant.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HostErrorCode::TenantStopping.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            HostErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            HostErrorCode::ForwardFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            HostErrorCode::AmbiguousHost.status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(HostErrorCode::UnknownTenant, "no tenant for 'about'");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_TENANT\""));
        assert!(json.contains("\"message\":\"no tenant for 'about'\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(HostErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Tenement-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(
            HostErrorCode::MissingHostHeader.as_header_value(),
            "MISSING_HOST_HEADER"
        );
        assert_eq!(HostErrorCode::NoSubdomain.as_header_value(), "NO_SUBDOMAIN");
        assert_eq!(
            HostErrorCode::TenantNotReady.as_header_value(),
            "TENANT_NOT_READY"
        );
    }

    #[test]
    fn test_bootstrap_error_display() {
        let err = BootstrapError::DuplicateTenant {
            name: "about".to_string(),
        };
        assert_eq!(err.tenant(), "about");
        assert!(err.to_string().contains("duplicate tenant 'about'"));

        let err = BootstrapError::MissingStaticRoot {
            name: "files".to_string(),
            path: PathBuf::from("/no/such/dir"),
        };
        assert!(err.to_string().contains("/no/such/dir"));
    }
}
