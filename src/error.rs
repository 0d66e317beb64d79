use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("metrics backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unexpected query result type (expected vector): {0}")]
    UnexpectedResultShape(String),

    #[error("resource inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("invalid resource specified: {0}")]
    InvalidResource(String),

    #[error("invalid tap request: {0}")]
    InvalidTapRequest(String),

    #[error("streaming is not supported by this connection")]
    StreamingUnsupported,

    #[error("malformed request: {0}")]
    Decode(String),

    #[error("failed to encode response: {0}")]
    Encode(String),

    #[error(
        "{failed} of {dispatched} queries failed: {}",
        .causes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    PartialFailure {
        failed: usize,
        dispatched: usize,
        causes: Vec<GatewayError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Machine-readable name of the error kind, as written in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BackendUnavailable(_) => "BackendUnavailable",
            GatewayError::UnexpectedResultShape(_) => "UnexpectedResultShape",
            GatewayError::InventoryUnavailable(_) => "InventoryUnavailable",
            GatewayError::InvalidResource(_) => "InvalidResource",
            GatewayError::InvalidTapRequest(_) => "InvalidTapRequest",
            GatewayError::StreamingUnsupported => "StreamingUnsupported",
            GatewayError::Decode(_) => "DecodeError",
            GatewayError::Encode(_) => "EncodeError",
            GatewayError::PartialFailure { .. } => "PartialFailure",
            GatewayError::Config(_) => "ConfigError",
            GatewayError::Internal(_) => "Internal",
        }
    }

    /// Individual failures behind this error. A plain error is its own single cause.
    pub fn causes(&self) -> Vec<&GatewayError> {
        match self {
            GatewayError::PartialFailure { causes, .. } => causes.iter().collect(),
            other => vec![other],
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BackendUnavailable(_)
            | GatewayError::InventoryUnavailable(_)
            | GatewayError::PartialFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidResource(_)
            | GatewayError::InvalidTapRequest(_)
            | GatewayError::Decode(_) => StatusCode::BAD_REQUEST,
            GatewayError::StreamingUnsupported => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            GatewayError::UnexpectedResultShape(_)
            | GatewayError::Encode(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

impl From<prost::DecodeError> for GatewayError {
    fn from(err: prost::DecodeError) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

impl From<prost::EncodeError> for GatewayError {
    fn from(err: prost::EncodeError) -> Self {
        GatewayError::Encode(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::BackendUnavailable(err.to_string())
    }
}

impl From<GatewayError> for tonic::Status {
    fn from(err: GatewayError) -> Self {
        let code = match &err {
            GatewayError::BackendUnavailable(_)
            | GatewayError::InventoryUnavailable(_)
            | GatewayError::PartialFailure { .. } => tonic::Code::Unavailable,
            GatewayError::InvalidResource(_)
            | GatewayError::InvalidTapRequest(_)
            | GatewayError::Decode(_) => tonic::Code::InvalidArgument,
            GatewayError::StreamingUnsupported => tonic::Code::Unimplemented,
            GatewayError::UnexpectedResultShape(_)
            | GatewayError::Encode(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => tonic::Code::Internal,
        };
        tonic::Status::new(code, err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.kind(),
        }));

        (self.status_code(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
