//! Error taxonomy for the gateway core, plus the axum response wrapper.
//!
//! [`GatewayError`] carries the failure kind the router and transports branch
//! on: transient provider errors trigger fallback iteration, fatal ones do
//! not, protocol errors surface as DNS TXT strings, and so on. Handlers that
//! can fail return `Result<T, AppError>` and propagate with `?` — [`AppError`]
//! converts any error into an HTTP response, picking the status code from the
//! [`GatewayError`] kind when one is in the chain.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Maximum number of provider error-body bytes carried in an error message.
pub const ERROR_BODY_CAP: usize = 2048;

/// Failure kinds surfaced by the core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed input: bad JSON, missing model id, undecodable DNS label.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The requested model id resolves to nothing, even via reverse lookup.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The candidate filter came up empty for the model.
    #[error("no healthy deployments for model {0}")]
    NoHealthyDeployment(String),

    /// Network failure or retryable provider status (408/429/5xx).
    #[error("deployment {deployment}: transient provider error: {message}")]
    ProviderTransient { deployment: String, message: String },

    /// Non-retryable provider status (4xx other than 408/429).
    #[error("deployment {deployment}: provider rejected request: {message}")]
    ProviderFatal { deployment: String, message: String },

    /// Malformed provider response body or event stream.
    #[error("deployment {deployment}: unparseable provider response: {message}")]
    Parse { deployment: String, message: String },

    /// Per-request deadline exceeded.
    #[error("deadline of {0:?} exceeded")]
    Timeout(std::time::Duration),

    /// DNS tunnel protocol violation: bad label, unknown session, missing pages.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Primary and every fallback failed.
    #[error("all deployments failed for model {model}")]
    Exhausted {
        model: String,
        #[source]
        last: Box<GatewayError>,
    },

    /// Façade wrapper carrying the request id and model id.
    #[error("request {request_id} (model {model}) failed")]
    Request {
        request_id: String,
        model: String,
        #[source]
        source: Box<GatewayError>,
    },

    /// Invariant violation. The caller sees "internal error"; details go to logs.
    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    /// Classify a provider HTTP status, capping the body carried upward.
    pub fn from_status(deployment: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let mut message = format!("HTTP {status}");
        if !body.is_empty() {
            let end = body
                .char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .take_while(|&i| i <= ERROR_BODY_CAP)
                .last()
                .unwrap_or(0);
            message.push_str(": ");
            message.push_str(&body[..end]);
        }
        let transient = status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        if transient {
            Self::ProviderTransient { deployment: deployment.to_string(), message }
        } else {
            Self::ProviderFatal { deployment: deployment.to_string(), message }
        }
    }

    /// Whether the failover loop should keep iterating after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. } | Self::Timeout(_))
    }

    /// The innermost error, unwrapping façade and exhaustion wrappers.
    pub fn root(&self) -> &GatewayError {
        match self {
            Self::Exhausted { last, .. } => last.root(),
            Self::Request { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any type that implements `Into<anyhow::Error>` (which includes `io::Error`,
/// `reqwest::Error`, and [`GatewayError`]) can be converted into an
/// [`AppError`] via the blanket [`From`] implementation.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        let Some(kind) = self.0.downcast_ref::<GatewayError>() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match kind.root() {
            GatewayError::BadRequest(_) | GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoHealthyDeployment(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ProviderTransient { .. }
            | GatewayError::ProviderFatal { .. }
            | GatewayError::Parse { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Exhausted/Request are unwrapped by root(); unreachable here but
            // mapped defensively to the gateway-side status.
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Some(GatewayError::Internal(detail)) =
            self.0.downcast_ref::<GatewayError>().map(GatewayError::root)
        {
            tracing::error!(%detail, "invariant violation");
        } else {
            tracing::warn!(error = %self.0, "handler error");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_classify_as_transient() {
        let e = GatewayError::from_status("d1", reqwest::StatusCode::INTERNAL_SERVER_ERROR, "");
        assert!(matches!(e, GatewayError::ProviderTransient { .. }));
        assert!(e.is_transient());
    }

    #[test]
    fn rate_limit_and_request_timeout_are_transient() {
        for status in [reqwest::StatusCode::TOO_MANY_REQUESTS, reqwest::StatusCode::REQUEST_TIMEOUT] {
            let e = GatewayError::from_status("d1", status, "slow down");
            assert!(e.is_transient(), "{status} should be transient");
        }
    }

    #[test]
    fn other_4xx_classify_as_fatal() {
        let e = GatewayError::from_status("d1", reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(e, GatewayError::ProviderFatal { .. }));
        assert!(!e.is_transient());
    }

    #[test]
    fn error_body_is_capped() {
        let body = "x".repeat(ERROR_BODY_CAP * 2);
        let e = GatewayError::from_status("d1", reqwest::StatusCode::BAD_GATEWAY, &body);
        assert!(e.to_string().len() < ERROR_BODY_CAP + 128);
    }

    #[test]
    fn body_cap_respects_utf8_boundaries() {
        // 3-byte chars; the cap must not slice through one.
        let body = "€".repeat(ERROR_BODY_CAP);
        let e = GatewayError::from_status("d1", reqwest::StatusCode::BAD_GATEWAY, &body);
        let _ = e.to_string(); // would panic on a broken boundary
    }

    #[test]
    fn root_unwraps_nested_wrappers() {
        let inner = GatewayError::ModelNotFound("m".into());
        let wrapped = GatewayError::Request {
            request_id: "r1".into(),
            model: "m".into(),
            source: Box::new(GatewayError::Exhausted {
                model: "m".into(),
                last: Box::new(inner),
            }),
        };
        assert!(matches!(wrapped.root(), GatewayError::ModelNotFound(_)));
    }

    #[test]
    fn app_error_maps_kinds_to_status_codes() {
        let cases: Vec<(GatewayError, StatusCode)> = vec![
            (GatewayError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (GatewayError::ModelNotFound("m".into()), StatusCode::NOT_FOUND),
            (GatewayError::NoHealthyDeployment("m".into()), StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::Timeout(std::time::Duration::from_secs(30)), StatusCode::GATEWAY_TIMEOUT),
            (GatewayError::Internal("oops".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status(), expected);
        }
    }
}
