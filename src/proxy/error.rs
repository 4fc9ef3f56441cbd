//! Client-visible proxy errors and their HTTP renderings.
use axum::body::Body;
use hyper::{Response, StatusCode};

use crate::route_service::RouteServiceError;

/// Name of the header carrying the router's error kind.
pub const ROUTER_ERROR_HEADER: &str = "X-Cf-RouterError";

/// Everything the proxy can refuse a request with.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no route registered for host '{0}'")]
    UnknownRoute(String),
    #[error("all registered endpoints failed")]
    EndpointFailure,
    #[error("malformed request")]
    BadRequest,
    #[error(transparent)]
    RouteService(#[from] RouteServiceError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownRoute(_) => StatusCode::NOT_FOUND,
            ProxyError::EndpointFailure => StatusCode::BAD_GATEWAY,
            ProxyError::BadRequest => StatusCode::BAD_REQUEST,
            ProxyError::RouteService(RouteServiceError::Expired) => StatusCode::BAD_GATEWAY,
            ProxyError::RouteService(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// The machine-readable error kind for `X-Cf-RouterError`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::UnknownRoute(_) => "unknown_route",
            ProxyError::EndpointFailure => "endpoint_failure",
            ProxyError::BadRequest => "bad_request",
            ProxyError::RouteService(RouteServiceError::Expired) => {
                "route_service_request_expired"
            }
            ProxyError::RouteService(RouteServiceError::ForwardedUrlMismatch) => {
                "route_service_forwarded_url_mismatch"
            }
            ProxyError::RouteService(RouteServiceError::SignatureInvalid) => {
                "route_service_signature_invalid"
            }
        }
    }

    fn body(&self) -> String {
        match self {
            ProxyError::UnknownRoute(host) => {
                format!("404 Not Found: Requested route ('{host}') does not exist.\n")
            }
            ProxyError::EndpointFailure => {
                "502 Bad Gateway: Registered endpoint failed to handle the request.\n".to_string()
            }
            ProxyError::BadRequest => "400 Bad Request\n".to_string(),
            ProxyError::RouteService(e) => format!("{}: {e}\n", self.status().as_u16()),
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let body = self.body();
        Response::builder()
            .status(self.status())
            .header(ROUTER_ERROR_HEADER, self.kind())
            .body(Body::from(body))
            .expect("static error response must build")
    }
}
