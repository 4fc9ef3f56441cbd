//! Header rewriting for proxied requests and responses.
use std::net::IpAddr;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::core::Endpoint;

pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_REQUEST_START: &str = "X-Request-Start";
pub const X_VCAP_REQUEST_ID: &str = "X-Vcap-Request-Id";
pub const X_VCAP_TRACE: &str = "X-Vcap-Trace";
pub const X_VCAP_BACKEND: &str = "X-Vcap-Backend";
pub const X_CF_ROUTE_ENDPOINT: &str = "X-Cf-RouteEndpoint";
pub const X_VCAP_ROUTER: &str = "X-Vcap-Router";
pub const X_CF_INSTANCE_ID: &str = "X-Cf-Instance-Id";
/// Instance-pinning request header, `app-guid:instance-index`.
pub const X_CF_APP_INSTANCE: &str = "X-Cf-App-Instance";
/// Sticky-session cookie.
pub const VCAP_ID_COOKIE: &str = "VCAP_ID";
/// Session cookie that triggers sticky-session creation.
pub const STICKY_SESSION_COOKIE: &str = "JSESSIONID";

/// The well-known load-balancer probe user agent.
pub const LB_PROBE_USER_AGENT: &str = "HTTP-Monitor/1.1";

/// Append the direct client IP to `X-Forwarded-For`, preserving any prior
/// value as a comma-separated list.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();

    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        let name = HeaderName::from_static("x-forwarded-for");
        headers.remove(&name);
        headers.insert(name, value);
    }
}

/// Stamp `X-Request-Start` with the current unix milliseconds, but only when
/// the header is entirely absent. Any prior values, even empty strings, are
/// preserved untouched.
pub fn set_request_start(headers: &mut HeaderMap) {
    if headers.contains_key(X_REQUEST_START) {
        return;
    }
    let millis = chrono::Utc::now().timestamp_millis();
    if let Ok(value) = HeaderValue::from_str(&millis.to_string()) {
        headers.insert(HeaderName::from_static("x-request-start"), value);
    }
}

/// Overwrite `X-Vcap-Request-Id` with the request's freshly generated UUID,
/// discarding whatever the client sent.
pub fn set_request_id(headers: &mut HeaderMap, id: &str) {
    if let Ok(value) = HeaderValue::from_str(id) {
        headers.insert(HeaderName::from_static("x-vcap-request-id"), value);
    }
}

/// A fresh v4-shaped request id.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identify the backend instance to the application: the endpoint's private
/// instance id when it has one, else its `ip:port`.
pub fn set_instance_id(headers: &mut HeaderMap, endpoint: &Endpoint) {
    let id = if endpoint.private_instance_id.is_empty() {
        endpoint.canonical_addr()
    } else {
        endpoint.private_instance_id.clone()
    };
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(HeaderName::from_static("x-cf-instance-id"), value);
    }
}

/// True when any `Connection` token equals `upgrade`, across comma-separated
/// and repeated headers, case-insensitively.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// The requested upgrade protocol, lowercased, when this is an upgrade
/// request.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<String> {
    if !is_upgrade(headers) {
        return None;
    }
    headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}

/// Strip what must not travel to the backend on a plain (non-upgrade)
/// request: connection-scoped headers and the client's `Accept-Encoding`
/// (the backend must answer uncompressed).
pub fn sanitize_request(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for token in named {
        if let Ok(name) = HeaderName::try_from(token.as_str()) {
            headers.remove(name);
        }
    }

    headers.remove(hyper::header::CONNECTION);
    headers.remove("Proxy-Connection");
    headers.remove("Keep-Alive");
    headers.remove(hyper::header::ACCEPT_ENCODING);
}

/// Strip connection-scoped headers from a backend response before it goes
/// back to the client (hyper manages downstream keep-alive itself).
pub fn sanitize_response(headers: &mut HeaderMap) {
    headers.remove(hyper::header::CONNECTION);
    headers.remove("Keep-Alive");
}

/// Add the trace-key-gated debug headers to a response.
pub fn add_trace_headers(headers: &mut HeaderMap, router_ip: IpAddr, endpoint: &Endpoint) {
    let addr = endpoint.canonical_addr();
    if let Ok(value) = HeaderValue::from_str(&addr) {
        headers.insert(HeaderName::from_static("x-vcap-backend"), value.clone());
        headers.insert(HeaderName::from_static("x-cf-routeendpoint"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&router_ip.to_string()) {
        headers.insert(HeaderName::from_static("x-vcap-router"), value);
    }
}

/// The sticky-session target for this request: the `VCAP_ID` cookie, or an
/// explicit `X-Cf-App-Instance` pin. Empty when neither is present.
pub fn sticky_endpoint_id(headers: &HeaderMap) -> String {
    for value in headers.get_all(hyper::header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in cookie::Cookie::split_parse(value.to_string()).flatten() {
            if pair.name() == VCAP_ID_COOKIE {
                return pair.value().to_string();
            }
        }
    }

    headers
        .get(X_CF_APP_INSTANCE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default()
}

/// When the backend opened a session, pin the client to this endpoint with a
/// `VCAP_ID` cookie of our own.
pub fn set_sticky_cookie(
    response_headers: &mut HeaderMap,
    endpoint: &Endpoint,
    secure_cookies: bool,
) {
    if endpoint.private_instance_id.is_empty() {
        return;
    }

    let has_session = response_headers
        .get_all(hyper::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| cookie::Cookie::parse(v.to_string()).ok())
        .any(|c| c.name() == STICKY_SESSION_COOKIE);
    if !has_session {
        return;
    }

    let mut sticky = cookie::Cookie::new(VCAP_ID_COOKIE, endpoint.private_instance_id.clone());
    sticky.set_path("/");
    if secure_cookies {
        sticky.set_secure(true);
    }
    if let Ok(value) = HeaderValue::from_str(&sticky.to_string()) {
        response_headers.append(hyper::header::SET_COOKIE, value);
    }
}
