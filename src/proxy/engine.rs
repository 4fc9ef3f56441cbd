//! The proxy engine: one call per inbound request.
//!
//! The pipeline: recognise the load-balancer probe, resolve the pool from
//! the host header (wildcards included), rewrite the forwarded headers,
//! detour through a route service when the pool asks for one, then walk the
//! pool's endpoint iterator until an attempt produces a response or the
//! attempts run out. Responses stream through; nothing is buffered.
use std::{net::IpAddr, sync::Arc, time::Instant};

use axum::body::Body;
use chrono::Utc;
use eyre::{Result, WrapErr};
use http_body::Body as _;
use hyper::{
    body::Incoming,
    header::{HOST, USER_AGENT},
    upgrade::OnUpgrade,
    Request, Response, StatusCode, Uri, Version,
};
use tracing::Instrument;

use crate::{
    access_log::{AccessLogRecord, AccessLogger},
    config::RouterSettings,
    core::{Endpoint, RouteRegistry},
    metrics,
    proxy::{
        body::{CountingBody, PendingRecord},
        client::{AttemptError, BackendClient},
        error::ProxyError,
        headers,
    },
    route_service::{
        Crypto, RouteServiceConfig, ROUTE_SERVICE_FORWARDED_URL, ROUTE_SERVICE_METADATA,
        ROUTE_SERVICE_SIGNATURE,
    },
    tracing_setup,
};

/// Connection-level attempts per request before giving up with a 502.
const MAX_ATTEMPTS: usize = 3;

pub struct ProxyEngine {
    registry: Arc<RouteRegistry>,
    settings: Arc<RouterSettings>,
    client: BackendClient,
    route_service: Option<RouteServiceConfig>,
    access_log: AccessLogger,
}

impl ProxyEngine {
    pub fn new(
        registry: Arc<RouteRegistry>,
        settings: Arc<RouterSettings>,
        access_log: AccessLogger,
    ) -> Result<Self> {
        let route_service = match &settings.route_services {
            Some(keys) => {
                let crypto = Crypto::new(&keys.secret)
                    .map_err(|e| eyre::eyre!("route service key rejected: {e}"))?;
                let crypto_prev = keys
                    .secret_decrypt_only
                    .as_deref()
                    .map(Crypto::new)
                    .transpose()
                    .map_err(|e| eyre::eyre!("previous route service key rejected: {e}"))?;
                Some(RouteServiceConfig::new(
                    crypto,
                    crypto_prev,
                    settings.route_service_timeout,
                    settings.route_services_recommend_https,
                ))
            }
            None => None,
        };

        Ok(Self {
            registry,
            client: BackendClient::new(settings.endpoint_timeout),
            settings,
            route_service,
            access_log,
        })
    }

    /// Handle one request end to end. `scheme` is how the client reached us
    /// (`http` or `https`); `client_ip` is the peer (or the PROXY-protocol
    /// source when enabled).
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
        scheme: &'static str,
    ) -> Response<Body> {
        let request_id = headers::new_request_id();
        let span = tracing_setup::request_span(
            req.method().as_str(),
            req.uri().path(),
            &request_id,
        );
        self.handle_inner(req, client_ip, scheme, request_id)
            .instrument(span)
            .await
    }

    async fn handle_inner(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
        scheme: &'static str,
        request_id: String,
    ) -> Response<Body> {
        let started = Instant::now();
        let mut timer = metrics::RequestTimer::new();

        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();

        let mut record = self.new_record(&req, &host, client_ip);

        // Versions below 1.0 never reach this point intact; refuse anything
        // that somehow does.
        if req.version() == Version::HTTP_09 {
            metrics::record_bad_request();
            timer.set_status(400);
            return self.error_response(record, started, ProxyError::BadRequest);
        }

        // The load balancer's health probe is answered without consulting
        // the registry.
        let probe = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua == headers::LB_PROBE_USER_AGENT)
            .unwrap_or(false);
        if probe {
            record.status = 200;
            record.response_bytes = 3;
            record.response_time = Some(started.elapsed().as_secs_f64());
            self.access_log.log(record);
            timer.set_status(200);
            return Response::builder()
                .status(StatusCode::OK)
                .body(Body::from("ok\n"))
                .expect("probe response must build");
        }

        let host_only = host.split(':').next().unwrap_or("").to_string();
        let path = req.uri().path().to_string();
        let Some(pool) = self.registry.lookup(&host_only, &path) else {
            tracing::info!(host = %host_only, "no route registered");
            metrics::record_bad_request();
            timer.set_status(404);
            return self.error_response(record, started, ProxyError::UnknownRoute(host_only));
        };

        let trace_requested = self.settings.trace_key.as_deref().is_some_and(|key| {
            req.headers()
                .get(headers::X_VCAP_TRACE)
                .and_then(|v| v.to_str().ok())
                == Some(key)
        });

        let sticky = headers::sticky_endpoint_id(req.headers());
        let upgrade = headers::upgrade_protocol(req.headers());
        let request_path_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        // A bodyless request can be replayed against another endpoint after
        // a mid-exchange connection failure; a streaming one cannot.
        let replayable = req.body().size_hint().exact() == Some(0);

        let (mut parts, body) = req.into_parts();
        let client_upgrade = parts.extensions.remove::<OnUpgrade>();

        // Forwarded-header rewrites, identical for backends and route
        // services.
        headers::append_forwarded_for(&mut parts.headers, client_ip);
        headers::set_request_start(&mut parts.headers);
        headers::set_request_id(&mut parts.headers, &request_id);
        record.vcap_request_id = Some(request_id);
        record.x_forwarded_for = parts
            .headers
            .get(headers::X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if upgrade.is_none() {
            headers::sanitize_request(&mut parts.headers);
        } else {
            parts.headers.remove(hyper::header::ACCEPT_ENCODING);
        }

        // Route-service detour: requests for a route-service-bearing pool
        // either carry a valid signature (coming back from the service, go
        // to the backend) or get redirected to the service with a fresh one.
        if let (Some(rs_url), Some(rs_config)) =
            (pool.route_service_url(), self.route_service.as_ref())
        {
            let has_signature = parts.headers.contains_key(ROUTE_SERVICE_SIGNATURE);
            let forwarded_scheme = if rs_config.recommend_https() {
                "https"
            } else {
                scheme
            };
            let forwarded_url = format!("{forwarded_scheme}://{host}{request_path_query}");

            if has_signature {
                let signature = parts
                    .headers
                    .get(ROUTE_SERVICE_SIGNATURE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let metadata = parts
                    .headers
                    .get(ROUTE_SERVICE_METADATA)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();

                if let Err(e) = rs_config.validate_signature(&signature, &metadata, &forwarded_url)
                {
                    tracing::info!(error = %e, "route service signature rejected");
                    metrics::record_bad_request();
                    let err = ProxyError::from(e);
                    timer.set_status(err.status().as_u16());
                    return self.error_response(record, started, err);
                }
                // Validated: fall through and proxy to the real backend.
            } else {
                return self
                    .detour_to_route_service(
                        rs_config,
                        &rs_url,
                        forwarded_url,
                        parts,
                        body,
                        record,
                        started,
                        &mut timer,
                    )
                    .await;
            }
        }

        // Walk the pool until an attempt yields a response header.
        let mut iter = pool.endpoints(&sticky);
        let mut body_slot = Some(body);

        for attempt in 0..MAX_ATTEMPTS {
            let Some(endpoint) = iter.next() else { break };
            let addr = endpoint.canonical_addr();
            let span = tracing_setup::backend_span(&addr, attempt + 1);

            let conn = match self.client.connect(&addr).instrument(span.clone()).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::info!(error = %e, backend = %addr, "backend dial failed");
                    iter.endpoint_failed();
                    continue;
                }
            };

            let out_body = match body_slot.take() {
                Some(body) => Body::new(body),
                None => Body::empty(),
            };
            let out_req = match build_backend_request(&parts, &request_path_query, &endpoint, out_body)
            {
                Ok(req) => req,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build backend request");
                    metrics::record_bad_request();
                    timer.set_status(400);
                    return self.error_response(record, started, ProxyError::BadRequest);
                }
            };

            match conn.send(out_req).instrument(span).await {
                Ok(resp) => {
                    record.backend_addr = Some(addr);
                    record.application_id = Some(endpoint.application_id.clone());
                    record.app_index = Some(endpoint.private_instance_index.clone());
                    return self.forward_response(
                        resp,
                        &endpoint,
                        client_upgrade,
                        trace_requested,
                        record,
                        started,
                        &mut timer,
                    );
                }
                Err(AttemptError::Exchange(e)) if replayable => {
                    tracing::info!(error = %e, backend = %addr, "backend exchange failed, retrying");
                    iter.endpoint_failed();
                    continue;
                }
                Err(e) => {
                    tracing::info!(error = %e, backend = %addr, "backend attempt failed");
                    iter.endpoint_failed();
                    break;
                }
            }
        }

        metrics::record_bad_gateway();
        timer.set_status(502);
        self.error_response(record, started, ProxyError::EndpointFailure)
    }

    fn new_record(
        &self,
        req: &Request<Incoming>,
        host: &str,
        client_ip: IpAddr,
    ) -> AccessLogRecord {
        let get = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        AccessLogRecord {
            host: host.to_string(),
            started_at: Some(Utc::now()),
            method: req.method().to_string(),
            uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            http_version: version_label(req.version()).to_string(),
            request_bytes: get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            referer: get("referer"),
            user_agent: get("user-agent"),
            client_ip: Some(client_ip.to_string()),
            extra_headers: self
                .settings
                .extra_headers_to_log
                .iter()
                .filter_map(|name| {
                    get(name).map(|value| (AccessLogRecord::extra_header_label(name), value))
                })
                .collect(),
            ..AccessLogRecord::default()
        }
    }

    /// Finish a locally generated (error) response and its log record.
    fn error_response(
        &self,
        mut record: AccessLogRecord,
        started: Instant,
        err: ProxyError,
    ) -> Response<Body> {
        let response = err.into_response();
        record.status = response.status().as_u16();
        record.response_time = Some(started.elapsed().as_secs_f64());
        self.access_log.log(record);
        response
    }

    /// Hand a backend (or route-service) response back to the client,
    /// splicing the upgrade tunnel when the backend switched protocols.
    #[allow(clippy::too_many_arguments)]
    fn forward_response(
        &self,
        mut resp: Response<Incoming>,
        endpoint: &Endpoint,
        client_upgrade: Option<OnUpgrade>,
        trace_requested: bool,
        mut record: AccessLogRecord,
        started: Instant,
        timer: &mut metrics::RequestTimer,
    ) -> Response<Body> {
        record.status = resp.status().as_u16();
        timer.set_status(resp.status().as_u16());

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let backend_upgrade = hyper::upgrade::on(&mut resp);
            if let Some(client_upgrade) = client_upgrade {
                tokio::spawn(async move {
                    let (client_io, backend_io) =
                        match tokio::try_join!(client_upgrade, backend_upgrade) {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::info!(error = %e, "upgrade handshake failed");
                                return;
                            }
                        };
                    let mut client_io = hyper_util::rt::TokioIo::new(client_io);
                    let mut backend_io = hyper_util::rt::TokioIo::new(backend_io);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await
                    {
                        tracing::debug!(error = %e, "upgrade tunnel closed");
                    }
                });
            }

            record.response_time = Some(started.elapsed().as_secs_f64());
            self.access_log.log(record);

            let (parts, _) = resp.into_parts();
            return Response::from_parts(parts, Body::empty());
        }

        headers::sanitize_response(resp.headers_mut());
        headers::set_sticky_cookie(resp.headers_mut(), endpoint, self.settings.secure_cookies);
        if trace_requested {
            headers::add_trace_headers(resp.headers_mut(), self.settings.ip, endpoint);
        }

        let (parts, body) = resp.into_parts();
        let counting = CountingBody::new(
            body,
            PendingRecord {
                record,
                started,
                logger: self.access_log.clone(),
            },
        );
        Response::from_parts(parts, Body::new(counting))
    }

    /// Rewrite the request onto the route service, carrying the signed
    /// forwarded-URL headers.
    #[allow(clippy::too_many_arguments)]
    async fn detour_to_route_service(
        &self,
        rs_config: &RouteServiceConfig,
        rs_url: &str,
        forwarded_url: String,
        mut parts: http::request::Parts,
        body: Incoming,
        mut record: AccessLogRecord,
        started: Instant,
        timer: &mut metrics::RequestTimer,
    ) -> Response<Body> {
        let target: Uri = match rs_url.parse() {
            Ok(uri) => uri,
            Err(_) => {
                tracing::error!(url = %rs_url, "pool carries an unparseable route service url");
                metrics::record_bad_gateway();
                timer.set_status(502);
                return self.error_response(record, started, ProxyError::EndpointFailure);
            }
        };

        let (signature, metadata) = match rs_config.generate_headers(&forwarded_url) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "failed to sign route service request");
                metrics::record_bad_gateway();
                timer.set_status(502);
                return self.error_response(record, started, ProxyError::EndpointFailure);
            }
        };

        let scheme = target.scheme_str().unwrap_or("https");
        let rs_host = target.host().unwrap_or_default().to_string();
        let port = target
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(
                target
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            )
            .version(Version::HTTP_11);

        parts.headers.remove(HOST);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(parts.headers.clone());
            let insert = |headers: &mut hyper::HeaderMap, name: &str, value: &str| {
                if let (Ok(name), Ok(value)) = (
                    hyper::header::HeaderName::try_from(name),
                    hyper::header::HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            };
            insert(headers, ROUTE_SERVICE_SIGNATURE, &signature);
            insert(headers, ROUTE_SERVICE_METADATA, &metadata);
            insert(headers, ROUTE_SERVICE_FORWARDED_URL, &forwarded_url);
            let host_value = if target.port_u16().is_some() {
                format!("{rs_host}:{port}")
            } else {
                rs_host.clone()
            };
            insert(headers, "host", &host_value);
        }

        let out_req = match builder.body(Body::new(body)) {
            Ok(req) => req,
            Err(_) => {
                metrics::record_bad_request();
                timer.set_status(400);
                return self.error_response(record, started, ProxyError::BadRequest);
            }
        };

        match self
            .client
            .exchange_url(scheme, &rs_host, port, out_req)
            .await
        {
            Ok(resp) => {
                record.backend_addr = Some(format!("{rs_host}:{port}"));
                record.status = resp.status().as_u16();
                timer.set_status(resp.status().as_u16());

                let (mut resp_parts, resp_body) = resp.into_parts();
                headers::sanitize_response(&mut resp_parts.headers);
                let counting = CountingBody::new(
                    resp_body,
                    PendingRecord {
                        record,
                        started,
                        logger: self.access_log.clone(),
                    },
                );
                Response::from_parts(resp_parts, Body::new(counting))
            }
            Err(e) => {
                tracing::info!(error = %e, url = %rs_url, "route service request failed");
                metrics::record_bad_gateway();
                timer.set_status(502);
                self.error_response(record, started, ProxyError::EndpointFailure)
            }
        }
    }
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}

/// Build the outbound request for one backend attempt. The target is always
/// origin-form with the original, still-encoded path and query; the `Host`
/// header travels unchanged.
fn build_backend_request(
    parts: &http::request::Parts,
    path_query: &str,
    endpoint: &Endpoint,
    body: Body,
) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(path_query)
        .version(Version::HTTP_11);

    if let Some(headers) = builder.headers_mut() {
        headers.extend(parts.headers.clone());
        headers::set_instance_id(headers, endpoint);
    }

    builder.body(body).wrap_err("invalid backend request")
}
