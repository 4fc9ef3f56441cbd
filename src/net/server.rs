//! Listener loop and per-connection plumbing.
//!
//! Each accepted connection goes through: optional PROXY-protocol preamble,
//! optional TLS, then the head sniffer. Opaque `Upgrade: tcp` requests turn
//! into raw byte tunnels; everything else is served by hyper with the proxy
//! engine as the handler.
use std::{convert::Infallible, net::IpAddr, sync::Arc};

use bytes::Bytes;
use eyre::Result;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::RouterSettings,
    core::RouteRegistry,
    lifecycle::{ConnectionGauge, DrainSignal},
    net::preamble::{self, PrefixedStream, Sniffed},
    proxy::ProxyEngine,
};

const TUNNEL_ATTEMPTS: usize = 3;

pub struct ProxyServer {
    engine: Arc<ProxyEngine>,
    registry: Arc<RouteRegistry>,
    settings: Arc<RouterSettings>,
    drain: Arc<DrainSignal>,
    gauge: ConnectionGauge,
}

impl ProxyServer {
    pub fn new(
        engine: Arc<ProxyEngine>,
        registry: Arc<RouteRegistry>,
        settings: Arc<RouterSettings>,
        drain: Arc<DrainSignal>,
        gauge: ConnectionGauge,
    ) -> Self {
        Self {
            engine,
            registry,
            settings,
            drain,
            gauge,
        }
    }

    /// Accept until the drain signal fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        let scheme: &'static str = if acceptor.is_some() { "https" } else { "http" };
        let mut draining = self.drain.subscribe();

        tracing::info!(addr = %listener.local_addr()?, scheme, "listening");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = draining.recv() => {
                    tracing::info!(scheme, "listener stopped accepting");
                    return Ok(());
                }
            };

            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let guard = server.gauge.track();
                if let Err(e) = server.handle_connection(stream, peer, acceptor, scheme).await {
                    tracing::debug!(error = %e, %peer, "connection ended with error");
                }
                drop(guard);
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: std::net::SocketAddr,
        acceptor: Option<TlsAcceptor>,
        scheme: &'static str,
    ) -> Result<()> {
        let proxy_source = if self.settings.enable_proxy {
            preamble::read_proxy_line(&mut stream).await?
        } else {
            None
        };
        let client_ip = preamble::effective_client_ip(peer, proxy_source);

        match acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                self.serve_stream(tls_stream, client_ip, scheme).await
            }
            None => self.serve_stream(stream, client_ip, scheme).await,
        }
    }

    async fn serve_stream<S>(&self, mut stream: S, client_ip: IpAddr, scheme: &'static str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match preamble::sniff_head(&mut stream).await? {
            Sniffed::TcpUpgrade {
                host,
                path,
                remainder,
            } => {
                self.tunnel_tcp(stream, &host, &path, remainder).await;
                Ok(())
            }
            Sniffed::Http { buffered } => {
                let stream = PrefixedStream::new(buffered, stream);
                let engine = self.engine.clone();
                let service = service_fn(move |req| {
                    let engine = engine.clone();
                    async move { Ok::<_, Infallible>(engine.handle(req, client_ip, scheme).await) }
                });

                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await?;
                Ok(())
            }
        }
    }

    /// Opaque tunnel for `Upgrade: tcp`: route by the sniffed host, dial an
    /// endpoint, and splice bytes both ways. The request head is not
    /// forwarded; any bytes the client sent past it are.
    async fn tunnel_tcp<S>(&self, mut client: S, host: &str, path: &str, remainder: Bytes)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let host_only = host.split(':').next().unwrap_or("");
        let Some(pool) = self.registry.lookup(host_only, path) else {
            tracing::info!(host = %host_only, "no route for tcp tunnel");
            let _ = client
                .write_all(b"HTTP/1.1 404 Not Found\r\nconnection: close\r\n\r\n")
                .await;
            return;
        };

        let mut iter = pool.endpoints("");
        for _ in 0..TUNNEL_ATTEMPTS {
            let Some(endpoint) = iter.next() else { break };
            let addr = endpoint.canonical_addr();

            let backend = match tokio::time::timeout(
                self.settings.endpoint_timeout,
                TcpStream::connect(&addr),
            )
            .await
            {
                Ok(Ok(backend)) => backend,
                _ => {
                    tracing::info!(backend = %addr, "tcp tunnel dial failed");
                    iter.endpoint_failed();
                    continue;
                }
            };

            let mut backend = backend;
            if !remainder.is_empty() {
                if backend.write_all(&remainder).await.is_err() {
                    iter.endpoint_failed();
                    break;
                }
            }

            tracing::debug!(backend = %addr, "tcp tunnel established");
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                tracing::debug!(error = %e, "tcp tunnel closed");
            }
            return;
        }

        let _ = client
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\nconnection: close\r\n\r\n")
            .await;
    }
}
