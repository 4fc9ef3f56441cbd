//! Per-attempt backend HTTP client.
//!
//! Every backend conversation is a fresh connection: dial, one HTTP/1.1
//! exchange, done. Dialing and sending are separate steps so the retry
//! logic can distinguish "the connection never came up" (always retryable,
//! the request body is untouched) from "the exchange died" (retryable only
//! when the request can be replayed).
use std::{io, sync::Arc, time::Duration};

use axum::body::Body;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// How one backend attempt failed.
#[derive(Debug)]
pub enum AttemptError {
    /// The connection never came up. Always safe to retry elsewhere.
    Dial(io::Error),
    /// The connection died during the exchange.
    Exchange(hyper::Error),
    /// The backend accepted the request but produced no response header
    /// within the endpoint timeout. Never retried: the request may have
    /// been acted on.
    ResponseTimeout,
    /// The request could not be serialized at all.
    BadRequest,
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Dial(e) => write!(f, "dial failed: {e}"),
            AttemptError::Exchange(e) => write!(f, "exchange failed: {e}"),
            AttemptError::ResponseTimeout => write!(f, "no response header within timeout"),
            AttemptError::BadRequest => write!(f, "request could not be serialized"),
        }
    }
}

/// A freshly dialed backend connection, good for one exchange.
pub struct BackendConn {
    sender: hyper::client::conn::http1::SendRequest<Body>,
    timeout: Duration,
}

impl BackendConn {
    /// Send the request and wait for the response header, bounded by the
    /// endpoint timeout. Streaming the body afterwards is unbounded.
    pub async fn send(mut self, req: Request<Body>) -> Result<Response<Incoming>, AttemptError> {
        match tokio::time::timeout(self.timeout, self.sender.send_request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(AttemptError::Exchange(e)),
            Err(_) => Err(AttemptError::ResponseTimeout),
        }
    }
}

/// Dials backends and route services and runs single HTTP/1.1 exchanges.
pub struct BackendClient {
    endpoint_timeout: Duration,
    tls: TlsConnector,
}

impl BackendClient {
    pub fn new(endpoint_timeout: Duration) -> Self {
        static INSTALL_CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();
        INSTALL_CRYPTO_PROVIDER.call_once(|| {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });

        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if !native.errors.is_empty() {
            tracing::warn!(errors = ?native.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            endpoint_timeout,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Dial a backend (`host:port`) and complete the HTTP/1.1 handshake.
    pub async fn connect(&self, addr: &str) -> Result<BackendConn, AttemptError> {
        let stream = self.dial(addr).await?;
        self.handshake(stream).await
    }

    /// Dial-and-exchange in one step, for callers without retry logic.
    pub async fn exchange(
        &self,
        addr: &str,
        req: Request<Body>,
    ) -> Result<Response<Incoming>, AttemptError> {
        self.connect(addr).await?.send(req).await
    }

    /// One exchange against an absolute route-service URL, speaking TLS when
    /// the scheme demands it.
    pub async fn exchange_url(
        &self,
        scheme: &str,
        host: &str,
        port: u16,
        req: Request<Body>,
    ) -> Result<Response<Incoming>, AttemptError> {
        let addr = format!("{host}:{port}");
        let stream = self.dial(&addr).await?;

        if scheme == "https" {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| AttemptError::BadRequest)?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(AttemptError::Dial)?;
            self.handshake(stream).await?.send(req).await
        } else {
            self.handshake(stream).await?.send(req).await
        }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, AttemptError> {
        match tokio::time::timeout(self.endpoint_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(AttemptError::Dial(e)),
            Err(_) => Err(AttemptError::Dial(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }

    async fn handshake<S>(&self, stream: S) -> Result<BackendConn, AttemptError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(AttemptError::Exchange)?;

        // The connection task lives until the exchange (and any upgrade
        // tunnel) completes; dropping the sender shuts it down cleanly.
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "backend connection closed with error");
            }
        });

        Ok(BackendConn {
            sender,
            timeout: self.endpoint_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn get_request() -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri("/")
            .header("Host", "test")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn connect_refused_is_a_dial_error() {
        let client = BackendClient::new(Duration::from_millis(500));
        // Port 1 on localhost is essentially never listening.
        match client.connect("127.0.0.1:1").await {
            Err(AttemptError::Dial(_)) => {}
            Ok(_) => panic!("expected dial error"),
            Err(other) => panic!("expected dial error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn immediate_close_is_an_exchange_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = BackendClient::new(Duration::from_millis(500));
        match client.exchange(&addr.to_string(), get_request()).await {
            Err(AttemptError::Exchange(_)) => {}
            other => panic!("expected exchange error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_response_header_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(400)).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let client = BackendClient::new(Duration::from_millis(100));
        match client.exchange(&addr.to_string(), get_request()).await {
            Err(AttemptError::ResponseTimeout) => {}
            other => panic!("expected response timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_exchange_returns_the_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await;
        });

        let client = BackendClient::new(Duration::from_secs(1));
        let response = client
            .exchange(&addr.to_string(), get_request())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
