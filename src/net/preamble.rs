//! Connection preamble handling.
//!
//! Before a connection is handed to the HTTP machinery we may need to read
//! ahead: a PROXY-protocol v1 line when `enable_proxy` is on, and the
//! request head to spot `Upgrade: tcp` requests, which bypass HTTP entirely
//! and become opaque byte tunnels. Bytes read ahead that belong to the
//! stream are replayed through [`PrefixedStream`].
use std::{
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Upper bound on the bytes we are willing to read ahead for a request head.
const MAX_HEAD: usize = 16 * 1024;
const MAX_PROXY_LINE: usize = 107;

/// What the head sniffer decided about a connection.
pub enum Sniffed {
    /// A normal HTTP connection; serve it, replaying `buffered` first.
    Http { buffered: Bytes },
    /// An `Upgrade: tcp` request: `host`/`path` route it, `remainder` holds
    /// client bytes already read past the head. The head itself is not
    /// forwarded.
    TcpUpgrade {
        host: String,
        path: String,
        remainder: Bytes,
    },
}

/// Parse a PROXY protocol v1 line, returning the advertised source address.
/// `UNKNOWN` connections fall back to the transport peer address.
pub async fn read_proxy_line<S>(stream: &mut S) -> io::Result<Option<IpAddr>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_PROXY_LINE);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside PROXY preamble",
            ));
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > MAX_PROXY_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "PROXY preamble too long",
            ));
        }
    }

    let line = String::from_utf8_lossy(&line);
    let mut fields = line.trim_end().split(' ');
    match (fields.next(), fields.next()) {
        (Some("PROXY"), Some("UNKNOWN")) => Ok(None),
        (Some("PROXY"), Some("TCP4")) | (Some("PROXY"), Some("TCP6")) => {
            let source = fields.next().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "PROXY preamble missing source")
            })?;
            source
                .parse::<IpAddr>()
                .map(Some)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad PROXY source address"))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed PROXY preamble",
        )),
    }
}

/// Read the request head and decide whether this connection is an opaque
/// TCP tunnel or plain HTTP.
pub async fn sniff_head<S>(stream: &mut S) -> io::Result<Sniffed>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // EOF before a complete head: let hyper produce the error.
            return Ok(Sniffed::Http {
                buffered: Bytes::from(buffered),
            });
        }
        buffered.extend_from_slice(&chunk[..n]);

        if let Some(head_end) = find_head_end(&buffered) {
            return Ok(examine_head(buffered, head_end));
        }
        if buffered.len() > MAX_HEAD {
            return Ok(Sniffed::Http {
                buffered: Bytes::from(buffered),
            });
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn examine_head(buffered: Vec<u8>, head_end: usize) -> Sniffed {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);

    let complete = matches!(
        parsed.parse(&buffered[..head_end]),
        Ok(httparse::Status::Complete(_))
    );
    if !complete {
        return Sniffed::Http {
            buffered: Bytes::from(buffered),
        };
    }

    let header = |name: &str| -> Vec<&str> {
        parsed
            .headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .filter_map(|h| std::str::from_utf8(h.value).ok())
            .collect()
    };

    let upgrade_requested = header("connection")
        .iter()
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let tcp_upgrade = upgrade_requested
        && header("upgrade")
            .iter()
            .any(|v| v.trim().eq_ignore_ascii_case("tcp"));

    if !tcp_upgrade {
        return Sniffed::Http {
            buffered: Bytes::from(buffered),
        };
    }

    let host = header("host")
        .first()
        .map(|v| v.trim().to_string())
        .unwrap_or_default();
    let path = parsed.path.unwrap_or("/").to_string();
    let remainder = Bytes::copy_from_slice(&buffered[head_end..]);

    Sniffed::TcpUpgrade {
        host,
        path,
        remainder,
    }
}

/// A stream with some already-read bytes stitched back onto the front.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Format the peer address with a PROXY-protocol override applied.
pub fn effective_client_ip(peer: SocketAddr, proxy_source: Option<IpAddr>) -> IpAddr {
    proxy_source.unwrap_or_else(|| peer.ip())
}
