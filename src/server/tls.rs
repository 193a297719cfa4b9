//! TLS transport adapter. Wraps an accepted socket as either a plain `TcpStream` or a
//! post-handshake `rustls` session, so the rest of the connection-handling code (parsing,
//! response writing) stays oblivious to which one it is talking to.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::limits::TlsLimits;

/// Bound to every type usable as the connection's byte stream (plain or TLS).
///
/// Exists purely as a short name for the bound every I/O-touching method in this crate
/// (`fill_buffer`, `write_bytes`, `send_error`, `run`) repeats.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An accepted connection's transport, after any TLS handshake has completed.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Reports the negotiated TLS session, or `None` for a plaintext connection.
    pub(crate) fn session_info(&self) -> Option<SessionInfo> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(stream) => {
                let (_, conn) = stream.get_ref();
                let protocol_version = conn.protocol_version()?;
                let cipher_suite = conn.negotiated_cipher_suite()?;

                Some(SessionInfo {
                    protocol_version: protocol_version.as_str().unwrap_or("unknown"),
                    cipher_algorithm: cipher_suite.suite().as_str().unwrap_or("unknown"),
                    key_exchange_algorithm: cipher_suite
                        .kx_group()
                        .map(|g| g.name().as_str())
                        .unwrap_or("unknown"),
                    alpn_protocol: conn
                        .alpn_protocol()
                        .and_then(|p| std::str::from_utf8(p).ok()),
                })
            }
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Summary of a negotiated TLS session, queryable from within a [`Handler`](crate::Handler) via
/// [`Request`](crate::Request) for logging or client-certificate-aware routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub cipher_algorithm: &'static str,
    pub key_exchange_algorithm: &'static str,
    pub protocol_version: &'static str,
    pub alpn_protocol: Option<&'static str>,
}

/// Builds a [`TlsAcceptor`] from PEM-encoded key/cert material in [`TlsLimits`].
pub(crate) fn build_acceptor(limits: &TlsLimits) -> Result<TlsAcceptor, io::Error> {
    let certs = rustls_pemfile::certs(&mut &limits.cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let key = rustls_pemfile::private_key(&mut &limits.key_pem[..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Performs the TLS handshake on a freshly accepted socket, swallowing the connection (rather
/// than propagating an error response) on failure, since no `Response` can yet be framed for a
/// peer that never completed a TLS handshake.
pub(crate) async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<Transport, io::Error> {
    acceptor
        .accept(stream)
        .await
        .map(|s| Transport::Tls(Box::new(s)))
}
