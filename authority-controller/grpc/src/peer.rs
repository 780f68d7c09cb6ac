use dubbo_authority_cert::spiffe_id_from_der;
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;

/// Transport-level facts about a client, attached to each request it sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,

    /// The SPIFFE ID from a verified client certificate.
    pub spiffe_id: Option<String>,
}

/// Wraps a server-side connection so that its [`PeerInfo`] is available to
/// request handlers.
#[derive(Debug)]
pub struct PeerIo<T> {
    io: T,
    info: PeerInfo,
}

// === impl PeerInfo ===

impl PeerInfo {
    pub fn plaintext(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            spiffe_id: None,
        }
    }

    /// Describes a TLS client by the first certificate it presented.
    pub fn tls(remote_addr: SocketAddr, conn: &rustls::ServerConnection) -> Self {
        let spiffe_id = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|cert| spiffe_id_from_der(cert));
        Self {
            remote_addr,
            spiffe_id,
        }
    }
}

// === impl PeerIo ===

impl<T> PeerIo<T> {
    pub fn new(io: T, info: PeerInfo) -> Self {
        Self { io, info }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }
}

impl<T> Connected for PeerIo<T> {
    type ConnectInfo = PeerInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PeerIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PeerIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
