use crate::{
    cert::{tls, CertStorage},
    grpc::{metrics::AuthorityMetrics, AuthorityServer, IdentityResolver, PeerInfo, PeerIo, RuleServer},
    rule::ConnectionRegistry,
};
use anyhow::Result;
use futures::prelude::*;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tonic::transport::{server::Router, Server};
use tracing::{info, instrument, Instrument};

const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);
const TLS_ACCEPT_BUFFER: usize = 64;

/// The services served on both listeners.
#[derive(Clone, Debug)]
pub(crate) struct Services {
    pub(crate) storage: Arc<CertStorage>,
    pub(crate) resolver: IdentityResolver,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) metrics: AuthorityMetrics,
}

// === impl Services ===

impl Services {
    fn router(&self, drain: drain::Watch) -> Router {
        let authority = AuthorityServer::new(
            self.storage.clone(),
            self.resolver.clone(),
            self.metrics.clone(),
        );
        let rules = RuleServer::new(self.registry.clone(), self.resolver.clone(), drain);
        Server::builder()
            .add_service(authority.clone().svc())
            .add_service(authority.certificate_svc())
            .add_service(rules.svc())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn grpc(addr: SocketAddr, services: Services, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let incoming = plaintext(listener);
    serve(addr, services.router(drain.clone()), incoming, drain).await
}

#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn secure_grpc(
    addr: SocketAddr,
    services: Services,
    drain: drain::Watch,
) -> Result<()> {
    let config = tls::server_config(services.storage.clone())?;
    let listener = TcpListener::bind(addr).await?;
    let incoming = secure(listener, TlsAcceptor::from(config));
    serve(addr, services.router(drain.clone()), incoming, drain).await
}

async fn serve<I, T>(addr: SocketAddr, router: Router, incoming: I, drain: drain::Watch) -> Result<()>
where
    I: Stream<Item = io::Result<PeerIo<T>>> + Send + 'static,
    PeerIo<T>: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    T: Send + 'static,
{
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = router.serve_with_incoming_shutdown(incoming, close_rx.map(|_| {}));
    }

    info!(%addr, "gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

fn plaintext(listener: TcpListener) -> impl Stream<Item = io::Result<PeerIo<TcpStream>>> {
    async_stream::stream! {
        loop {
            match listener.accept().await {
                Ok((io, addr)) => {
                    let _ = io.set_nodelay(true);
                    yield Ok(PeerIo::new(io, PeerInfo::plaintext(addr)));
                }
                Err(error) => tracing::warn!(%error, "Failed to accept connection"),
            }
        }
    }
}

/// Accepts TLS connections, completing handshakes off the accept loop so a
/// slow client cannot stall others.
fn secure(
    listener: TcpListener,
    acceptor: TlsAcceptor,
) -> impl Stream<Item = io::Result<PeerIo<TlsStream<TcpStream>>>> {
    let (tx, rx) = mpsc::channel(TLS_ACCEPT_BUFFER);
    tokio::spawn(
        async move {
            loop {
                let (io, addr) = tokio::select! {
                    res = listener.accept() => match res {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(%error, "Failed to accept connection");
                            continue;
                        }
                    },
                    // The server has stopped.
                    _ = tx.closed() => return,
                };
                let _ = io.set_nodelay(true);

                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(io)).await {
                        Ok(Ok(tls)) => {
                            let info = PeerInfo::tls(addr, tls.get_ref().1);
                            let _ = tx.send(Ok(PeerIo::new(tls, info))).await;
                        }
                        Ok(Err(error)) => {
                            tracing::debug!(client.addr = %addr, %error, "TLS handshake failed")
                        }
                        Err(_) => tracing::debug!(client.addr = %addr, "TLS handshake timed out"),
                    }
                });
            }
        }
        .in_current_span(),
    );
    tokio_stream::wrappers::ReceiverStream::new(rx)
}
