use crate::{
    api::{
        self,
        rule_service_server::{RuleService, RuleServiceServer},
    },
    identity::{Credentials, IdentityResolver},
};
use dubbo_authority_rule::{Connection, ConnectionRegistry, ObserveRequest, ObserveResponse};
use futures::prelude::*;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Streams rules to workloads over the bidirectional `Observe` call.
#[derive(Clone, Debug)]
pub struct RuleServer {
    registry: ConnectionRegistry,
    resolver: IdentityResolver,
    drain: drain::Watch,
}

pub type BoxObserveStream =
    Pin<Box<dyn Stream<Item = Result<api::ObserveResponse, tonic::Status>> + Send>>;

// === impl RuleServer ===

impl RuleServer {
    pub fn new(registry: ConnectionRegistry, resolver: IdentityResolver, drain: drain::Watch) -> Self {
        Self {
            registry,
            resolver,
            drain,
        }
    }

    pub fn svc(self) -> RuleServiceServer<Self> {
        RuleServiceServer::new(self)
    }
}

#[async_trait::async_trait]
impl RuleService for RuleServer {
    type ObserveStream = BoxObserveStream;

    async fn observe(
        &self,
        req: tonic::Request<tonic::Streaming<api::ObserveRequest>>,
    ) -> Result<tonic::Response<BoxObserveStream>, tonic::Status> {
        let creds = Credentials::from_request(&req);
        let peer = creds.peer.as_ref().map(|p| p.remote_addr);
        let endpoint = self.resolver.resolve(creds).await.map_err(|error| {
            tracing::warn!(?peer, %error, "Rejecting observe stream");
            tonic::Status::unauthenticated(error.to_string())
        })?;

        tracing::debug!(?peer, endpoint = %endpoint.id, "Observing rules");
        let (conn, pushes) = self.registry.connect(endpoint);
        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            conn,
            pushes,
            req.into_inner(),
        )))
    }
}

/// Relays client requests to `conn` and its pushes back to the client.
///
/// The connection is dropped, and so deregistered, when the client stops
/// sending, when its stream fails, or when the server begins shutting down.
fn response_stream<S>(
    drain: drain::Watch,
    conn: Connection,
    mut pushes: mpsc::Receiver<ObserveResponse>,
    requests: S,
) -> BoxObserveStream
where
    S: Stream<Item = Result<api::ObserveRequest, tonic::Status>> + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
            let requests = requests;
        }

        loop {
            tokio::select! {
                req = requests.next() => match req {
                    Some(Ok(req)) => conn.handle_request(ObserveRequest {
                        nonce: req.nonce,
                        rule_type: req.r#type,
                    }),
                    Some(Err(status)) => {
                        tracing::debug!(id = conn.id(), %status, "Observe stream failed");
                        return;
                    }
                    None => return,
                },

                rsp = pushes.recv() => match rsp {
                    Some(rsp) => yield to_api(rsp),
                    None => return,
                },

                // Close the stream so that it doesn't hold the server open.
                _ = (&mut shutdown) => return,
            }
        }
    })
}

fn to_api(rsp: ObserveResponse) -> api::ObserveResponse {
    api::ObserveResponse {
        nonce: rsp.nonce,
        r#type: rsp.rule_type.as_str().to_string(),
        revision: rsp.revision,
        data: rsp.data,
    }
}
