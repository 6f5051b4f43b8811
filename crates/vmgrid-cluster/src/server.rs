//! Server side of the node-to-node transport.
//!
//! One task per connection; requests on a connection are answered in
//! order. The TLS configuration is rebuilt for every connection so peer
//! CAs added or revoked at runtime take effect without a restart.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use vmgrid_auth::PeerInfo;
use vmgrid_core::{BoxFuture, GridError};

use crate::tls::CertificateStore;
use crate::wire::{RpcRequest, RpcResponse, read_frame, write_message};

/// Turns a decoded request into a response.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: RpcRequest, peer: PeerInfo) -> BoxFuture<'_, RpcResponse>;
}

pub struct RpcServer {
    certs: Arc<CertificateStore>,
    handler: Arc<dyn RequestHandler>,
}

impl RpcServer {
    pub fn new(certs: Arc<CertificateStore>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { certs, handler }
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "rpc server listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let certs = Arc::clone(&self.certs);
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, certs, handler).await {
                                    debug!(%addr, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("rpc server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    certs: Arc<CertificateStore>,
    handler: Arc<dyn RequestHandler>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let acceptor = TlsAcceptor::from(certs.server_config()?);
    let mut tls = acceptor.accept(stream).await?;
    let peer = PeerInfo::new(addr);

    while let Some(frame) = read_frame(&mut tls).await? {
        let response = match serde_json::from_slice::<RpcRequest>(&frame) {
            Ok(request) => {
                debug!(%addr, object = %request.object, method = %request.method, "request received");
                handler.handle(request, peer).await
            }
            Err(e) => RpcResponse::Error(GridError::invalid_argument(format!("malformed request: {e}"))),
        };
        write_message(&mut tls, &response).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Endpoint;
    use crate::tls::generate_ca;
    use crate::transport::{Target, TlsTransport, Transport};
    use serde_json::json;
    use std::time::Duration;
    use vmgrid_core::ErrorKind;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, request: RpcRequest, peer: PeerInfo) -> BoxFuture<'_, RpcResponse> {
            Box::pin(async move {
                if request.method == "fail" {
                    return RpcResponse::Error(GridError::new(ErrorKind::VmLocked, "nope"));
                }
                RpcResponse::Ok(json!({
                    "method": request.method,
                    "user": request.handshake.user,
                    "loopback": peer.is_loopback(),
                }))
            })
        }
    }

    fn store(dir: &std::path::Path, node: &str) -> Arc<CertificateStore> {
        let store = CertificateStore::new(&dir.join(node), node);
        store.ensure(&["127.0.0.1".to_string()]).unwrap();
        Arc::new(store)
    }

    async fn start(certs: Arc<CertificateStore>) -> (u16, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = watch::channel(false);
        let server = RpcServer::new(certs, Arc::new(Echo));
        tokio::spawn(server.serve(listener, rx));
        (port, tx)
    }

    fn transport(certs: Arc<CertificateStore>) -> TlsTransport {
        TlsTransport::new(certs, Duration::from_secs(2), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn mutual_tls_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = store(dir.path(), "alpha");
        let beta = store(dir.path(), "beta");
        alpha.add_peer_ca("beta", &beta.ca_pem().unwrap()).unwrap();
        beta.add_peer_ca("alpha", &alpha.ca_pem().unwrap()).unwrap();

        let (port, _shutdown) = start(Arc::clone(&beta)).await;
        let target = Target::new(Endpoint::new("beta", "127.0.0.1", port));
        let request = RpcRequest::new("cluster", "ping")
            .with_handshake(vmgrid_auth::Handshake::password("vmgrid-peer-alpha", "x"));

        let value = transport(Arc::clone(&alpha)).call(&target, request).await.unwrap();
        assert_eq!(value["method"], "ping");
        assert_eq!(value["user"], "vmgrid-peer-alpha");
        assert_eq!(value["loopback"], true);

        let err = transport(alpha)
            .call(&target, RpcRequest::new("cluster", "fail"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VmLocked);
    }

    #[tokio::test]
    async fn unknown_ca_is_refused_until_bootstrapped() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = store(dir.path(), "alpha");
        let gamma = store(dir.path(), "gamma");

        let (port, _shutdown) = start(Arc::clone(&gamma)).await;
        let endpoint = Endpoint::new("gamma", "127.0.0.1", port);

        let err = transport(Arc::clone(&alpha))
            .call(&Target::new(endpoint.clone()), RpcRequest::new("cluster", "ping"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerUnreachable);

        let target = Target::bootstrap(endpoint, &gamma.ca_pem().unwrap());
        let value = transport(alpha)
            .call(&target, RpcRequest::new("cluster", "ping"))
            .await
            .unwrap();
        assert_eq!(value["method"], "ping");
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = store(dir.path(), "alpha");
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = Target::new(Endpoint::new("beta", "127.0.0.1", port));
        let err = transport(alpha)
            .call(&target, RpcRequest::new("cluster", "ping"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerUnreachable);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = store(dir.path(), "alpha");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never speak TLS.
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transport = TlsTransport::new(alpha, Duration::from_millis(200), Duration::from_secs(1));
        let target = Target::new(Endpoint::new("beta", "127.0.0.1", port));
        let err = transport
            .call(&target, RpcRequest::new("cluster", "ping"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
    }

    #[test]
    fn fresh_ca_differs_per_node() {
        let a = generate_ca("alpha").unwrap();
        let b = generate_ca("beta").unwrap();
        assert_ne!(a.cert_pem, b.cert_pem);
    }
}
