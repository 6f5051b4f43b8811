//! Client side of the node-to-node transport.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use vmgrid_core::{BoxFuture, ErrorKind, GridError, GridResult};

use crate::directory::Endpoint;
use crate::tls::CertificateStore;
use crate::wire::{RpcRequest, RpcResponse, read_message, write_message};

/// Where a call goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub endpoint: Endpoint,
    /// Trust only this CA. Set while a node is being adopted and its CA is
    /// not yet in the peer store.
    pub bootstrap_ca: Option<String>,
}

impl Target {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            bootstrap_ca: None,
        }
    }

    pub fn bootstrap(endpoint: Endpoint, ca_pem: &str) -> Self {
        Self {
            endpoint,
            bootstrap_ca: Some(ca_pem.to_string()),
        }
    }

    pub fn node(&self) -> &str {
        &self.endpoint.node
    }
}

/// Sends one request to one node and returns the decoded result.
///
/// Unreachable peers surface as `PeerUnreachable`, slow ones as
/// `TimeoutExceeded`; errors raised by the peer come back unchanged.
pub trait Transport: Send + Sync {
    fn call<'a>(&'a self, target: &'a Target, request: RpcRequest) -> BoxFuture<'a, GridResult<Value>>;
}

/// mTLS transport, one connection per call.
pub struct TlsTransport {
    certs: Arc<CertificateStore>,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl TlsTransport {
    pub fn new(certs: Arc<CertificateStore>, connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            certs,
            connect_timeout,
            call_timeout,
        }
    }

    async fn exchange(&self, target: &Target, request: RpcRequest) -> GridResult<Value> {
        let node = target.node();
        let config = match &target.bootstrap_ca {
            Some(ca) => self.certs.bootstrap_client_config(ca),
            None => self.certs.client_config(),
        }
        .map_err(|e| GridError::bug(format!("TLS client configuration: {e:#}")))?;
        let server_name = ServerName::try_from(node.to_string()).map_err(|_| {
            GridError::new(ErrorKind::InvalidHostname, format!("'{node}' is not a valid server name"))
        })?;
        let connector = TlsConnector::from(config);
        let address = target.endpoint.address();

        let connect = async {
            let tcp = TcpStream::connect(&address).await?;
            tcp.set_nodelay(true)?;
            connector.connect(server_name, tcp).await
        };
        let mut stream = match timeout(self.connect_timeout, connect).await {
            Err(_) => {
                return Err(GridError::new(
                    ErrorKind::TimeoutExceeded,
                    format!("connecting to {node} at {address} timed out"),
                ));
            }
            Ok(Err(e)) => {
                return Err(GridError::new(
                    ErrorKind::PeerUnreachable,
                    format!("cannot reach {node} at {address}: {e}"),
                ));
            }
            Ok(Ok(stream)) => stream,
        };

        debug!(%node, object = %request.object, method = %request.method, "sending request");
        let call = async {
            write_message(&mut stream, &request).await?;
            read_message::<RpcResponse, _>(&mut stream).await
        };
        match timeout(self.call_timeout, call).await {
            Err(_) => Err(GridError::new(
                ErrorKind::TimeoutExceeded,
                format!("call {}.{} on {node} exceeded its deadline", request.object, request.method),
            )),
            Ok(Err(e)) => Err(GridError::new(
                ErrorKind::PeerUnreachable,
                format!("connection to {node} failed: {e}"),
            )),
            Ok(Ok(None)) => Err(GridError::new(
                ErrorKind::PeerUnreachable,
                format!("{node} closed the connection without answering"),
            )),
            Ok(Ok(Some(response))) => response.into_result(),
        }
    }
}

impl Transport for TlsTransport {
    fn call<'a>(&'a self, target: &'a Target, request: RpcRequest) -> BoxFuture<'a, GridResult<Value>> {
        Box::pin(self.exchange(target, request))
    }
}
