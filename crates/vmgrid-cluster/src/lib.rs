//! vmgrid-cluster — node-to-node transport for VMGrid.
//!
//! Every node runs one [`RpcServer`] and reaches its peers through a
//! [`Transport`]. Requests and responses are length-prefixed JSON frames
//! carried over mutually authenticated TLS.
//!
//! # Architecture
//!
//! ```text
//! caller ──► Transport::call(Target, RpcRequest)
//!              │  TlsTransport: connect (timeout) → TLS → frame → await (deadline)
//!              ▼
//!            RpcServer (per node)
//!              ├── accept loop, one task per connection
//!              ├── TLS config rebuilt per connection (peer CAs may change)
//!              └── RequestHandler::handle(request, peer) → RpcResponse
//!
//! CertificateStore  <node-root>/ssl/{ca,server}.pem, peers/<node>.pem
//! NameDirectory     node → endpoint, published object names
//! ConnectString     hex(JSON{hostname, ip, port, token, ca_pem})
//! ```

pub mod connect_string;
pub mod directory;
pub mod server;
pub mod tls;
pub mod transport;
pub mod wire;

pub use connect_string::ConnectString;
pub use directory::{Endpoint, NameDirectory};
pub use server::{RequestHandler, RpcServer};
pub use tls::CertificateStore;
pub use transport::{Target, TlsTransport, Transport};
pub use wire::{RpcRequest, RpcResponse};
