pub mod access;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod pages;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod wiki;

pub use codec::{MethodResponse, RpcValue};
pub use error::{Result, WikiError};
pub use transport::{TransportConfig, XmlRpcClient, XmlRpcTransport};
pub use wiki::WikiService;
