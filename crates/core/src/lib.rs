//! Aggregation core for toolmux: connects to any number of upstream MCP
//! servers and presents them to one downstream client as a single server.

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod lifecycle;
pub mod relay;
pub mod router;

pub use config::{HubConfig, Timeouts, UpstreamDescriptor, UpstreamTarget};
pub use connection::{CloseRegistry, Connection, ConnectionSet};
pub use connector::{ConnectContext, Connector, TransportConnector};
pub use error::HubError;
pub use lifecycle::{Aggregator, HubState, PendingInitHook, PendingInitQueue};
pub use router::{NameEntry, NameTable, Router};
