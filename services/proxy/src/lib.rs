//! # Peer Proxy
//!
//! Header-routed HTTP forwarding between peer processes.
//!
//! Inbound requests name their downstream with `X-Server-Addr` and
//! `X-Server-Port` and their caller with `X-Remote-Addr`. The proxy checks
//! the caller against the [`AddressTable`], dials the named target on a
//! fresh connection, adds `X-Caller` / `X-Callee` provenance headers and
//! streams both bodies through.
//!
//! The same process hosts a [`relay_channels::ChannelRegistry`] for
//! publish/subscribe traffic; both live in one [`AppContext`].

pub mod address_table;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod routing;
pub mod server;

pub use address_table::{AddressTable, AddressTableError, Target};
pub use context::AppContext;
pub use error::{ProxyBody, ProxyError};
pub use forwarder::{ForwardState, ForwarderStats, RequestForwarder};
pub use routing::{parse, ParseError, ProvenanceHeaders, RouteRequest};
pub use server::ProxyServer;
