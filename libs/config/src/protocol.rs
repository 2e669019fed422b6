//! Wire-visible header names
//!
//! Header names shared by the routing proxy and anything that talks to it.
//! HTTP header names are case-insensitive; these are the canonical spellings.

/// Downstream address the request should be forwarded to
pub const SERVER_ADDR_HEADER: &str = "x-server-addr";

/// Downstream port the request should be forwarded to
pub const SERVER_PORT_HEADER: &str = "x-server-port";

/// Identity of the calling peer
pub const REMOTE_ADDR_HEADER: &str = "x-remote-addr";

/// Provenance header naming the originating peer
pub const CALLER_HEADER: &str = "x-caller";

/// Provenance header naming the receiving peer
pub const CALLEE_HEADER: &str = "x-callee";

/// Role suffixes appended to peer names in provenance headers
pub mod roles {
    pub const CALLER_SUFFIX: &str = "agent";
    pub const CALLEE_SUFFIX: &str = "daemon";
}
