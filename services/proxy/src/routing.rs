//! Routing header parsing
//!
//! Every routed request names its downstream with `X-Server-Addr` and
//! `X-Server-Port` and its caller with `X-Remote-Addr`. The headers, not the
//! address table, decide where a request goes. The table only has to know
//! the caller.

use crate::address_table::{AddressTable, Target};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use peer_config::{roles, CALLEE_HEADER, CALLER_HEADER, REMOTE_ADDR_HEADER, SERVER_ADDR_HEADER, SERVER_PORT_HEADER};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Missing required header {0}")]
    MissingHeader(&'static str),

    #[error("Header {0} must appear exactly once")]
    DuplicateHeader(&'static str),

    #[error("Header {0} must not be empty")]
    EmptyHeader(&'static str),

    #[error("Invalid port '{value}' in {header}: expected an integer in 0..=65535")]
    InvalidPort { header: &'static str, value: String },

    #[error("Unknown peer '{0}' in x-remote-addr")]
    UnknownPeer(String),

    #[error("Header {0} is not valid visible ASCII")]
    InvalidHeaderValue(&'static str),

    #[error("Provenance identity for {0} is empty")]
    EmptyIdentity(&'static str),
}

/// Outcome of parsing the routing headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// Where the request goes, exactly as the headers name it
    pub target: Target,
    /// Address table name of the calling peer
    pub caller_peer: String,
}

/// Parse and validate the routing headers of an inbound request
pub fn parse(headers: &HeaderMap, table: &AddressTable) -> Result<RouteRequest, ParseError> {
    let host = single_value(headers, SERVER_ADDR_HEADER)?;
    if host.is_empty() {
        return Err(ParseError::EmptyHeader(SERVER_ADDR_HEADER));
    }

    let port_value = single_value(headers, SERVER_PORT_HEADER)?;
    let port = parse_port(port_value).ok_or_else(|| ParseError::InvalidPort {
        header: SERVER_PORT_HEADER,
        value: port_value.to_string(),
    })?;

    let remote = match headers.get(REMOTE_ADDR_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| ParseError::InvalidHeaderValue(REMOTE_ADDR_HEADER))?
            .trim(),
        None => return Err(ParseError::UnknownPeer(String::new())),
    };
    let caller_peer = table
        .identify(remote)
        .ok_or_else(|| ParseError::UnknownPeer(remote.to_string()))?;

    Ok(RouteRequest {
        target: Target::new(host, port),
        caller_peer: caller_peer.to_string(),
    })
}

/// Decimal digits only; `u16::from_str` alone would also take a leading `+`
fn parse_port(value: &str) -> Option<u16> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn single_value<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ParseError> {
    let mut values = headers.get_all(name).iter();
    let value = values.next().ok_or(ParseError::MissingHeader(name))?;
    if values.next().is_some() {
        return Err(ParseError::DuplicateHeader(name));
    }
    value
        .to_str()
        .map(str::trim)
        .map_err(|_| ParseError::InvalidHeaderValue(name))
}

/// `X-Caller` and `X-Callee` values for one forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceHeaders {
    caller: HeaderValue,
    callee: HeaderValue,
}

impl ProvenanceHeaders {
    /// Build from peer identities; both must be non-empty header-safe strings
    pub fn new(caller_peer: &str, callee_peer: &str) -> Result<Self, ParseError> {
        Ok(Self {
            caller: role_value(caller_peer, roles::CALLER_SUFFIX, CALLER_HEADER)?,
            callee: role_value(callee_peer, roles::CALLEE_SUFFIX, CALLEE_HEADER)?,
        })
    }

    /// Provenance for a parsed route; the callee falls back to the literal
    /// target address when the table does not know it
    pub fn for_route(route: &RouteRequest, table: &AddressTable) -> Result<Self, ParseError> {
        Self::new(&route.caller_peer, &table.identity_for(&route.target))
    }

    pub fn caller(&self) -> &str {
        self.caller.to_str().unwrap_or_default()
    }

    pub fn callee(&self) -> &str {
        self.callee.to_str().unwrap_or_default()
    }

    /// Overwrite any provenance headers already present
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static(CALLER_HEADER), self.caller.clone());
        headers.insert(HeaderName::from_static(CALLEE_HEADER), self.callee.clone());
    }
}

fn role_value(peer: &str, suffix: &str, header: &'static str) -> Result<HeaderValue, ParseError> {
    let peer = peer.trim();
    if peer.is_empty() {
        return Err(ParseError::EmptyIdentity(header));
    }
    HeaderValue::from_str(&format!("{}:{}", peer, suffix))
        .map_err(|_| ParseError::InvalidHeaderValue(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AddressTable {
        AddressTable::new([
            ("alpha", Target::new("10.0.0.1", 9000)),
            ("beta", Target::new("10.0.0.2", 9000)),
        ])
        .unwrap()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_parse_valid_headers() {
        let route = parse(
            &headers(&[
                ("X-Server-Addr", "10.0.0.2"),
                ("x-server-port", "9000"),
                ("X-REMOTE-ADDR", "alpha"),
            ]),
            &table(),
        )
        .unwrap();
        assert_eq!(route.target, Target::new("10.0.0.2", 9000));
        assert_eq!(route.caller_peer, "alpha");
    }

    #[test]
    fn test_headers_are_authoritative_over_table() {
        let route = parse(
            &headers(&[
                ("x-server-addr", "upstream.internal"),
                ("x-server-port", "8443"),
                ("x-remote-addr", "10.0.0.1:9000"),
            ]),
            &table(),
        )
        .unwrap();
        assert_eq!(route.target, Target::new("upstream.internal", 8443));
        assert_eq!(route.caller_peer, "alpha");
    }

    #[test]
    fn test_missing_and_duplicate_headers() {
        let table = table();
        assert_eq!(
            parse(&headers(&[("x-server-port", "1"), ("x-remote-addr", "alpha")]), &table),
            Err(ParseError::MissingHeader(SERVER_ADDR_HEADER))
        );
        assert_eq!(
            parse(
                &headers(&[
                    ("x-server-addr", "a"),
                    ("x-server-addr", "b"),
                    ("x-server-port", "1"),
                    ("x-remote-addr", "alpha"),
                ]),
                &table
            ),
            Err(ParseError::DuplicateHeader(SERVER_ADDR_HEADER))
        );
        assert_eq!(
            parse(
                &headers(&[("x-server-addr", "  "), ("x-server-port", "1")]),
                &table
            ),
            Err(ParseError::EmptyHeader(SERVER_ADDR_HEADER))
        );
    }

    #[test]
    fn test_invalid_port_names_port() {
        let err = parse(
            &headers(&[
                ("x-server-addr", "127.0.0.1"),
                ("x-server-port", "70000"),
                ("x-remote-addr", "alpha"),
            ]),
            &table(),
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidPort { .. }));
        let text = err.to_string();
        assert!(text.contains("port"));
        assert!(text.contains("70000"));
    }

    #[test]
    fn test_signed_or_padded_ports_rejected() {
        for port in ["+80", "-1", "8 0", "0x50", ""] {
            let result = parse(
                &headers(&[
                    ("x-server-addr", "127.0.0.1"),
                    ("x-server-port", port),
                    ("x-remote-addr", "alpha"),
                ]),
                &table(),
            );
            assert!(
                matches!(result, Err(ParseError::InvalidPort { .. })),
                "port {:?} should be rejected",
                port
            );
        }

        // Surrounding whitespace is trimmed, leading zeros are digits
        let route = parse(
            &headers(&[
                ("x-server-addr", "127.0.0.1"),
                ("x-server-port", " 0080 "),
                ("x-remote-addr", "alpha"),
            ]),
            &table(),
        )
        .unwrap();
        assert_eq!(route.target.port, 80);
    }

    #[test]
    fn test_unknown_or_missing_caller() {
        let table = table();
        assert_eq!(
            parse(
                &headers(&[("x-server-addr", "h"), ("x-server-port", "1"), ("x-remote-addr", "mallory")]),
                &table
            ),
            Err(ParseError::UnknownPeer("mallory".to_string()))
        );
        assert!(matches!(
            parse(&headers(&[("x-server-addr", "h"), ("x-server-port", "1")]), &table),
            Err(ParseError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_provenance_values() {
        let table = table();
        let route = RouteRequest {
            target: Target::new("10.0.0.2", 9000),
            caller_peer: "alpha".to_string(),
        };
        let provenance = ProvenanceHeaders::for_route(&route, &table).unwrap();
        assert_eq!(provenance.caller(), "alpha:agent");
        assert_eq!(provenance.callee(), "beta:daemon");

        let unknown = RouteRequest {
            target: Target::new("192.168.0.9", 80),
            caller_peer: "alpha".to_string(),
        };
        let provenance = ProvenanceHeaders::for_route(&unknown, &table).unwrap();
        assert_eq!(provenance.callee(), "192.168.0.9:80:daemon");
    }

    #[test]
    fn test_provenance_overwrites_and_rejects_empty() {
        let mut map = headers(&[("x-caller", "forged"), ("x-callee", "forged")]);
        ProvenanceHeaders::new("alpha", "beta").unwrap().apply(&mut map);
        assert_eq!(map.get_all("x-caller").iter().count(), 1);
        assert_eq!(map.get("x-caller").unwrap(), "alpha:agent");
        assert_eq!(map.get("x-callee").unwrap(), "beta:daemon");

        assert_eq!(
            ProvenanceHeaders::new(" ", "beta"),
            Err(ParseError::EmptyIdentity(CALLER_HEADER))
        );
    }
}
