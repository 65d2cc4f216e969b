//! Validated connection URIs (`tcp://127.0.0.1:35216`, `tcp://[::1%en0]:35216`).
//!
//! An [`Address`] is a value type: equality, ordering and hashing are all
//! defined over its normalized URI string, never over the individual parsed
//! components, so two addresses that round-trip to the same URI are the
//! same address no matter how they were constructed.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

pub const WILDCARD: &str = "*";
const SCHEME_SEPARATOR: &str = "://";

/// The transport a connection uri names.
///
/// Only [`Protocol::Tcp`] has a working endpoint in this crate; `LoRa` is
/// carried so addresses and configuration stay transport agnostic even
/// though no LoRa transport is implemented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    LoRa,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::LoRa => "lora",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Protocol::Tcp),
            "lora" => Some(Protocol::LoRa),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scheme())
    }
}

/// The parsed `host:port` (or `[ipv6%scope]:port`) pieces of an address.
///
/// `host` retains brackets for IPv6 so that `format!("{host}:{port}")`
/// round-trips to a valid authority string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketComponents {
    pub host: String,
    pub port_str: String,
    pub port: u16,
}

/// A `(protocol, uri)` value type.
///
/// # Example
///
/// ```
/// use mesh_codec::address::{Address, Protocol};
///
/// let address = Address::parse(Protocol::Tcp, "127.0.0.1:35216").unwrap();
/// assert_eq!(address.uri(), "tcp://127.0.0.1:35216");
/// assert_eq!(address.scheme(), "tcp");
/// assert_eq!(address.authority(), "127.0.0.1:35216");
/// ```
#[derive(Debug, Clone)]
pub struct Address {
    protocol: Protocol,
    uri: String,
}

impl Address {
    /// Parses a uri of the form `<scheme>://<authority>`, auto-prepending
    /// `scheme` when omitted. Rejects whitespace, out-of-range ports and a
    /// scheme that disagrees with `protocol`.
    pub fn parse(protocol: Protocol, raw: &str) -> Result<Self, Error> {
        if raw.chars().any(|c| c.is_whitespace()) {
            return Err(Error::WhitespaceInUri);
        }

        let (scheme, authority) = match raw.find(SCHEME_SEPARATOR) {
            Some(idx) => (&raw[..idx], &raw[idx + SCHEME_SEPARATOR.len()..]),
            None => (protocol.scheme(), raw),
        };

        if !scheme.eq_ignore_ascii_case(protocol.scheme()) {
            return Err(Error::InvalidScheme);
        }

        if authority.is_empty() {
            return Err(Error::InvalidAuthority);
        }

        let components = parse_authority(authority)?;
        let uri = format!(
            "{}://{}:{}",
            protocol.scheme(),
            components.host,
            components.port_str
        );

        Ok(Self { protocol, uri })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> &str {
        self.protocol.scheme()
    }

    pub fn authority(&self) -> &str {
        &self.uri[self.protocol.scheme().len() + SCHEME_SEPARATOR.len()..]
    }

    /// Extracts `(host, port_str, port)`, retaining IPv6 brackets in `host`.
    pub fn socket_components(&self) -> Result<SocketComponents, Error> {
        parse_authority(self.authority())
    }

    pub fn is_valid(&self) -> bool {
        parse_authority(self.authority()).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uri.cmp(&other.uri)
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

/// An [`Address`] that additionally names the local interface it is bound
/// to. A wildcard host (`*`) is resolved against that interface at
/// construction time.
#[derive(Debug, Clone)]
pub struct BindingAddress {
    address: Address,
    interface: String,
}

impl BindingAddress {
    pub fn new(protocol: Protocol, raw: &str, interface: &str) -> Result<Self, Error> {
        let resolved = if authority_host(raw)? == WILDCARD {
            raw.replacen(WILDCARD, interface, 1)
        } else {
            raw.to_string()
        };

        Ok(Self {
            address: Address::parse(protocol, &resolved)?,
            interface: interface.to_string(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

/// The origin a [`RemoteAddress`] was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Network,
    Cache,
    Invalid,
}

/// An [`Address`] carrying a bootstrap-suitability flag and its origin.
#[derive(Debug, Clone)]
pub struct RemoteAddress {
    address: Address,
    bootstrapable: bool,
    origin: Origin,
}

impl RemoteAddress {
    pub fn new(address: Address, bootstrapable: bool, origin: Origin) -> Self {
        Self {
            address,
            bootstrapable,
            origin,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn bootstrapable(&self) -> bool {
        self.bootstrapable
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }
}

fn authority_host(raw: &str) -> Result<String, Error> {
    let authority = match raw.find(SCHEME_SEPARATOR) {
        Some(idx) => &raw[idx + SCHEME_SEPARATOR.len()..],
        None => raw,
    };

    Ok(parse_authority(authority)?.host)
}

/// Parses `host:port` or `[ipv6%scope]:port`, validating the port range.
///
/// # Example
///
/// ```
/// use mesh_codec::address::parse_authority;
///
/// let components = parse_authority("[::1%en0]:35216").unwrap();
/// assert_eq!(components.host, "[::1%en0]");
/// assert_eq!(components.port, 35216);
/// ```
pub fn parse_authority(authority: &str) -> Result<SocketComponents, Error> {
    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(Error::InvalidAuthority)?;
        let host = &authority[..close + 2];
        let tail = &rest[close + 1..];
        let port = tail.strip_prefix(':').ok_or(Error::InvalidAuthority)?;
        (host.to_string(), port.to_string())
    } else {
        let idx = authority.rfind(':').ok_or(Error::InvalidAuthority)?;
        (authority[..idx].to_string(), authority[idx + 1..].to_string())
    };

    if host.is_empty() || port_str.is_empty() {
        return Err(Error::InvalidAuthority);
    }

    let port: u16 = port_str.parse().map_err(|_| Error::InvalidPort)?;
    if port == 0 {
        return Err(Error::PortOutOfRange);
    }

    Ok(SocketComponents {
        host,
        port_str,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ipv4() {
        let address = Address::parse(Protocol::Tcp, "tcp://127.0.0.1:35216").unwrap();
        assert_eq!(address.uri(), "tcp://127.0.0.1:35216");
        let components = address.socket_components().unwrap();
        assert_eq!(components.host, "127.0.0.1");
        assert_eq!(components.port, 35216);
    }

    #[test]
    fn auto_prepends_scheme() {
        let address = Address::parse(Protocol::Tcp, "127.0.0.1:35216").unwrap();
        assert_eq!(address.uri(), "tcp://127.0.0.1:35216");
    }

    #[test]
    fn rejects_whitespace() {
        assert!(matches!(
            Address::parse(Protocol::Tcp, "tcp:// 127.0.0.1:1"),
            Err(Error::WhitespaceInUri)
        ));
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(matches!(
            Address::parse(Protocol::Tcp, "127.0.0.1:0"),
            Err(Error::PortOutOfRange)
        ));
    }

    #[test]
    fn wildcard_resolves_against_interface() {
        let binding = BindingAddress::new(Protocol::Tcp, "*:35216", "0.0.0.0").unwrap();
        assert_eq!(binding.address().uri(), "tcp://0.0.0.0:35216");
        assert_eq!(binding.interface(), "0.0.0.0");
    }

    #[test]
    fn ipv6_keeps_brackets() {
        let address = Address::parse(Protocol::Tcp, "[::1]:35216").unwrap();
        assert_eq!(address.socket_components().unwrap().host, "[::1]");
    }

    #[test]
    fn ordering_and_hash_follow_uri() {
        use std::collections::HashSet;

        let a = Address::parse(Protocol::Tcp, "127.0.0.1:1").unwrap();
        let b = Address::parse(Protocol::Tcp, "127.0.0.1:2").unwrap();
        assert!(a < b);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&a));
        assert!(!set.contains(&b));
    }
}
