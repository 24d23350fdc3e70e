//! Client identity resolution.
//!
//! Works out which bucket a request is charged against. Forwarding headers are
//! only consulted when the deployment opts in and names exactly one header;
//! otherwise a client could pick its own address and rotate past a per-address
//! budget.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::config::IdentityConfig;
use crate::error::{Result, TurnstileError};

/// Prefix for keys derived from a caller-supplied credential.
pub const CREDENTIAL_PREFIX: &str = "key:";
/// Prefix for keys derived from a network address.
pub const PEER_PREFIX: &str = "ip:";

const UNKNOWN_PEER: &str = "unknown";

/// The key a request is rate limited under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey(String);

impl LimiterKey {
    pub fn credential(credential: &str) -> Self {
        Self(format!("{}{}", CREDENTIAL_PREFIX, credential))
    }

    pub fn peer(addr: IpAddr) -> Self {
        Self(format!("{}{}", PEER_PREFIX, addr))
    }

    /// Shared key for requests whose peer address is not known.
    pub fn unknown_peer() -> Self {
        Self(format!("{}{}", PEER_PREFIX, UNKNOWN_PEER))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_credential(&self) -> bool {
        self.0.starts_with(CREDENTIAL_PREFIX)
    }

    /// A form of the key that is safe to log.
    pub fn redacted(&self) -> String {
        if self.is_credential() {
            format!("{}{}", CREDENTIAL_PREFIX, fingerprint(&self.0))
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LimiterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What the resolver gets to see of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    credential: Option<String>,
    peer_addr: Option<IpAddr>,
    headers: Vec<(String, String)>,
}

impl RequestMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// An already-authenticated credential, such as an API key.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Address of the transport-level peer.
    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref().filter(|c| !c.is_empty())
    }

    pub fn peer_addr(&self) -> Option<IpAddr> {
        self.peer_addr
    }
}

/// Derives limiter keys from request metadata.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trusted_header: Option<String>,
}

impl IdentityResolver {
    /// A resolver that never trusts forwarding headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver that trusts `header` for the client address.
    pub fn trusting(header: &str) -> Result<Self> {
        let header = header.trim();
        if header.is_empty() {
            return Err(TurnstileError::Config(
                "trusted header name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            trusted_header: Some(header.to_string()),
        })
    }

    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        if !config.trust_proxy_headers {
            return Ok(Self::new());
        }
        match config.trusted_header_name.as_deref() {
            Some(header) => Self::trusting(header),
            None => Err(TurnstileError::Config(
                "trust_proxy_headers requires trusted_header_name".to_string(),
            )),
        }
    }

    pub fn trusted_header(&self) -> Option<&str> {
        self.trusted_header.as_deref()
    }

    /// The key a request is charged against.
    ///
    /// A credential wins; otherwise the effective peer address is used.
    pub fn resolve(&self, request: &RequestMetadata) -> LimiterKey {
        match request.credential() {
            Some(credential) => LimiterKey::credential(credential),
            None => self.peer_key(request),
        }
    }

    /// Every key the request should be checked against, most specific first.
    ///
    /// Always ends with the peer key, so rotating credentials from one address
    /// still draws on that address's budget.
    pub fn resolve_all(&self, request: &RequestMetadata) -> Vec<LimiterKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(credential) = request.credential() {
            keys.push(LimiterKey::credential(credential));
        }
        keys.push(self.peer_key(request));
        keys
    }

    /// Key for the effective peer address.
    pub fn peer_key(&self, request: &RequestMetadata) -> LimiterKey {
        match self.effective_peer(request) {
            Some(addr) => LimiterKey::peer(addr),
            None => LimiterKey::unknown_peer(),
        }
    }

    /// The client address after applying the proxy trust policy.
    pub fn effective_peer(&self, request: &RequestMetadata) -> Option<IpAddr> {
        if let Some(header) = self.trusted_header.as_deref() {
            if let Some(addr) = request.header(header).and_then(first_global_addr) {
                trace!(header = %header, addr = %addr, "Using forwarded client address");
                return Some(addr);
            }
        }
        request.peer_addr()
    }
}

/// First globally routable address in a comma-separated forwarding header.
pub fn first_global_addr(value: &str) -> Option<IpAddr> {
    value
        .split(',')
        .filter_map(parse_forwarded_addr)
        .find(is_global)
}

fn parse_forwarded_addr(entry: &str) -> Option<IpAddr> {
    let entry = entry.trim().trim_matches('"');
    if entry.is_empty() {
        return None;
    }
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return Some(addr);
    }
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    entry
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse::<Ipv6Addr>().ok())
        .map(IpAddr::V6)
}

/// Whether an address is reachable on the public internet.
///
/// Private, loopback, link-local, shared, documentation, benchmarking,
/// reserved and multicast ranges are all rejected.
pub fn is_global(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(addr: &Ipv4Addr) -> bool {
    let [a, b, c, _] = addr.octets();
    let shared = a == 100 && (64..=127).contains(&b);
    let protocol_assignments = a == 192 && b == 0 && c == 0;
    let benchmarking = a == 198 && (b == 18 || b == 19);
    let reserved = a >= 240;
    let this_network = a == 0;

    !(addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_documentation()
        || addr.is_broadcast()
        || addr.is_multicast()
        || addr.is_unspecified()
        || shared
        || protocol_assignments
        || benchmarking
        || reserved
        || this_network)
}

fn is_global_v6(addr: &Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_global_v4(&v4);
    }
    let segments = addr.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8;
    let discard_only = segments[0] == 0x0100 && segments[1..4] == [0, 0, 0];

    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        || unique_local
        || link_local
        || documentation
        || discard_only)
}

/// Stable, non-reversible fingerprint of sensitive identity material.
///
/// Truncated SHA-256, short enough for log lines yet stable enough to
/// correlate repeated failures for the same credential.
pub fn fingerprint(secret: &str) -> String {
    if secret.is_empty() {
        return "<empty-token>".to_string();
    }
    let digest = Sha256::digest(secret.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(12);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_credential_takes_precedence() {
        let resolver = IdentityResolver::new();
        let request = RequestMetadata::new()
            .with_credential("abc")
            .with_peer(peer("203.0.113.9"));
        assert_eq!(resolver.resolve(&request).as_str(), "key:abc");
    }

    #[test]
    fn test_empty_credential_is_ignored() {
        let resolver = IdentityResolver::new();
        let request = RequestMetadata::new()
            .with_credential("")
            .with_peer(peer("8.8.4.4"));
        assert_eq!(resolver.resolve(&request).as_str(), "ip:8.8.4.4");
    }

    #[test]
    fn test_peer_address_by_default() {
        let resolver = IdentityResolver::new();
        let request = RequestMetadata::new().with_peer(peer("10.1.2.3"));
        assert_eq!(resolver.resolve(&request).as_str(), "ip:10.1.2.3");
    }

    #[test]
    fn test_missing_peer_shares_unknown_bucket() {
        let resolver = IdentityResolver::new();
        assert_eq!(
            resolver.resolve(&RequestMetadata::new()).as_str(),
            "ip:unknown"
        );
    }

    #[test]
    fn test_untrusted_header_is_ignored() {
        let resolver = IdentityResolver::new();
        let first = RequestMetadata::new()
            .with_peer(peer("192.168.1.10"))
            .with_header("X-Forwarded-For", "8.8.8.8");
        let second = RequestMetadata::new()
            .with_peer(peer("192.168.1.10"))
            .with_header("X-Forwarded-For", "1.1.1.1");

        assert_eq!(resolver.resolve(&first), resolver.resolve(&second));
        assert_eq!(resolver.resolve(&first).as_str(), "ip:192.168.1.10");
    }

    #[test]
    fn test_trusted_header_picks_first_global() {
        let resolver = IdentityResolver::trusting("X-Forwarded-For").unwrap();
        let request = RequestMetadata::new()
            .with_peer(peer("10.0.0.2"))
            .with_header("x-forwarded-for", "127.0.0.1, 8.8.8.8");
        assert_eq!(resolver.effective_peer(&request), Some(peer("8.8.8.8")));
        assert_eq!(resolver.resolve(&request).as_str(), "ip:8.8.8.8");
    }

    #[test]
    fn test_trusted_header_without_global_falls_back() {
        let resolver = IdentityResolver::trusting("X-Real-IP").unwrap();
        let request = RequestMetadata::new()
            .with_peer(peer("10.0.0.2"))
            .with_header("X-Real-IP", "10.9.9.9, 169.254.0.1, garbage");
        assert_eq!(resolver.resolve(&request).as_str(), "ip:10.0.0.2");
    }

    #[test]
    fn test_only_the_named_header_is_trusted() {
        let resolver = IdentityResolver::trusting("X-Real-IP").unwrap();
        let request = RequestMetadata::new()
            .with_peer(peer("10.0.0.2"))
            .with_header("X-Forwarded-For", "8.8.8.8");
        assert_eq!(resolver.resolve(&request).as_str(), "ip:10.0.0.2");
    }

    #[test]
    fn test_resolve_all_includes_peer() {
        let resolver = IdentityResolver::new();
        let request = RequestMetadata::new()
            .with_credential("k1")
            .with_peer(peer("9.9.9.9"));
        let keys: Vec<String> = resolver
            .resolve_all(&request)
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(keys, vec!["key:k1", "ip:9.9.9.9"]);
    }

    #[test]
    fn test_from_config_requires_header_when_trusting() {
        let config = IdentityConfig {
            trust_proxy_headers: true,
            trusted_header_name: None,
            ..IdentityConfig::default()
        };
        assert!(IdentityResolver::from_config(&config).is_err());

        let config = IdentityConfig {
            trust_proxy_headers: false,
            trusted_header_name: Some("X-Forwarded-For".to_string()),
            ..IdentityConfig::default()
        };
        let resolver = IdentityResolver::from_config(&config).unwrap();
        assert_eq!(resolver.trusted_header(), None);
    }

    #[test]
    fn test_trusting_rejects_blank_header() {
        assert!(IdentityResolver::trusting("  ").is_err());
    }

    #[test]
    fn test_parse_forwarded_entries() {
        assert_eq!(parse_forwarded_addr(" 8.8.8.8 "), Some(peer("8.8.8.8")));
        assert_eq!(parse_forwarded_addr("8.8.8.8:443"), Some(peer("8.8.8.8")));
        assert_eq!(
            parse_forwarded_addr("[2606:4700::1111]:443"),
            Some(peer("2606:4700::1111"))
        );
        assert_eq!(
            parse_forwarded_addr("[2606:4700::1111]"),
            Some(peer("2606:4700::1111"))
        );
        assert_eq!(parse_forwarded_addr("unknown"), None);
        assert_eq!(parse_forwarded_addr(""), None);
    }

    #[test]
    fn test_global_ranges() {
        for addr in ["8.8.8.8", "1.1.1.1", "2606:4700::1111", "::ffff:8.8.8.8"] {
            assert!(is_global(&peer(addr)), "{} should be global", addr);
        }
        for addr in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.5.4",
            "192.168.0.1",
            "169.254.1.1",
            "100.64.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "192.0.2.1",
            "198.18.0.1",
            "224.0.0.1",
            "240.0.0.1",
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "2001:db8::1",
            "::ffff:10.0.0.1",
        ] {
            assert!(!is_global(&peer(addr)), "{} should not be global", addr);
        }
    }

    #[test]
    fn test_fingerprint() {
        let token = "super-secret-token";
        let digest = fingerprint(token);
        assert_eq!(digest.len(), 12);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, fingerprint(token));
        assert_ne!(digest, fingerprint("other-token"));
        assert_eq!(fingerprint(""), "<empty-token>");
    }

    #[test]
    fn test_redacted_key_hides_credential() {
        let key = LimiterKey::credential("super-secret-token");
        assert!(!key.redacted().contains("super-secret-token"));
        assert_eq!(LimiterKey::peer(peer("8.8.8.8")).redacted(), "ip:8.8.8.8");
    }
}
