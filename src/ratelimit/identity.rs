//! Client identity resolution.
//!
//! The identity used as the rate-limit key is the client's IP address. When
//! the service sits behind reverse proxies the transport peer is the proxy,
//! so the real client address has to be read from forwarding headers. Those
//! headers are trivially forged by direct clients, which is why they are
//! only consulted when the transport peer is itself a trusted proxy.
//!
//! # Resolution
//!
//! ```text
//!   peer trusted? ──no──▶ peer address
//!        │yes
//!        ▼
//!   for header in priority order (CF-Connecting-IP, X-Real-IP, X-Forwarded-For, ...)
//!        for token in header.split(',')            left to right
//!            strip ":port" (only with a single ':'), unwrap [v6]:port and for=
//!            parse as IP, skip on failure
//!            accept if not a trusted proxy, or if private/loopback
//!        ▼
//!   peer address (port stripped)
//! ```
//!
//! # Configuration
//!
//! Trusted proxies and the whitelist accept exact addresses and CIDR ranges.
//! Entries are parsed once when the resolver is built; any malformed entry
//! fails construction with `InvalidConfiguration`.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use axum::http::{HeaderMap, HeaderName};
use tracing::{debug, trace};

use super::config::RateLimitConfig;
use super::error::{AdmissionError, AdmissionResult};

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation (`10.0.0.0/8`, `fc00::/7`). A bare address is
    /// treated as a single-host range.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let Some((addr, prefix)) = cidr.split_once('/') else {
            let network: IpAddr = cidr.parse().ok()?;
            return Some(Self {
                network,
                prefix_len: max_prefix(&network),
            });
        };

        let network: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;
        if prefix_len > max_prefix(&network) {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

// =============================================================================
// Address Sets
// =============================================================================

/// Union of exact addresses and CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct AddressSet {
    exact: HashSet<IpAddr>,
    ranges: Vec<CidrRange>,
}

impl AddressSet {
    /// Parse a list of IP / CIDR entries.
    ///
    /// `label` names the setting in error messages.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidConfiguration` for any entry that is
    /// neither an IP address nor a valid CIDR range.
    pub fn parse(entries: &[String], label: &str) -> AdmissionResult<Self> {
        let mut set = Self::default();

        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                let range = CidrRange::parse(entry).ok_or_else(|| {
                    AdmissionError::InvalidConfiguration(format!(
                        "invalid CIDR range '{entry}' in {label}"
                    ))
                })?;
                set.ranges.push(range);
            } else {
                let ip: IpAddr = entry.parse().map_err(|_| {
                    AdmissionError::InvalidConfiguration(format!(
                        "invalid IP address '{entry}' in {label}"
                    ))
                })?;
                set.exact.insert(ip.to_canonical());
            }
        }

        Ok(set)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.exact.contains(&ip) || self.ranges.iter().any(|range| range.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.ranges.len()
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Settings for [`IdentityResolver`].
#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub trusted_proxies: Vec<String>,
    pub ip_headers: Vec<String>,
    pub whitelist: Vec<String>,
}

impl From<&RateLimitConfig> for IdentityConfig {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            trusted_proxies: config.trusted_proxies.clone(),
            ip_headers: config.ip_headers.clone(),
            whitelist: config.whitelist.clone(),
        }
    }
}

/// Resolves the client address used as the rate-limit key.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    headers: Vec<HeaderName>,
    trusted: AddressSet,
    whitelist: AddressSet,
}

impl IdentityResolver {
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidConfiguration` if a trusted proxy,
    /// whitelist entry or header name cannot be parsed.
    pub fn new(config: &IdentityConfig) -> AdmissionResult<Self> {
        let headers = config
            .ip_headers
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes()).map_err(|_| {
                    AdmissionError::InvalidConfiguration(format!(
                        "invalid header name '{h}' in RATE_LIMIT_IP_HEADERS"
                    ))
                })
            })
            .collect::<AdmissionResult<Vec<_>>>()?;

        let trusted = AddressSet::parse(&config.trusted_proxies, "RATE_LIMIT_TRUSTED_PROXIES")?;
        let whitelist = AddressSet::parse(&config.whitelist, "RATE_LIMIT_WHITELIST_IPS")?;

        debug!(
            headers = headers.len(),
            trusted_proxies = trusted.len(),
            whitelist = whitelist.len(),
            "Identity resolver configured"
        );

        Ok(Self {
            headers,
            trusted,
            whitelist,
        })
    }

    /// Resolve the identity of a request from its headers and the transport
    /// peer address (`ip`, `ip:port` or `[v6]:port`).
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidIdentity` if neither the headers nor
    /// the peer address yield a parseable IP.
    pub fn get_real_ip(&self, headers: &HeaderMap, remote_addr: &str) -> AdmissionResult<IpAddr> {
        let peer = parse_candidate(remote_addr);

        if let Some(peer_ip) = peer
            && self.trusted.contains(&peer_ip)
        {
            for name in &self.headers {
                let values = headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok());

                for value in values {
                    if let Some(ip) = self.pick_candidate(value) {
                        trace!(header = %name, client_ip = %ip, peer = %peer_ip, "Client IP from forwarding header");
                        return Ok(ip);
                    }
                }
            }
        }

        peer.ok_or_else(|| {
            AdmissionError::InvalidIdentity(format!("unparseable remote address '{remote_addr}'"))
        })
    }

    /// Resolve using a socket address from the connection, if known.
    ///
    /// # Errors
    ///
    /// See [`Self::get_real_ip`].
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> AdmissionResult<IpAddr> {
        let remote = peer.map(|addr| addr.to_string()).unwrap_or_default();
        self.get_real_ip(headers, &remote)
    }

    pub fn is_trusted_proxy(&self, ip: &IpAddr) -> bool {
        self.trusted.contains(ip)
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// First acceptable address in a comma-separated header value.
    fn pick_candidate(&self, value: &str) -> Option<IpAddr> {
        value
            .split(',')
            .filter_map(parse_candidate)
            .find(|ip| !self.trusted.contains(ip) || is_private(ip))
    }
}

/// Parse one header token or remote address into an IP.
///
/// Handles `ip`, `ipv4:port`, `[ipv6]:port`, bare IPv6 (left untouched
/// since it has more than one colon) and RFC 7239 `for=` parameters.
pub fn parse_candidate(token: &str) -> Option<IpAddr> {
    let token = forwarded_for(token.trim()).trim_matches('"').trim();
    if token.is_empty() {
        return None;
    }

    let host = if let Some(rest) = token.strip_prefix('[') {
        rest.split_once(']').map(|(host, _)| host)?
    } else if token.matches(':').count() == 1 {
        token.split_once(':').map(|(host, _)| host)?
    } else {
        token
    };

    host.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// Extract the `for=` parameter of a `Forwarded` element, or return the
/// token unchanged when it carries no parameters.
fn forwarded_for(token: &str) -> &str {
    if !token.contains('=') {
        return token;
    }

    token
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("for"))
        .map(|(_, value)| value.trim())
        .unwrap_or("")
}

/// Loopback, RFC 1918, unique-local and link-local addresses.
pub fn is_private(ip: &IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => {
            let [first, ..] = v6.segments();
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
