//! Fuzz client identity resolution.
//!
//! Forwarding headers and peer addresses are attacker controlled, so the
//! resolver must never panic and must only ever return an address that
//! came from the peer or from a header a trusted peer supplied.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_identity -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use axum::http::{HeaderMap, HeaderValue};
use libfuzzer_sys::fuzz_target;
use tempdrop::ratelimit::identity::parse_candidate;
use tempdrop::ratelimit::{CidrRange, IdentityConfig, IdentityResolver};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    remote_addr: &'a str,
    forwarded_for: &'a str,
    real_ip: &'a str,
    cidr: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    let _ = parse_candidate(input.forwarded_for);

    if let Some(range) = CidrRange::parse(input.cidr)
        && let Some(ip) = parse_candidate(input.remote_addr)
    {
        let _ = range.contains(&ip);
    }

    let config = IdentityConfig {
        trusted_proxies: vec!["127.0.0.1".to_string(), "10.0.0.0/8".to_string()],
        ip_headers: vec!["X-Real-IP".to_string(), "X-Forwarded-For".to_string()],
        whitelist: Vec::new(),
    };
    let Ok(resolver) = IdentityResolver::new(&config) else {
        return;
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(input.forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(input.real_ip) {
        headers.insert("x-real-ip", value);
    }

    if let Ok(ip) = resolver.get_real_ip(&headers, input.remote_addr) {
        let peer = parse_candidate(input.remote_addr);
        let from_peer = peer == Some(ip);
        let peer_trusted = peer.is_some_and(|p| resolver.is_trusted_proxy(&p));
        assert!(from_peer || peer_trusted);
    }
});
