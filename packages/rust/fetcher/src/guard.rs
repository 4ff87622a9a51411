//! SSRF protection for user-supplied bookmark URLs.

use std::net::IpAddr;

use markwise_shared::{MarkwiseError, Result};
use url::Url;

/// Parse `raw` and reject URLs no engine should ever be pointed at.
///
/// Non-http(s) schemes are always rejected. Loopback, private and
/// link-local hosts are rejected unless `allow_private` is set.
pub fn check_url(raw: &str, allow_private: bool) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| MarkwiseError::validation(format!("invalid URL '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(MarkwiseError::validation(format!(
                "unsupported URL scheme '{other}': {raw}"
            )));
        }
    }

    if !allow_private && is_private_target(&url) {
        return Err(MarkwiseError::validation(format!(
            "refusing to fetch private or local address: {raw}"
        )));
    }

    Ok(url)
}

fn is_private_target(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            let host = host.to_ascii_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
