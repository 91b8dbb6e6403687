// SPDX-License-Identifier: Apache-2.0

// hardshare daemon — shared wire protocol and data model.

pub mod error;
pub mod wire;
pub mod workspace;

pub use error::{Error, Result};
pub use wire::{Command, Frame, PROTOCOL_VERSION};
pub use workspace::{ConnType, InstanceStatus, Provider, TunnelHubAssociation, WorkspaceDescriptor};

/// Format a host:port address, properly handling IPv6 literal addresses.
///
/// # Examples
/// ```
/// use hardshare_common::format_host_port;
///
/// assert_eq!(format_host_port("127.0.0.1", 8080), "127.0.0.1:8080");
/// assert_eq!(format_host_port("example.com", 443), "example.com:443");
/// assert_eq!(format_host_port("::1", 22), "[::1]:22");
/// ```
pub fn format_host_port(host: &str, port: u16) -> String {
    use std::net::IpAddr;

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Whether `host` parses as a loopback IP address. A hostname that
/// doesn't parse as an IP literal is never considered loopback here —
/// resolving it is not this layer's concern.
///
/// # Examples
/// ```
/// use hardshare_common::is_loopback;
///
/// assert!(is_loopback("127.0.0.1"));
/// assert!(is_loopback("::1"));
/// assert!(!is_loopback("10.0.0.5"));
/// assert!(!is_loopback("hub.rerobots.net"));
/// ```
pub fn is_loopback(host: &str) -> bool {
    host.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ipv4_without_brackets() {
        assert_eq!(format_host_port("127.0.0.1", 22), "127.0.0.1:22");
    }

    #[test]
    fn formats_ipv6_with_brackets() {
        assert_eq!(format_host_port("::1", 22), "[::1]:22");
    }

    #[test]
    fn formats_hostname_without_brackets() {
        assert_eq!(
            format_host_port("hub.rerobots.net", 2210),
            "hub.rerobots.net:2210"
        );
    }

    #[test]
    fn loopback_ipv4_and_ipv6_are_detected() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
    }

    #[test]
    fn routable_address_is_not_loopback() {
        assert!(!is_loopback("10.0.0.5"));
    }

    #[test]
    fn hostname_is_not_loopback() {
        assert!(!is_loopback("hub.rerobots.net"));
    }
}
