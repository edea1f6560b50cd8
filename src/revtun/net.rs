use std::{
    borrow::Cow,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

/// Address relayed streams are delivered to. Local services are always
/// reached over IPv4 loopback.
pub fn local_target(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Normalize a broker host for display and dialing.
///
/// Config files often carry IPv6 literals with or without brackets. Tokio
/// resolves `(host, port)` pairs from the bare form, so brackets are stripped
/// here; `broker_authority` puts them back when rendering `host:port`.
pub fn normalize_host(host: &str) -> Cow<'_, str> {
    let host = host.trim();
    match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(inner) => Cow::Owned(inner.to_string()),
        None => Cow::Borrowed(host),
    }
}

pub fn broker_authority(host: &str, port: u16) -> String {
    let host = normalize_host(host);
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_target_is_loopback() {
        assert_eq!(local_target(8080).to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn normalize_host_strips_brackets_and_whitespace() {
        assert_eq!(normalize_host(" [::1] ").as_ref(), "::1");
        assert_eq!(normalize_host(" example.com ").as_ref(), "example.com");
    }

    #[test]
    fn broker_authority_brackets_ipv6() {
        assert_eq!(broker_authority("::1", 4100), "[::1]:4100");
        assert_eq!(broker_authority("[::1]", 4100), "[::1]:4100");
        assert_eq!(broker_authority("10.0.0.1", 4100), "10.0.0.1:4100");
    }
}
