use crate::common::constants::SOCKS_AUTH_NO_ACCEPTABLE_METHODS;
use anyhow::Result;
use std::net::SocketAddr;
use tokio::net;

/// Resolves a `host:port` string to a socket address.
pub async fn resolve_addr<S: Into<String>>(addr: S) -> Result<SocketAddr> {
    let addr: String = addr.into();

    // First, try to parse address as socket address.
    if let Ok(addr) = addr.parse() {
        return Ok(addr);
    }

    // Otherwise, address is probably a domain name.
    let addresses: Vec<SocketAddr> = net::lookup_host(addr).await?.collect();
    match addresses[..] {
        [first, ..] => Ok(first),
        [] => bail!("Domain name didn't resolve to an IP address."),
    }
}

/// Picks the first offered authentication method that is also supported,
/// 0xFF if there is none.
pub fn select_method(
    offered: &[u8],
    supported: &[u8],
) -> u8 {
    for method in offered {
        if supported.contains(method) {
            return *method;
        }
    }

    SOCKS_AUTH_NO_ACCEPTABLE_METHODS
}
