//! Connection identifiers.

use std::fmt;
use std::net::IpAddr;

/// A connection endpoint.
pub type Endpoint = (IpAddr, u16);

/// A canonical, direction-insensitive 5-tuple.
///
/// The two endpoints are ordered lexicographically over `(ip, port)` so both
/// directions of a conversation hash to the same key. The original direction
/// observed on flow creation is kept by the flow entry, not by the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Lexicographically lesser endpoint.
    pub ep1: Endpoint,
    /// Lexicographically greater endpoint.
    pub ep2: Endpoint,
    /// Transport protocol tag (e.g. `TCP`, `UDP`, `ICMP`).
    pub protocol: String,
}

impl FlowKey {
    /// Builds the canonical key for a packet observed from `src` to `dst`.
    pub fn new(src: Endpoint, dst: Endpoint, protocol: &str) -> Self {
        let (ep1, ep2) = if src <= dst { (src, dst) } else { (dst, src) };
        FlowKey {
            ep1,
            ep2,
            protocol: protocol.to_string(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} <> {}:{}",
            self.protocol, self.ep1.0, self.ep1.1, self.ep2.0, self.ep2.1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(ip: &str, port: u16) -> Endpoint {
        (ip.parse().unwrap(), port)
    }

    #[test]
    fn key_is_direction_insensitive() {
        let a = ep("10.0.0.1", 5555);
        let b = ep("10.0.0.2", 80);
        assert_eq!(FlowKey::new(a, b, "TCP"), FlowKey::new(b, a, "TCP"));
    }

    #[test]
    fn key_distinguishes_protocols() {
        let a = ep("10.0.0.1", 53);
        let b = ep("10.0.0.2", 40000);
        assert_ne!(FlowKey::new(a, b, "TCP"), FlowKey::new(a, b, "UDP"));
    }

    #[test]
    fn key_orders_same_ip_by_port() {
        let a = ep("10.0.0.1", 9000);
        let b = ep("10.0.0.1", 80);
        let key = FlowKey::new(a, b, "TCP");
        assert_eq!(key.ep1, b);
        assert_eq!(key.ep2, a);
    }

    #[test]
    fn key_mixes_v4_and_v6() {
        let a = ep("::1", 80);
        let b = ep("127.0.0.1", 80);
        assert_eq!(FlowKey::new(a, b, "TCP"), FlowKey::new(b, a, "TCP"));
    }
}
