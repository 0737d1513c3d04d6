//! Local addresses advertised in Via and Contact.
//!
//! One interface per transport (UDP first, TCP second). When a firewall
//! address is configured it replaces the local address for peers that are
//! not on a private network.

use std::net::{IpAddr, UdpSocket};

use sipua_sip_core::Transport;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub transport: Transport,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub udp: NetInterface,
    pub tcp: NetInterface,
    pub firewall_ip: Option<String>,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            udp: NetInterface {
                transport: Transport::Udp,
                ip: "127.0.0.1".to_string(),
                port: 5060,
            },
            tcp: NetInterface {
                transport: Transport::Tcp,
                ip: "127.0.0.1".to_string(),
                port: 5060,
            },
            firewall_ip: None,
        }
    }
}

impl Network {
    pub fn interface(&self, transport: Transport) -> &NetInterface {
        match transport {
            Transport::Udp => &self.udp,
            _ => &self.tcp,
        }
    }

    pub fn interface_mut(&mut self, transport: Transport) -> &mut NetInterface {
        match transport {
            Transport::Udp => &mut self.udp,
            _ => &mut self.tcp,
        }
    }

    /// Address to advertise to `peer_host` over `transport`.
    pub fn advertised_ip(&self, transport: Transport, peer_host: &str) -> &str {
        match &self.firewall_ip {
            Some(fw) if !fw.is_empty() && is_public_address(peer_host) => fw,
            _ => &self.interface(transport).ip,
        }
    }

    pub fn port(&self, transport: Transport) -> u16 {
        self.interface(transport).port
    }

    /// Advertise `ip`/`port` instead of the local address. An empty `ip`
    /// switches masquerading off; a zero `port` keeps the current one.
    pub fn masquerade_contact(&mut self, ip: &str, port: u16) {
        if ip.is_empty() {
            self.firewall_ip = None;
        } else {
            self.firewall_ip = Some(ip.to_string());
        }
        if port > 0 {
            self.udp.port = port;
        }
        debug!("masquerading contact as {:?}:{}", self.firewall_ip, self.udp.port);
    }
}

/// False for RFC 1918 and link-local IPv4 hosts, true for anything else
/// (including names).
pub fn is_public_address(host: &str) -> bool {
    let Ok(IpAddr::V4(v4)) = host.parse::<IpAddr>() else {
        return true;
    };
    let [a, b, _, _] = v4.octets();
    !(a == 10 || (a == 192 && b == 168) || (a == 172 && (16..=31).contains(&b)) || (a == 169 && b == 254))
}

/// Source address the OS would pick to reach the outside world.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn guess_local_ip(ipv6: bool) -> Option<String> {
    let (bind, target) = if ipv6 {
        ("[::]:0", "[2001:4860:4860::8888]:53")
    } else {
        ("0.0.0.0:0", "8.8.8.8:53")
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ranges() {
        for host in ["10.1.2.3", "192.168.0.7", "172.16.0.1", "172.31.255.1", "169.254.1.1"] {
            assert!(!is_public_address(host), "{}", host);
        }
        for host in ["172.32.0.1", "8.8.8.8", "sip.example.com"] {
            assert!(is_public_address(host), "{}", host);
        }
    }

    #[test]
    fn test_firewall_ip_only_for_public_peers() {
        let mut net = Network::default();
        net.masquerade_contact("203.0.113.5", 0);
        assert_eq!(net.advertised_ip(Transport::Udp, "198.51.100.1"), "203.0.113.5");
        assert_eq!(net.advertised_ip(Transport::Udp, "192.168.1.1"), "127.0.0.1");
        net.masquerade_contact("", 5070);
        assert_eq!(net.firewall_ip, None);
        assert_eq!(net.port(Transport::Udp), 5070);
    }
}
