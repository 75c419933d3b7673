//! picks the interfaces and source addresses a scan goes out on
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipam_core::pnet::datalink::NetworkInterface;

/// an interface and the address selected on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected<A> {
    pub iface: NetworkInterface,
    pub addr: A,
}

/// Source addresses for one scan cycle. The first match of each kind wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sources {
    pub v4: Option<Selected<Ipv4Addr>>,
    pub v6_link_local: Option<Selected<Ipv6Addr>>,
    pub v6_global: Option<Selected<Ipv6Addr>>,
}

impl Sources {
    /// walk the up, non-loopback interfaces in order until every kind is found
    pub fn select(interfaces: &[NetworkInterface]) -> Self {
        let mut found = Sources::default();
        'outer: for iface in interfaces
            .iter()
            .filter(|i| i.is_up() && !i.is_loopback())
        {
            for net in &iface.ips {
                match net.ip() {
                    IpAddr::V4(ip) if found.v4.is_none() && is_global_v4(ip) => {
                        found.v4 = Some(Selected {
                            iface: iface.clone(),
                            addr: ip,
                        });
                    }
                    IpAddr::V6(ip) if found.v6_link_local.is_none() && is_link_local_v6(ip) => {
                        found.v6_link_local = Some(Selected {
                            iface: iface.clone(),
                            addr: ip,
                        });
                    }
                    IpAddr::V6(ip) if found.v6_global.is_none() && is_global_v6(ip) => {
                        found.v6_global = Some(Selected {
                            iface: iface.clone(),
                            addr: ip,
                        });
                    }
                    _ => {}
                }
                if found.is_complete() {
                    break 'outer;
                }
            }
        }
        found
    }

    /// v6 scans prefer the link-local source
    pub fn v6(&self) -> Option<&Selected<Ipv6Addr>> {
        self.v6_link_local.as_ref().or(self.v6_global.as_ref())
    }

    fn is_complete(&self) -> bool {
        self.v4.is_some() && self.v6_link_local.is_some() && self.v6_global.is_some()
    }
}

fn is_global_v4(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast())
}

fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// any unicast address beyond the link, unique local (fc00::/7) included
fn is_global_v6(ip: Ipv6Addr) -> bool {
    !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || is_link_local_v6(ip))
}

#[cfg(test)]
mod tests {
    use ipam_core::pnet::ipnetwork::IpNetwork;

    use super::*;

    const UP: u32 = 1;
    const LOOPBACK: u32 = 8;

    fn iface(name: &str, index: u32, flags: u32, ips: &[(&str, u8)]) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            description: String::new(),
            index,
            mac: None,
            ips: ips
                .iter()
                .map(|(ip, len)| IpNetwork::new(ip.parse().unwrap(), *len).unwrap())
                .collect(),
            flags,
        }
    }

    #[test]
    fn first_of_each_kind() {
        let ifaces = vec![
            iface("lo", 1, UP | LOOPBACK, &[("127.0.0.1", 8), ("::1", 128)]),
            iface("down0", 2, 0, &[("10.9.9.9", 24)]),
            iface("eth0", 3, UP, &[("169.254.1.1", 16), ("192.168.1.10", 24), ("fe80::1", 64)]),
            iface("eth1", 4, UP, &[("10.0.0.5", 8), ("2001:db8::5", 64), ("fe80::2", 64)]),
        ];
        let found = Sources::select(&ifaces);
        let v4 = found.v4.as_ref().unwrap();
        assert_eq!(v4.iface.name, "eth0");
        assert_eq!(v4.addr, "192.168.1.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(found.v6_link_local.as_ref().unwrap().iface.name, "eth0");
        assert_eq!(found.v6_global.as_ref().unwrap().iface.name, "eth1");
        assert_eq!(found.v6().unwrap().addr, "fe80::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn global_v6_is_the_fallback() {
        let ifaces = vec![iface("eth0", 2, UP, &[("2001:db8::7", 64)])];
        let found = Sources::select(&ifaces);
        assert!(found.v4.is_none());
        assert_eq!(found.v6().unwrap().addr, "2001:db8::7".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn unique_local_counts_as_global() {
        let ifaces = vec![iface(
            "eth0",
            2,
            UP,
            &[("::", 128), ("ff02::1", 128), ("fe80::9", 64), ("fd00:1::5", 64)],
        )];
        let found = Sources::select(&ifaces);
        assert_eq!(
            found.v6_global.unwrap().addr,
            "fd00:1::5".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            found.v6_link_local.unwrap().addr,
            "fe80::9".parse::<Ipv6Addr>().unwrap()
        );
    }
}
