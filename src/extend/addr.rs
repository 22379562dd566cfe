use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use std::io;
use std::net::{IpAddr, Ipv4Addr};

/// Non-loopback IPv4 addresses of the local network interfaces.
pub fn local_ipv4() -> io::Result<Vec<Ipv4Addr>> {
    let network_interfaces = NetworkInterface::show().map_err(io::Error::other)?;
    let mut addrs = Vec::new();
    for iface in network_interfaces {
        for addr in iface.addr {
            if let IpAddr::V4(ip) = addr.ip() {
                if !ip.is_loopback() && !ip.is_unspecified() && !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }
    }
    Ok(addrs)
}

/// Configured addresses, or the local IPv4 interfaces when none are set.
pub(crate) fn advertised_or_local(configured: &[IpAddr]) -> Vec<IpAddr> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    match local_ipv4() {
        Ok(addrs) => addrs.into_iter().map(IpAddr::V4).collect(),
        Err(e) => {
            log::warn!("local_ipv4 {e:?}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_addresses_win() {
        let configured = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        assert_eq!(advertised_or_local(&configured), configured);
    }

    #[test]
    fn no_loopback_in_local() {
        for ip in local_ipv4().unwrap() {
            assert!(!ip.is_loopback());
        }
    }
}
