//! IP geolocation seam and prefix derivation.

use std::net::IpAddr;

/// Resolves an address to country code(s). The server core only records the
/// result; wiring a real GeoIP database is a collaborator concern.
pub trait GeoLookup: Send + Sync {
    fn country(&self, ip: IpAddr) -> String;

    fn country_all(&self, ip: IpAddr) -> String {
        self.country(ip)
    }
}

/// Passive default: resolves nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn country(&self, _ip: IpAddr) -> String {
        String::new()
    }
}

/// Collapse an IPv4 address to its /24 prefix as a decimal string, last
/// octet zeroed. Used as the grouping key for bans and rate decisions.
/// Non-IPv4 addresses collapse to `"0"`.
pub fn ipv4_prefix24(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            (((a as u64) << 24) + ((b as u64) << 16) + ((c as u64) << 8)).to_string()
        }
        IpAddr::V6(_) => "0".to_string(),
    }
}
