//! Canonical peer priority (BEP-40).
//!
//! Gives every (local, remote) address pair a deterministic priority
//! both ends agree on, used here as an eviction tiebreak. Closer
//! addresses keep more of their bytes unmasked, biasing the swarm
//! toward topologically near peers.

use std::net::{IpAddr, SocketAddr};

pub fn bep40_priority(a: SocketAddr, b: SocketAddr) -> u32 {
    match (a.ip(), b.ip()) {
        (IpAddr::V4(x), IpAddr::V4(y)) => {
            if x == y {
                return crc_pair(&a.port().to_be_bytes(), &b.port().to_be_bytes());
            }
            let xo = x.octets();
            let yo = y.octets();
            let mask: [u8; 4] = if xo[..3] == yo[..3] {
                [0xff, 0xff, 0xff, 0xff]
            } else if xo[..2] == yo[..2] {
                [0xff, 0xff, 0xff, 0x55]
            } else {
                [0xff, 0xff, 0x55, 0x55]
            };
            let mx = apply_mask(&xo, &mask);
            let my = apply_mask(&yo, &mask);
            crc_pair(&mx, &my)
        }
        (IpAddr::V6(x), IpAddr::V6(y)) => {
            if x == y {
                return crc_pair(&a.port().to_be_bytes(), &b.port().to_be_bytes());
            }
            crc_pair(&x.octets(), &y.octets())
        }
        // Mixed families never share a masked prefix; hash the raw
        // address bytes.
        (x, y) => crc_pair(&ip_bytes(x), &ip_bytes(y)),
    }
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn apply_mask(octets: &[u8; 4], mask: &[u8; 4]) -> [u8; 4] {
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = octets[i] & mask[i];
    }
    out
}

/// CRC32-C over the two operands in sorted order, so both endpoints
/// compute the same value.
fn crc_pair(a: &[u8], b: &[u8]) -> u32 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = Vec::with_capacity(lo.len() + hi.len());
    buf.extend_from_slice(lo);
    buf.extend_from_slice(hi);
    crc32c::crc32c(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn distant_v4_pair_matches_reference_vector() {
        let p = bep40_priority(addr("123.213.32.10:0"), addr("98.76.54.32:0"));
        assert_eq!(p, 0xec2d_7224);
    }

    #[test]
    fn symmetric() {
        let a = addr("1.2.3.4:6881");
        let b = addr("5.6.7.8:51413");
        assert_eq!(bep40_priority(a, b), bep40_priority(b, a));
    }

    #[test]
    fn same_ip_uses_ports() {
        let a = addr("1.2.3.4:1000");
        let b = addr("1.2.3.4:2000");
        let c = addr("1.2.3.4:3000");
        assert_ne!(bep40_priority(a, b), bep40_priority(a, c));
    }

    #[test]
    fn same_subnet_keeps_more_bits() {
        // Same /24 hashes the full addresses; a different pair in the
        // same /24 must produce a different priority.
        let p1 = bep40_priority(addr("10.0.0.1:0"), addr("10.0.0.2:0"));
        let p2 = bep40_priority(addr("10.0.0.1:0"), addr("10.0.0.3:0"));
        assert_ne!(p1, p2);
    }
}
