use std::net::IpAddr;

use piecework_core::Id20;
use sha1w::ISha1;

/// Size of the allowed fast set offered to fast-extension peers.
pub const ALLOWED_FAST_COUNT: usize = 10;

/// Canonical BEP 6 allowed fast set for an IPv4 peer. IPv6 peers get none.
pub fn allowed_fast_set(ip: IpAddr, info_hash: Id20, piece_count: u32, k: usize) -> Vec<u32> {
    let IpAddr::V4(ip) = ip.to_canonical() else {
        return Vec::new();
    };
    let k = k.min(piece_count as usize);
    let mut out = Vec::with_capacity(k);
    if k == 0 {
        return out;
    }

    let masked = u32::from(ip) & 0xFFFF_FF00;
    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&masked.to_be_bytes());
    x.extend_from_slice(&info_hash.0);

    while out.len() < k {
        let mut h = sha1w::Sha1::new();
        h.update(&x);
        let digest = h.finish();
        x.clear();
        x.extend_from_slice(&digest);
        for chunk in digest.chunks_exact(4) {
            if out.len() >= k {
                break;
            }
            let y = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let index = y % piece_count;
            if !out.contains(&index) {
                out.push(index);
            }
        }
    }
    out
}
