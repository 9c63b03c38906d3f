// Wrapper for the hash libraries.
// Piece hashing is the majority of CPU usage of the engine, so the backend is
// chosen at compile time. openssl tends to be faster, crypto-hash uses whatever
// the platform provides.

#[cfg(feature = "sha1-openssl")]
pub type Sha1 = Sha1Openssl;
#[cfg(feature = "sha1-openssl")]
pub type Sha256 = Sha256Openssl;

#[cfg(all(feature = "sha1-crypto-hash", not(feature = "sha1-openssl")))]
pub type Sha1 = Sha1System;
#[cfg(all(feature = "sha1-crypto-hash", not(feature = "sha1-openssl")))]
pub type Sha256 = Sha256System;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

pub trait ISha256 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 32];
}

#[cfg(feature = "sha1-openssl")]
pub struct Sha1Openssl {
    inner: openssl::sha::Sha1,
}

#[cfg(feature = "sha1-openssl")]
impl ISha1 for Sha1Openssl {
    fn new() -> Self {
        Self {
            inner: openssl::sha::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf)
    }

    fn finish(self) -> [u8; 20] {
        self.inner.finish()
    }
}

#[cfg(feature = "sha1-openssl")]
pub struct Sha256Openssl {
    inner: openssl::sha::Sha256,
}

#[cfg(feature = "sha1-openssl")]
impl ISha256 for Sha256Openssl {
    fn new() -> Self {
        Self {
            inner: openssl::sha::Sha256::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        self.inner.update(buf)
    }

    fn finish(self) -> [u8; 32] {
        self.inner.finish()
    }
}

#[cfg(feature = "sha1-crypto-hash")]
fn finish_system<const N: usize>(hasher: crypto_hash::Hasher) -> [u8; N] {
    let mut hasher = hasher;
    let result = hasher.finish();
    debug_assert_eq!(result.len(), N);
    let mut out = [0u8; N];
    out.copy_from_slice(&result);
    out
}

#[cfg(feature = "sha1-crypto-hash")]
pub struct Sha1System {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha1-crypto-hash")]
impl ISha1 for Sha1System {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA1),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        // Writing into an in-memory hasher does not fail.
        let _ = self.inner.write_all(buf);
    }

    fn finish(self) -> [u8; 20] {
        finish_system(self.inner)
    }
}

#[cfg(feature = "sha1-crypto-hash")]
pub struct Sha256System {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha1-crypto-hash")]
impl ISha256 for Sha256System {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA256),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        let _ = self.inner.write_all(buf);
    }

    fn finish(self) -> [u8; 32] {
        finish_system(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_abc() {
        let mut h = Sha1::new();
        h.update(b"a");
        h.update(b"bc");
        let expected = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(h.finish(), expected);
    }

    #[test]
    fn test_sha256_empty() {
        let h = Sha256::new();
        let out = h.finish();
        assert_eq!(out[..4], [0xe3, 0xb0, 0xc4, 0x42]);
    }
}
