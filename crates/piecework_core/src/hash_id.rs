use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Fixed-size hash: info hashes, peer ids, piece hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<const N: usize>(pub [u8; N]);

impl<const N: usize> Id<N> {
    pub const fn new(from: [u8; N]) -> Id<N> {
        Id(from)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        let arr: [u8; N] = b
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected {} bytes, got {}", N, b.len()))?;
        Ok(Id(arr))
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl<const N: usize> Default for Id<N> {
    fn default() -> Self {
        Id([0; N])
    }
}

impl<const N: usize> std::fmt::Debug for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl<const N: usize> std::fmt::Display for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl<const N: usize> FromStr for Id<N> {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; N];
        if s.len() != N * 2 {
            anyhow::bail!("expected a hex string of length {}", N * 2)
        };
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id(out))
    }
}

// Serialized as hex so persisted state stays human readable.
impl<const N: usize> Serialize for Id<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de, const N: usize> Deserialize<'de> for Id<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor<const N: usize>;

        impl<const N: usize> serde::de::Visitor<'_> for IdVisitor<N> {
            type Value = Id<N>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a hex string of {} bytes", N)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != N * 2 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; N];
                match hex::decode_to_slice(v, &mut out) {
                    Ok(_) => Ok(Id(out)),
                    Err(e) => Err(E::custom(e)),
                }
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != N {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut buf = [0u8; N];
                buf.copy_from_slice(v);
                Ok(Id(buf))
            }
        }

        deserializer.deserialize_any(IdVisitor {})
    }
}

/// A 20-byte hash: v1 info hashes, peer ids, v1 piece hashes.
pub type Id20 = Id<20>;
/// A 32-byte hash: v2 piece-layer hashes.
pub type Id32 = Id<32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id32_from_str() {
        let s = "06f04cc728bef957a658876ef807f0514e4d715392969998efef584d2c3e435e";
        let ih = Id32::from_str(s).unwrap();
        assert_eq!(ih.as_string(), s);
        assert!(Id20::from_str(s).is_err());
    }

    #[test]
    fn test_serde_hex() {
        let id = Id20::new([7; 20]);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", "07".repeat(20)));
        let back: Id20 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }
}
