//! Record keys and digest computation.

use sha1::{Digest, Sha1};

use crate::error::{HiveError, Result};
use crate::protocol::DIGEST_SIZE;
use crate::value::Value;

/// Number of partitions a namespace is split into.
pub const PARTITIONS: usize = 4096;

/// Identifies a record: `(namespace, set, user key)` plus the 20-byte digest
/// derived from `(set, user key)`. Digest equality defines record identity on
/// the wire; the user key itself is never sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub namespace: String,
    pub set_name: String,
    pub user_key: Value,
    pub digest: [u8; DIGEST_SIZE],
}

impl Key {
    pub fn new(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Result<Key> {
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = compute_digest(&set_name, &user_key)?;
        Ok(Key {
            namespace: namespace.into(),
            set_name,
            user_key,
            digest,
        })
    }

    /// Reconstructs a key from a digest received on the wire. The user key is
    /// unknown in this case.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Key {
        Key {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: Value::Nil,
            digest,
        }
    }

    /// The partition this key hashes to. Derived from the first two digest
    /// bytes, little-endian, masked to the partition count.
    pub fn partition_id(&self) -> usize {
        (self.digest[0] as usize | (self.digest[1] as usize) << 8) & (PARTITIONS - 1)
    }
}

/// Computes the 20-byte digest of `(set, user_key)`.
///
/// The hash covers the set name, the key's particle type tag, and the key's
/// particle encoding, so identical values of different types never collide.
pub fn compute_digest(set_name: &str, user_key: &Value) -> Result<[u8; DIGEST_SIZE]> {
    match user_key {
        Value::Int(_) | Value::Uint(_) | Value::Str(_) | Value::Bytes(_) => {}
        other => {
            return Err(HiveError::Serialize(format!(
                "{} cannot be used as a key",
                other
            )))
        }
    }
    let mut hasher = Sha1::new();
    hasher.update(set_name.as_bytes());
    hasher.update([user_key.particle_type()]);
    let mut encoded = Vec::with_capacity(user_key.encoded_size());
    user_key.write_to(&mut encoded);
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_20_bytes_and_deterministic() {
        let a = Key::new("ns", "set", "mykey").unwrap();
        let b = Key::new("ns", "set", "mykey").unwrap();
        assert_eq!(a.digest.len(), 20);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_digest_ignores_namespace() {
        let a = Key::new("ns1", "set", "mykey").unwrap();
        let b = Key::new("ns2", "set", "mykey").unwrap();
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_digest_distinguishes_set_and_type() {
        let a = Key::new("ns", "set1", "k").unwrap();
        let b = Key::new("ns", "set2", "k").unwrap();
        assert_ne!(a.digest, b.digest);

        let s = Key::new("ns", "set", "1").unwrap();
        let i = Key::new("ns", "set", 1i64).unwrap();
        assert_ne!(s.digest, i.digest);
    }

    #[test]
    fn test_partition_id_in_range() {
        for k in 0..100i64 {
            let key = Key::new("ns", "set", k).unwrap();
            assert!(key.partition_id() < PARTITIONS);
        }
    }

    #[test]
    fn test_collection_keys_rejected() {
        assert!(Key::new("ns", "set", Value::List(vec![])).is_err());
        assert!(Key::new("ns", "set", Value::Nil).is_err());
    }
}
