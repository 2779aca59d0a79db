//! Node and user credentials.
//!
//! The engine only ever *compares* verify keys; it never signs or checks
//! signatures (the message transport below the policy layer is out of
//! scope). Keys are 32 opaque bytes rendered as lowercase hex.

use serde::Deserialize;
use serde::Serialize;
use serde::de::Error as _;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

const KEY_LEN: usize = 32;

/// Public half of a node or user keypair.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerifyKey([u8; KEY_LEN]);

impl VerifyKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != KEY_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; KEY_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }
}

impl std::fmt::Display for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyKey({self})")
    }
}

impl Serialize for VerifyKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VerifyKey {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VerifyKey::from_hex(&s).ok_or_else(|| D::Error::custom("invalid verify key hex"))
    }
}

/// Private half of a keypair. The verify key is derived by hashing the seed
/// so that identity comparisons stay stable across restarts of the same node.
#[derive(Clone)]
pub struct SigningKey {
    seed: [u8; KEY_LEN],
}

impl SigningKey {
    pub fn generate() -> Self {
        Self {
            seed: rand::random::<[u8; KEY_LEN]>(),
        }
    }

    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        Self { seed }
    }

    pub fn verify_key(&self) -> VerifyKey {
        let digest = Sha256::digest(self.seed);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        VerifyKey(bytes)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed.
        write!(f, "SigningKey({})", self.verify_key())
    }
}

/// Identifies an approving data node: `(node name, node id, verify key)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_name: String,
    pub node_id: Uuid,
    pub verify_key: VerifyKey,
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}>", self.node_name, self.node_id)
    }
}
