//! Fixed-width registry object identifiers.

use std::fmt;

pub const OBJECT_ID_LEN: usize = 20;

const FILLER: u8 = b'_';

/// 20-byte registry id: the identity's bytes right-padded with `_`, truncated
/// when longer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub fn from_identity(identity: &str) -> Self {
        let mut bytes = [FILLER; OBJECT_ID_LEN];
        let src = identity.as_bytes();
        let len = src.len().min(OBJECT_ID_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        ObjectId(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; OBJECT_ID_LEN] = raw.try_into().ok()?;
        Some(ObjectId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Inverse of [`ObjectId::from_identity`] for identities without trailing `_`.
    pub fn identity(&self) -> String {
        let end = self
            .0
            .iter()
            .rposition(|&b| b != FILLER)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:?})", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_short_identity() {
        let id = ObjectId::from_identity("corp_actions");
        assert_eq!(id.as_bytes(), b"corp_actions________");
        assert_eq!(id.identity(), "corp_actions");
    }

    #[test]
    fn truncates_long_identity() {
        let id = ObjectId::from_identity("a_very_long_dataset_identity");
        assert_eq!(id.as_bytes(), b"a_very_long_dataset_");
        assert_eq!(id.identity(), "a_very_long_dataset");
    }

    #[test]
    fn same_identity_same_id() {
        assert_eq!(ObjectId::from_identity("bars"), ObjectId::from_identity("bars"));
        assert_ne!(ObjectId::from_identity("bars"), ObjectId::from_identity("bars2"));
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::from_identity("bars");
        assert_eq!(ObjectId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(ObjectId::from_hex("abcd"), None);
        assert_eq!(ObjectId::from_hex("zz"), None);
    }
}
