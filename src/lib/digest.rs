//! Opaque identifiers for captured filesystem trees.

/// Identifies the contents of a tree held in a [`Store`](crate::store::Store).
///
/// Two digests are equal exactly when the trees they identify have the same contents. Nothing
/// outside the store should look inside one.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct Digest {
    fingerprint: String,
    size: u64,
}

impl Digest {
    /// The digest of a tree with no entries.
    pub fn empty() -> Self {
        Self::of_bytes(crate::store::EMPTY_MANIFEST)
    }

    /// Whether this is the digest of the empty tree.
    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    pub(crate) fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            fingerprint: sha256::digest(bytes),
            size: bytes.len() as u64,
        }
    }

    pub(crate) fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.fingerprint, self.size)
    }
}
