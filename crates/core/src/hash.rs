use sha2::{Digest, Sha256};

/// SHA-256 over the serialized snapshot bytes, recorded in the history entry
/// so a downloaded document can be checked against what was uploaded.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    hex::encode(digest)
}
