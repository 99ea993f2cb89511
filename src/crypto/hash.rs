// Cryptographic Hashing Wrappers
use sha2::{Digest, Sha256};

/// SHA-256: the only digest used for ids, headers and Velora seeding
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256: used for Base58Check checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// SHA-256 Concat: hashes a then b without allocating a temporary Vec
pub fn sha256_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Merkle root over 32-byte leaves (transaction ids).
///
/// Pairs are concatenated left-to-right, the last leaf is duplicated when a
/// level is odd, and a single-leaf tree is its own root.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return sha256(&[]);
    }

    let mut current_level: Vec<[u8; 32]> = leaves.to_vec();

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));
        for chunk in current_level.chunks(2) {
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next_level.push(sha256_concat(&chunk[0], right));
        }
        current_level = next_level;
    }

    current_level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("abc")
        let h = sha256(b"abc");
        assert_eq!(
            hex::encode(h),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_double_sha256_differs() {
        assert_ne!(sha256(b"pastella"), double_sha256(b"pastella"));
        assert_eq!(double_sha256(b"pastella"), sha256(&sha256(b"pastella")));
    }

    #[test]
    fn test_merkle_single_leaf_is_root() {
        let leaf = sha256(b"only");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_merkle_odd_duplicates_last() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");

        let ab = sha256_concat(&a, &b);
        let cc = sha256_concat(&c, &c);
        let expected = sha256_concat(&ab, &cc);

        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_merkle_order_matters() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
