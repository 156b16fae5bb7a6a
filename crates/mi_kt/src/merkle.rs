//! RFC 6962 Merkle tree hashing and proofs.
//!
//! Hashing:
//!   leaf  = SHA256(0x00 || leaf_data)
//!   node  = SHA256(0x01 || left || right)
//!
//! The tree hash splits at the largest power of two strictly below `n`.
//! The log keeps precomputed roots of every complete `2^l`-sized subtree
//! (`pow2_levels`), which the recursion consults so proof generation stays
//! near-logarithmic once the log grows.

use mi_crypto::hash::sha256;

pub type Hash32 = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn hash_leaf(leaf_data: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(1 + leaf_data.len());
    buf.push(LEAF_PREFIX);
    buf.extend_from_slice(leaf_data);
    sha256(&buf)
}

pub fn hash_node(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 1 + 32 + 32];
    buf[0] = NODE_PREFIX;
    buf[1..33].copy_from_slice(left);
    buf[33..].copy_from_slice(right);
    sha256(&buf)
}

/// Root of the empty tree: SHA256 of the empty string.
pub fn empty_root() -> Hash32 {
    sha256(&[])
}

fn largest_power_of_two_less_than(n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let mut k = 1;
    while (k << 1) < n {
        k <<= 1;
    }
    k
}

/// MTH(D[start : start+n]), consulting the cached power-of-two levels.
pub(crate) fn tree_hash(
    leaves: &[Hash32],
    pow2_levels: &[Vec<Hash32>],
    start: usize,
    n: usize,
) -> Hash32 {
    if n == 0 {
        return empty_root();
    }
    if n == 1 {
        return leaves[start];
    }
    if n.is_power_of_two() {
        let level = n.trailing_zeros() as usize;
        let idx = start >> level;
        let vec_idx = level - 1;
        if vec_idx < pow2_levels.len() && idx < pow2_levels[vec_idx].len() {
            return pow2_levels[vec_idx][idx];
        }
    }
    let k = largest_power_of_two_less_than(n);
    let left = tree_hash(leaves, pow2_levels, start, k);
    let right = tree_hash(leaves, pow2_levels, start + k, n - k);
    hash_node(&left, &right)
}

/// PATH(m, D[start : start+n]) per RFC 6962 §2.1.1, ordered leaf to root.
pub(crate) fn audit_path(
    m: usize,
    leaves: &[Hash32],
    pow2_levels: &[Vec<Hash32>],
    start: usize,
    n: usize,
) -> Vec<Hash32> {
    if n <= 1 {
        return Vec::new();
    }
    let k = largest_power_of_two_less_than(n);
    if m < k {
        let mut path = audit_path(m, leaves, pow2_levels, start, k);
        path.push(tree_hash(leaves, pow2_levels, start + k, n - k));
        path
    } else {
        let mut path = audit_path(m - k, leaves, pow2_levels, start + k, n - k);
        path.push(tree_hash(leaves, pow2_levels, start, k));
        path
    }
}

/// SUBPROOF(m, D[start : start+n], b) per RFC 6962 §2.1.2.
fn subproof(
    m: usize,
    leaves: &[Hash32],
    pow2_levels: &[Vec<Hash32>],
    start: usize,
    n: usize,
    b: bool,
) -> Vec<Hash32> {
    if m == n {
        if b {
            return Vec::new();
        }
        return vec![tree_hash(leaves, pow2_levels, start, n)];
    }
    let k = largest_power_of_two_less_than(n);
    if m <= k {
        let mut proof = subproof(m, leaves, pow2_levels, start, k, b);
        proof.push(tree_hash(leaves, pow2_levels, start + k, n - k));
        proof
    } else {
        let mut proof = subproof(m - k, leaves, pow2_levels, start + k, n - k, false);
        proof.push(tree_hash(leaves, pow2_levels, start, k));
        proof
    }
}

/// PROOF(m, D[0:n]): consistency between tree sizes `m` and `n`.
pub(crate) fn consistency_proof(
    m: usize,
    leaves: &[Hash32],
    pow2_levels: &[Vec<Hash32>],
    start: usize,
    n: usize,
) -> Vec<Hash32> {
    if m == 0 || m == n {
        return Vec::new();
    }
    subproof(m, leaves, pow2_levels, start, n, true)
}

/// Verify an inclusion proof (RFC 9162 §2.1.3.2).
///
/// `path` is ordered leaf to root, exactly as produced by the log.
pub fn verify_audit_path(
    leaf_hash: &Hash32,
    leaf_index: u64,
    tree_size: u64,
    path: &[Hash32],
    root: &Hash32,
) -> bool {
    if leaf_index >= tree_size {
        return false;
    }
    let mut fnode = leaf_index;
    let mut snode = tree_size - 1;
    let mut r = *leaf_hash;
    for p in path {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            r = hash_node(p, &r);
            if fnode & 1 == 0 {
                while fnode != 0 && fnode & 1 == 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            r = hash_node(&r, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && r == *root
}

/// Verify a consistency proof between sizes `old_size` and `new_size`
/// (RFC 9162 §2.1.4.2).
pub fn verify_consistency(
    old_size: u64,
    new_size: u64,
    proof: &[Hash32],
    old_root: &Hash32,
    new_root: &Hash32,
) -> bool {
    if old_size > new_size {
        return false;
    }
    if old_size == new_size {
        return proof.is_empty() && old_root == new_root;
    }
    if old_size == 0 {
        // Anything is consistent with the empty tree.
        return proof.is_empty();
    }

    let mut walk = proof.iter();
    // An old size that is an exact power of two contributes its own root
    // as the implicit first proof element.
    let first = if old_size.is_power_of_two() {
        *old_root
    } else {
        match walk.next() {
            Some(h) => *h,
            None => return false,
        }
    };

    let mut fnode = old_size - 1;
    let mut snode = new_size - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }
    let mut fr = first;
    let mut sr = first;

    for c in walk {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = hash_node(c, &fr);
            sr = hash_node(c, &sr);
            if fnode & 1 == 0 {
                while fnode != 0 && fnode & 1 == 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            sr = hash_node(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    snode == 0 && fr == *old_root && sr == *new_root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash32> {
        (0..n)
            .map(|i| hash_leaf(format!("leaf-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn empty_tree_root_is_hash_of_nothing() {
        assert_eq!(tree_hash(&[], &[], 0, 0), empty_root());
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let l = leaves(1);
        assert_eq!(tree_hash(&l, &[], 0, 1), l[0]);
    }

    #[test]
    fn audit_paths_verify_at_every_index() {
        for n in [1usize, 2, 3, 5, 8, 13, 64, 65] {
            let l = leaves(n);
            let root = tree_hash(&l, &[], 0, n);
            for m in 0..n {
                let path = audit_path(m, &l, &[], 0, n);
                assert!(
                    verify_audit_path(&l[m], m as u64, n as u64, &path, &root),
                    "audit path failed for leaf {m} of {n}"
                );
            }
        }
    }

    #[test]
    fn audit_path_rejects_wrong_leaf() {
        let l = leaves(8);
        let root = tree_hash(&l, &[], 0, 8);
        let path = audit_path(3, &l, &[], 0, 8);
        assert!(!verify_audit_path(&l[4], 3, 8, &path, &root));
        assert!(!verify_audit_path(&l[3], 4, 8, &path, &root));
    }

    #[test]
    fn consistency_verifies_for_all_prefixes() {
        let l = leaves(13);
        let new_root = tree_hash(&l, &[], 0, 13);
        for m in 1..13usize {
            let old_root = tree_hash(&l, &[], 0, m);
            let proof = consistency_proof(m, &l, &[], 0, 13);
            assert!(
                verify_consistency(m as u64, 13, &proof, &old_root, &new_root),
                "consistency failed for prefix {m}"
            );
        }
    }

    #[test]
    fn consistency_rejects_forked_history() {
        let l = leaves(8);
        let mut forked = l.clone();
        forked[2] = hash_leaf(b"evil");
        let old_root = tree_hash(&l, &[], 0, 4);
        let new_root = tree_hash(&forked, &[], 0, 8);
        let proof = consistency_proof(4, &forked, &[], 0, 8);
        assert!(!verify_consistency(4, 8, &proof, &old_root, &new_root));
    }
}
