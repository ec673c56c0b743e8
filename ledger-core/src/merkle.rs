//! Deterministic binary Merkle tree over a sorted set of hashes.
//!
//! Pairs are reduced left-to-right, duplicating the last leaf when a level
//! has odd cardinality. Proofs are built by walking from a leaf to the
//! root and recording each sibling plus a bit per level marking whether
//! the leaf was the left or right child, so the proof can be replayed
//! without the rest of the tree.

use serde::{Deserialize, Serialize};
use shared::Hash256;

/// One level of sibling hashes plus the bit encoding (`positionInTotalSet`)
/// of which side the proven element sat on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// `leaves[0]` is the element being proven; `leaves[1..]` are its
    /// siblings from the bottom of the tree to the top.
    pub leaves: Vec<Hash256>,
    /// Bit `i` is set when, at level `i`, the proven node was the right
    /// child (its sibling `leaves[i + 1]` therefore belongs on the left).
    pub position_in_total_set: u64,
}

fn parent_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    Hash256::sha256_concat(&[left.to_hex().as_bytes(), right.to_hex().as_bytes()])
}

/// Builds a Merkle tree bottom-up from a set of leaves and returns each
/// level, from leaves (index 0) to the single-element root level (last
/// index). An empty input yields `vec![vec![Hash256::zero()]]`.
#[must_use]
pub fn build_levels(leaves: &[Hash256]) -> Vec<Vec<Hash256>> {
    if leaves.is_empty() {
        return vec![vec![Hash256::zero()]];
    }

    let mut levels = vec![leaves.to_vec()];
    loop {
        let current = levels.last().expect("levels is never empty");
        if current.len() == 1 {
            break;
        }
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        let mut i = 0;
        while i < current.len() {
            let left = &current[i];
            let right = if i + 1 < current.len() {
                &current[i + 1]
            } else {
                left
            };
            next.push(parent_hash(left, right));
            i += 2;
        }
        levels.push(next);
    }
    levels
}

/// Computes the Merkle root over `leaves`, using `Hash256::zero()` for an
/// empty set (e.g. a coinbase-only block's transaction root).
#[must_use]
pub fn root(leaves: &[Hash256]) -> Hash256 {
    let levels = build_levels(leaves);
    levels.last().expect("levels is never empty")[0]
}

/// Builds an inclusion proof for `leaves[index]`.
///
/// # Errors
/// Returns `None` if `index` is out of range.
#[must_use]
pub fn make_proof(leaves: &[Hash256], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }
    let levels = build_levels(leaves);
    let mut proof_leaves = vec![leaves[index]];
    let mut position: u64 = 0;
    let mut idx = index;

    for (level, current) in levels.iter().enumerate() {
        if current.len() == 1 {
            break;
        }
        let is_right = idx % 2 == 1;
        let sibling_idx = if is_right {
            idx - 1
        } else if idx + 1 < current.len() {
            idx + 1
        } else {
            idx
        };
        proof_leaves.push(current[sibling_idx]);
        if is_right {
            position |= 1 << level;
        }
        idx /= 2;
    }

    Some(MerkleProof {
        leaves: proof_leaves,
        position_in_total_set: position,
    })
}

/// Reconstructs the root implied by `proof`, without access to the rest of
/// the tree. The caller compares the result to the expected root.
#[must_use]
pub fn reconstruct_root(proof: &MerkleProof) -> Hash256 {
    if proof.leaves.is_empty() {
        return Hash256::zero();
    }
    if proof.leaves.len() == 1 {
        return proof.leaves[0];
    }

    let proving = proof.leaves[0];
    let first_sibling = proof.leaves[1];
    let mut current = if proof.position_in_total_set % 2 == 0 {
        parent_hash(&proving, &first_sibling)
    } else {
        parent_hash(&first_sibling, &proving)
    };

    let mut position_in_layer = proof.position_in_total_set >> 1;
    for sibling in &proof.leaves[2..] {
        current = if position_in_layer % 2 == 0 {
            parent_hash(&current, sibling)
        } else {
            parent_hash(sibling, &current)
        };
        position_in_layer >>= 1;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(b: u8) -> Hash256 {
        Hash256::sha256(&[b])
    }

    /// `parent_hash` as a free function over hex strings, for vectors
    /// whose leaves are arbitrary-precision hex values rather than
    /// 32-byte hashes and so can't round-trip through `Hash256`.
    fn combine(left: &str, right: &str) -> String {
        Hash256::sha256_concat(&[left.as_bytes(), right.as_bytes()]).to_hex()
    }

    #[test]
    fn scenario_five_merkle_root_matches_the_documented_proof() {
        let val = "abc381023c383def";
        let val2 = "bac391045cee3dfe";
        let val3 = "cdc381023c383dbe";
        let val4 = "cac391045cee3dee";

        // Ascending numeric order over the four leaves: val < val2 < val4 < val3.
        let root_sibling = combine(val, val2);
        assert_eq!(
            root_sibling,
            "639d30b6811f703aac5a8296e4878e7ab6eeadf9b05e2821390ed0776bdd96be"
        );
        let val3_sibling = combine(val4, val3);

        let tree_root = combine(&root_sibling, &val3_sibling);
        assert_eq!(
            tree_root,
            "381529cb817f5faeee8131a2db231b938c6fbb80b6908bcded60edc87c4ed405"
        );

        // Serialized inclusion proof for val3: itself, its sibling pair,
        // the other pair's root, and finally the full tree root, with
        // position 3 marking it as the right child at both levels.
        let proof_leaves = [val3, val4, root_sibling.as_str(), tree_root.as_str()];
        let position: u64 = 3;

        let mut current = if position % 2 == 0 {
            combine(proof_leaves[0], proof_leaves[1])
        } else {
            combine(proof_leaves[1], proof_leaves[0])
        };
        let mut position_in_layer = position >> 1;
        for sibling in &proof_leaves[2..] {
            current = if position_in_layer % 2 == 0 {
                combine(&current, sibling)
            } else {
                combine(sibling, &current)
            };
            position_in_layer >>= 1;
        }

        assert_eq!(
            current,
            "ce47e3721c8ce17cf3f81f131f39cd480ae12ca74e8955503a45a0595897b59a"
        );
    }

    #[test]
    fn single_leaf_tree_has_root_equal_to_leaf() {
        let leaves = vec![leaf(1)];
        assert_eq!(root(&leaves), leaves[0]);
    }

    #[test]
    fn empty_set_has_zero_root() {
        assert_eq!(root(&[]), Hash256::zero());
    }

    #[test]
    fn proof_round_trips_for_every_leaf_in_even_tree() {
        let leaves: Vec<Hash256> = (0..8).map(leaf).collect();
        let expected_root = root(&leaves);
        for i in 0..leaves.len() {
            let proof = make_proof(&leaves, i).unwrap();
            assert_eq!(reconstruct_root(&proof), expected_root, "leaf {i}");
        }
    }

    #[test]
    fn proof_round_trips_for_every_leaf_in_odd_tree() {
        let leaves: Vec<Hash256> = (0..5).map(leaf).collect();
        let expected_root = root(&leaves);
        for i in 0..leaves.len() {
            let proof = make_proof(&leaves, i).unwrap();
            assert_eq!(reconstruct_root(&proof), expected_root, "leaf {i}");
        }
    }

    #[test]
    fn proof_for_out_of_range_index_is_none() {
        let leaves: Vec<Hash256> = (0..3).map(leaf).collect();
        assert!(make_proof(&leaves, 3).is_none());
    }

    #[test]
    fn proof_first_leaf_is_the_proven_element() {
        let leaves: Vec<Hash256> = (0..4).map(leaf).collect();
        let proof = make_proof(&leaves, 2).unwrap();
        assert_eq!(proof.leaves[0], leaves[2]);
    }
}
