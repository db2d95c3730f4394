//! Reward Merkle tree compatible with the OpenZeppelin Standard Merkle Tree.
//!
//! - Leaf value: `keccak256(abi.encode(address recipient, uint256 amount, address escrow, uint256 height))`
//! - Standard leaf hash: `keccak256(leaf_value)`
//! - Node hash: `keccak256(min(a, b) || max(a, b))`
//! - Layout: leaf hashes sorted ascending, stored at the tail of a `2n - 1` heap array

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolValue;
use num_bigint::BigUint;
use serde::Serialize;
use sha3::{Digest, Keccak256};

use kwil_relay_types::{bytes_to_hex, Hex, RelayError, Result};

pub mod message;

/// ABI types of one reward leaf, in encoding order.
pub const LEAF_ENCODING: [&str; 4] = ["address", "uint256", "address", "uint256"];

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak(parts: &[&[u8]]) -> B256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    B256::from_slice(&hasher.finalize())
}

/// One `(recipient, amount, escrow, height)` entry of a reward tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardLeaf {
    pub recipient: Address,
    pub amount: U256,
    pub contract: Address,
    pub source_height: U256,
}

impl RewardLeaf {
    /// `keccak256(abi.encode(...))`, the value the contract re-derives on claim.
    pub fn value(&self) -> B256 {
        let encoded =
            (self.recipient, self.amount, self.contract, self.source_height).abi_encode_params();
        keccak(&[encoded.as_slice()])
    }

    /// Leaf as stored in the tree (the value hashed once more).
    pub fn hash(&self) -> B256 {
        standard_leaf_hash(self.value())
    }
}

pub fn standard_leaf_hash(value: B256) -> B256 {
    keccak(&[value.as_slice()])
}

/// Commutative pair hash: the smaller word goes first.
pub fn hash_pair(a: B256, b: B256) -> B256 {
    if a <= b {
        keccak(&[a.as_slice(), b.as_slice()])
    } else {
        keccak(&[b.as_slice(), a.as_slice()])
    }
}

/// Fold a proof from `leaf` up to a root.
pub fn process_proof(leaf: B256, proof: &[B256]) -> B256 {
    proof.iter().fold(leaf, |acc, sibling| hash_pair(acc, *sibling))
}

pub fn verify(root: B256, leaf: B256, proof: &[B256]) -> bool {
    process_proof(leaf, proof) == root
}

/// A membership proof for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewardProof {
    /// Sibling hashes from leaf to root.
    pub proof: Vec<B256>,
    /// Standard leaf hash of the recipient's entry.
    pub leaf: B256,
}

/// In-memory reward tree.
#[derive(Debug, Clone)]
pub struct RewardTree {
    /// Heap layout: node `i` has children `2i + 1` and `2i + 2`.
    tree: Vec<B256>,
    /// Entries in input order, with their position in `tree`.
    values: Vec<(RewardLeaf, usize)>,
}

impl RewardTree {
    /// Build a tree from already-assembled leaves. Fails on empty input.
    pub fn new(leaves: Vec<RewardLeaf>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(RelayError::InvalidArgument(
                "reward tree requires at least one leaf".into(),
            ));
        }

        let mut hashed: Vec<(B256, usize)> = leaves
            .iter()
            .enumerate()
            .map(|(i, leaf)| (leaf.hash(), i))
            .collect();
        hashed.sort_by(|a, b| a.0.cmp(&b.0));

        let n = hashed.len();
        let mut tree = vec![B256::ZERO; 2 * n - 1];
        let mut tree_index = vec![0usize; n];
        for (slot, (hash, value_index)) in hashed.into_iter().enumerate() {
            let pos = tree.len() - 1 - slot;
            tree[pos] = hash;
            tree_index[value_index] = pos;
        }
        for i in (0..tree.len() - n).rev() {
            tree[i] = hash_pair(tree[2 * i + 1], tree[2 * i + 2]);
        }

        let values = leaves.into_iter().zip(tree_index).collect();
        Ok(Self { tree, values })
    }

    pub fn root(&self) -> B256 {
        self.tree[0]
    }

    pub fn root_hex(&self) -> Hex {
        bytes_to_hex(self.root().as_slice())
    }

    pub fn leaf_count(&self) -> usize {
        self.values.len()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &RewardLeaf> {
        self.values.iter().map(|(leaf, _)| leaf)
    }

    /// Proof for the first entry paying `recipient`, or `None` if the
    /// address is not in the tree.
    pub fn get_proof(&self, recipient: Address) -> Option<RewardProof> {
        let (_, tree_index) = self
            .values
            .iter()
            .find(|(leaf, _)| leaf.recipient == recipient)?;
        Some(self.proof_at(*tree_index))
    }

    fn proof_at(&self, mut index: usize) -> RewardProof {
        let leaf = self.tree[index];
        let mut proof = Vec::new();
        while index > 0 {
            let sibling = if index % 2 == 1 { index + 1 } else { index - 1 };
            proof.push(self.tree[sibling]);
            index = (index - 1) / 2;
        }
        RewardProof { proof, leaf }
    }

    /// Dump in the `StandardMerkleTree.dump()` layout so other stacks can
    /// load the identical tree.
    pub fn dump(&self) -> serde_json::Value {
        let values: Vec<serde_json::Value> = self
            .values
            .iter()
            .map(|(leaf, tree_index)| {
                serde_json::json!({
                    "value": [
                        leaf.recipient.to_checksum(None),
                        leaf.amount.to_string(),
                        leaf.contract.to_checksum(None),
                        leaf.source_height.to_string(),
                    ],
                    "treeIndex": tree_index,
                })
            })
            .collect();
        serde_json::json!({
            "format": "standard-v1",
            "leafEncoding": LEAF_ENCODING,
            "tree": self.tree.iter().map(|h| bytes_to_hex(h.as_slice())).collect::<Vec<_>>(),
            "values": values,
        })
    }
}

/// Build the reward tree for one batch and return it with the batch total.
///
/// The total is accumulated without an upper bound so that large batches
/// cannot overflow.
pub fn build_tree(
    recipients: &[Address],
    amounts: &[U256],
    escrow: Address,
    source_height: U256,
) -> Result<(RewardTree, BigUint)> {
    if recipients.len() != amounts.len() {
        return Err(RelayError::InvalidArgument(format!(
            "recipients and amounts length mismatch: {} != {}",
            recipients.len(),
            amounts.len()
        )));
    }

    let mut total = BigUint::default();
    let leaves = recipients
        .iter()
        .zip(amounts)
        .map(|(recipient, amount)| {
            total += BigUint::from_bytes_be(&amount.to_be_bytes::<32>());
            RewardLeaf {
                recipient: *recipient,
                amount: *amount,
                contract: escrow,
                source_height,
            }
        })
        .collect();

    let tree = RewardTree::new(leaves)?;
    Ok((tree, total))
}

/// Convenience wrapper for [`RewardTree::get_proof`].
pub fn get_proof(tree: &RewardTree, recipient: Address) -> Option<RewardProof> {
    tree.get_proof(recipient)
}
