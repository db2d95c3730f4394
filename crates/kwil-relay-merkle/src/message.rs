//! Digests the batch signers sign off-chain to authorize escrow actions.
//!
//! Each digest is `keccak256(abi.encode(<fields>, nonce, contract))` and must
//! match the escrow contract's own computation byte for byte.

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolValue;

use crate::keccak;

/// Authorizes posting `root` with a total of `amount`.
pub fn post_reward_message_hash(root: B256, amount: U256, nonce: U256, contract: Address) -> B256 {
    let encoded = (root, amount, nonce, contract).abi_encode_params();
    keccak(&[encoded.as_slice()])
}

/// Authorizes changing the poster fee to `fee`.
pub fn update_poster_fee_message_hash(fee: U256, nonce: U256, contract: Address) -> B256 {
    let encoded = (fee, nonce, contract).abi_encode_params();
    keccak(&[encoded.as_slice()])
}

/// Authorizes replacing the signer set.
pub fn update_signers_message_hash(
    signers: &[Address],
    threshold: u8,
    nonce: U256,
    contract: Address,
) -> B256 {
    let encoded = (signers.to_vec(), U256::from(threshold), nonce, contract).abi_encode_params();
    keccak(&[encoded.as_slice()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwil_relay_types::hex_to_b256;

    fn vectors() -> serde_json::Value {
        let data = include_str!("../../../tests/vectors/rewards.json");
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn test_message_hashes_match_contract() {
        let vectors = vectors();
        let escrow: Address = vectors["escrow"].as_str().unwrap().parse().unwrap();
        let root = hex_to_b256(vectors["tree_with_3_leaves"]["root"].as_str().unwrap()).unwrap();
        let msg = &vectors["message_hashes"];
        let nonce = U256::from(msg["nonce"].as_u64().unwrap());

        let amount: U256 = msg["post_reward"]["amount"].as_str().unwrap().parse().unwrap();
        assert_eq!(
            post_reward_message_hash(root, amount, nonce, escrow),
            hex_to_b256(msg["post_reward"]["hash"].as_str().unwrap()).unwrap()
        );

        let fee: U256 = msg["update_poster_fee"]["fee"].as_str().unwrap().parse().unwrap();
        assert_eq!(
            update_poster_fee_message_hash(fee, nonce, escrow),
            hex_to_b256(msg["update_poster_fee"]["hash"].as_str().unwrap()).unwrap()
        );

        let signers: Vec<Address> = msg["update_signers"]["signers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().parse().unwrap())
            .collect();
        let threshold = msg["update_signers"]["threshold"].as_u64().unwrap() as u8;
        assert_eq!(
            update_signers_message_hash(&signers, threshold, nonce, escrow),
            hex_to_b256(msg["update_signers"]["hash"].as_str().unwrap()).unwrap()
        );
    }

    #[test]
    fn test_nonce_changes_digest() {
        let root = B256::repeat_byte(0x01);
        let contract = Address::repeat_byte(0x02);
        assert_ne!(
            post_reward_message_hash(root, U256::from(1u64), U256::from(0u64), contract),
            post_reward_message_hash(root, U256::from(1u64), U256::from(1u64), contract)
        );
    }
}
